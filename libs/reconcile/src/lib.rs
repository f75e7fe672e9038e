//! Watch-loop primitives.
//!
//! This library provides the pieces shared by long-lived reconciliation
//! loops that consume a time-bounded event subscription:
//!
//! - **Loop phase**: the `Disconnected -> Watching -> Draining` state machine
//!   and the transitions it allows.
//! - **Backoff**: jittered exponential delay between failed subscribe
//!   attempts.
//!
//! # Invariants
//!
//! - `Draining` is terminal; nothing leaves it
//! - A loop always starts `Disconnected`
//! - Backoff delays never exceed the configured maximum plus jitter

use std::time::Duration;

use rand::Rng;
use thiserror::Error;

/// Loop phase errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PhaseError {
    /// The requested transition is not part of the state machine.
    #[error("illegal transition from {from} to {to}")]
    IllegalTransition { from: LoopPhase, to: LoopPhase },
}

/// Phase of a watch loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoopPhase {
    /// No subscription is open; the next step is to open one.
    #[default]
    Disconnected,

    /// A subscription is open and events are being consumed.
    Watching,

    /// Cancellation was requested; the loop is exiting.
    Draining,
}

impl LoopPhase {
    /// Returns true if the loop has reached its terminal phase.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Draining)
    }

    /// Check whether moving to `next` is allowed.
    ///
    /// Re-entering the current phase is allowed for `Disconnected` (a failed
    /// subscribe) and `Watching` (an event was handled).
    pub fn can_transition_to(&self, next: LoopPhase) -> bool {
        use LoopPhase::*;
        matches!(
            (self, next),
            (Disconnected, Disconnected)
                | (Disconnected, Watching)
                | (Disconnected, Draining)
                | (Watching, Watching)
                | (Watching, Disconnected)
                | (Watching, Draining)
        )
    }

    /// Move to `next`, rejecting transitions the state machine does not have.
    pub fn transition(&mut self, next: LoopPhase) -> Result<(), PhaseError> {
        if !self.can_transition_to(next) {
            return Err(PhaseError::IllegalTransition {
                from: *self,
                to: next,
            });
        }
        *self = next;
        Ok(())
    }
}

impl std::fmt::Display for LoopPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoopPhase::Disconnected => write!(f, "disconnected"),
            LoopPhase::Watching => write!(f, "watching"),
            LoopPhase::Draining => write!(f, "draining"),
        }
    }
}

/// Backoff policy for re-opening a subscription.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Base delay for first retry.
    pub base: Duration,

    /// Maximum delay.
    pub max: Duration,

    /// Jitter factor (0.0 to 1.0).
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            max: DEFAULT_WATCH_REFRESH,
            jitter: 0.25,
        }
    }
}

impl BackoffPolicy {
    /// Policy with the given ceiling and default base and jitter.
    pub fn capped(max: Duration) -> Self {
        Self {
            max,
            ..Self::default()
        }
    }

    /// Calculate delay for the given attempt number (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.min(30) as i32;
        let delay = self.base.as_millis() as f64 * 2.0_f64.powi(exp);
        let delay = delay.min(self.max.as_millis() as f64);

        let jitter_range = delay * self.jitter.clamp(0.0, 1.0);
        let jitter = if jitter_range > 0.0 {
            rand::rng().random_range(-jitter_range..=jitter_range)
        } else {
            0.0
        };

        Duration::from_millis((delay + jitter).max(0.0) as u64)
    }
}

/// Default interval after which an idle subscription is discarded and reopened.
pub const DEFAULT_WATCH_REFRESH: Duration = Duration::from_secs(2 * 60);

/// Default server-side timeout requested when opening a subscription.
pub const DEFAULT_WATCH_TIMEOUT: Duration = Duration::from_secs(290);
