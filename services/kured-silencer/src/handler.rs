//! Label event handling.
//!
//! Turns one label event plus the current silence state into calls against
//! the alerting system and an updated state:
//! - `Added` opens a silence set for the node, unless an unexpired one is
//!   already tracked
//! - `Removed` waits out the removal buffer, then closes every tracked silence
//! - anything else is ignored

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::alertmanager::{AlertSilencer, SilencerError};
use crate::store::{SilenceId, SilenceStore};
use crate::watch::{LabelEvent, LabelEventKind};

/// Errors from handling a single event. None of them are fatal to the loop.
#[derive(Debug, Error)]
pub enum HandleError {
    #[error("failed to silence node {node}: {source}")]
    Open {
        node: String,
        #[source]
        source: SilencerError,
    },

    /// A Removed event arrived for a node with no tracked silences.
    #[error("missing node: {0}")]
    MissingNode(String),

    #[error("failed to close {} of {total} silence(s) for node {node}", .remaining.len())]
    PartialClose {
        node: String,
        total: usize,
        remaining: Vec<SilenceId>,
    },
}

impl HandleError {
    /// State-consistency anomalies, as opposed to alerting system failures.
    pub fn is_anomaly(&self) -> bool {
        matches!(self, Self::MissingNode(_))
    }
}

/// What handling an event did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// A silence set was opened and recorded.
    Silenced { silences: usize },

    /// The node already had a silence set; nothing was opened.
    AlreadySilenced,

    /// Every tracked silence was closed and the node forgotten.
    Lifted { silences: usize },

    /// The event kind needs no action.
    Ignored,
}

/// Handler settings.
#[derive(Debug, Clone)]
pub struct HandlerConfig {
    /// How long each silence lasts.
    pub silence_duration: Duration,

    /// Delay between a label's removal and lifting its silences.
    pub removal_buffer: Duration,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            silence_duration: Duration::from_secs(15 * 60),
            removal_buffer: Duration::from_secs(60),
        }
    }
}

/// Applies label events to the silence store.
pub struct EventHandler {
    silencer: Arc<dyn AlertSilencer>,
    config: HandlerConfig,
}

impl EventHandler {
    pub fn new(silencer: Arc<dyn AlertSilencer>, config: HandlerConfig) -> Self {
        Self { silencer, config }
    }

    pub fn config(&self) -> &HandlerConfig {
        &self.config
    }

    /// Handle one event against `store`.
    pub async fn handle(
        &self,
        event: &LabelEvent,
        store: &mut SilenceStore,
    ) -> Result<Outcome, HandleError> {
        match event.kind {
            LabelEventKind::Added => self.handle_added(&event.node, store).await,
            LabelEventKind::Removed => self.handle_removed(&event.node, store).await,
            LabelEventKind::Modified => Ok(Outcome::Ignored),
        }
    }

    async fn handle_added(
        &self,
        node: &str,
        store: &mut SilenceStore,
    ) -> Result<Outcome, HandleError> {
        if let Some(existing) = store.get(node) {
            let tracked = existing.len();
            let lapsed = store
                .expires_at(node)
                .is_some_and(|at| at <= Instant::now());
            if !lapsed {
                warn!(
                    node = %node,
                    silences = tracked,
                    "Label added for node that is already silenced, keeping existing silences"
                );
                return Ok(Outcome::AlreadySilenced);
            }

            // The Removed for the last reboot was missed; its silences are gone
            info!(
                node = %node,
                silences = tracked,
                "Tracked silences for node have expired, opening new ones"
            );
            store.delete(node);
        }

        let ids = self
            .silencer
            .open(self.config.silence_duration)
            .await
            .map_err(|source| HandleError::Open {
                node: node.to_string(),
                source,
            })?;

        let silences = ids.len();
        store.put_until(node, ids, Instant::now() + self.config.silence_duration);

        info!(
            node = %node,
            silences,
            duration_secs = self.config.silence_duration.as_secs(),
            "label added"
        );
        Ok(Outcome::Silenced { silences })
    }

    async fn handle_removed(
        &self,
        node: &str,
        store: &mut SilenceStore,
    ) -> Result<Outcome, HandleError> {
        if !self.config.removal_buffer.is_zero() {
            info!(
                node = %node,
                buffer_secs = self.config.removal_buffer.as_secs(),
                "Label removed, waiting before lifting silences"
            );
            tokio::time::sleep(self.config.removal_buffer).await;
        }

        let Some(ids) = store.get(node).map(<[SilenceId]>::to_vec) else {
            warn!(node = %node, "Label removed for node with no tracked silences");
            return Err(HandleError::MissingNode(node.to_string()));
        };

        let total = ids.len();
        let mut remaining = Vec::new();
        for id in ids {
            if let Err(e) = self.silencer.close(&id).await {
                error!(node = %node, silence_id = %id, error = %e, "Failed to lift silence");
                remaining.push(id);
            }
        }

        if remaining.is_empty() {
            store.delete(node);
            info!(node = %node, silences = total, "label removed");
            return Ok(Outcome::Lifted { silences: total });
        }

        // Closed ids are dropped so a later attempt only retries the failures
        match store.expires_at(node) {
            Some(at) => store.put_until(node, remaining.clone(), at),
            None => store.put(node, remaining.clone()),
        }
        Err(HandleError::PartialClose {
            node: node.to_string(),
            total,
            remaining,
        })
    }
}
