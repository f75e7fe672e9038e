//! Reconciliation loop for node label events.
//!
//! The reconciler:
//! - Opens a label subscription, retrying with backoff when that fails
//! - Feeds each event through the event handler, one at a time
//! - Drops and reopens the subscription when it closes, errors, or has been
//!   idle for the refresh interval
//! - Stops as soon as the shutdown signal fires, abandoning in-flight work

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use kured_reconcile::{BackoffPolicy, LoopPhase, DEFAULT_WATCH_REFRESH};
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use crate::handler::EventHandler;
use crate::store::SilenceStore;
use crate::watch::{Subscription, WatchSource};

/// Reconciliation loop configuration.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Idle period after which the subscription is reopened.
    pub watch_refresh: Duration,

    /// Delay policy between failed subscribe attempts.
    pub backoff: BackoffPolicy,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            watch_refresh: DEFAULT_WATCH_REFRESH,
            backoff: BackoffPolicy::capped(DEFAULT_WATCH_REFRESH),
        }
    }
}

/// Counters for one run of the loop.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoopStats {
    pub subscriptions_opened: u64,
    pub subscribe_failures: u64,
    pub idle_refreshes: u64,
    pub events_handled: u64,
    pub handler_errors: u64,
}

/// Single-writer reconciler owning the silence store.
pub struct Reconciler {
    source: Arc<dyn WatchSource>,
    handler: EventHandler,
    store: SilenceStore,
    config: ReconcilerConfig,
    phase: LoopPhase,
    stats: LoopStats,
}

impl Reconciler {
    /// Create a reconciler with an empty store.
    pub fn new(source: Arc<dyn WatchSource>, handler: EventHandler, config: ReconcilerConfig) -> Self {
        Self {
            source,
            handler,
            store: SilenceStore::new(),
            config,
            phase: LoopPhase::default(),
            stats: LoopStats::default(),
        }
    }

    pub fn store(&self) -> &SilenceStore {
        &self.store
    }

    pub fn phase(&self) -> LoopPhase {
        self.phase
    }

    pub fn stats(&self) -> &LoopStats {
        &self.stats
    }

    fn enter(&mut self, next: LoopPhase) {
        if self.phase == next {
            return;
        }
        match self.phase.transition(next) {
            Ok(()) => debug!(phase = %next, "Reconciler phase changed"),
            Err(e) => warn!(error = %e, "Ignoring reconciler phase change"),
        }
    }

    /// Run the loop until `shutdown` fires. Returns the run's counters.
    #[instrument(skip_all)]
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> LoopStats {
        if self.phase.is_terminal() {
            return self.stats.clone();
        }

        info!(
            watch_refresh_secs = self.config.watch_refresh.as_secs(),
            silence_duration_secs = self.handler.config().silence_duration.as_secs(),
            removal_buffer_secs = self.handler.config().removal_buffer.as_secs(),
            "Starting reconciliation loop"
        );

        let mut subscription: Option<Subscription> = None;
        let mut attempt = 0u32;

        loop {
            let Some(sub) = subscription.as_mut() else {
                let opened = tokio::select! {
                    result = self.source.subscribe() => result,
                    _ = cancelled(&mut shutdown) => break,
                };

                match opened {
                    Ok(sub) => {
                        attempt = 0;
                        self.stats.subscriptions_opened += 1;
                        self.enter(LoopPhase::Watching);
                        subscription = Some(sub);
                    }
                    Err(e) => {
                        self.stats.subscribe_failures += 1;
                        let delay = self.config.backoff.delay(attempt);
                        attempt = attempt.saturating_add(1);
                        warn!(
                            error = %e,
                            attempt,
                            retry_in_ms = delay.as_millis() as u64,
                            "Failed to open node watch, will retry"
                        );
                        self.enter(LoopPhase::Disconnected);

                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = cancelled(&mut shutdown) => break,
                        }
                    }
                }
                continue;
            };

            let next = tokio::select! {
                next = tokio::time::timeout(self.config.watch_refresh, sub.next()) => next,
                _ = cancelled(&mut shutdown) => break,
            };

            let event = match next {
                Err(_) => {
                    info!("refreshing watcher...");
                    self.stats.idle_refreshes += 1;
                    subscription = None;
                    self.enter(LoopPhase::Disconnected);
                    continue;
                }
                Ok(None) => {
                    info!("watcher channel closed, restarting...");
                    subscription = None;
                    self.enter(LoopPhase::Disconnected);
                    continue;
                }
                Ok(Some(Err(e))) => {
                    warn!(error = %e, "Node watch failed, restarting");
                    subscription = None;
                    self.enter(LoopPhase::Disconnected);
                    continue;
                }
                Ok(Some(Ok(event))) => event,
            };

            let result = tokio::select! {
                result = self.handler.handle(&event, &mut self.store) => result,
                _ = cancelled(&mut shutdown) => {
                    warn!(node = %event.node, kind = %event.kind, "Abandoning in-flight event on shutdown");
                    break;
                }
            };

            self.stats.events_handled += 1;
            match result {
                Ok(outcome) => {
                    debug!(node = %event.node, kind = %event.kind, outcome = ?outcome, "Event handled");
                }
                Err(e) if e.is_anomaly() => {
                    self.stats.handler_errors += 1;
                    warn!(node = %event.node, kind = %event.kind, error = %e, "Event handling anomaly");
                }
                Err(e) => {
                    self.stats.handler_errors += 1;
                    error!(node = %event.node, kind = %event.kind, error = %e, "Event handling failed");
                }
            }
        }

        self.enter(LoopPhase::Draining);
        info!(
            events_handled = self.stats.events_handled,
            tracked_nodes = self.store.len(),
            "Reconciler shutting down"
        );
        self.stats.clone()
    }
}

/// Resolves once `shutdown` is (or becomes) true, or its sender is gone.
pub async fn cancelled(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// Flip `shutdown` once `signal` fires.
///
/// If the signal cannot be listened for, the process keeps running without
/// it rather than stopping at once.
pub async fn forward_shutdown<F>(signal: F, shutdown: watch::Sender<bool>)
where
    F: Future<Output = std::io::Result<()>>,
{
    match signal.await {
        Ok(()) => {
            info!("Received shutdown signal");
            let _ = shutdown.send(true);
        }
        Err(e) => {
            error!(error = %e, "Failed to listen for shutdown signals, running until killed");
            std::future::pending::<()>().await;
        }
    }
}
