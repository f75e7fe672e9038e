//! Leader election over a Kubernetes Lease.
//!
//! Only the replica holding the lease runs the reconciliation loop. The
//! elector is a two-state machine (`Follower`, `Leader`) driven by the outcome
//! of periodic acquire-or-renew attempts:
//! - became leader: start a fresh term (new loop, new empty store)
//! - lost leadership: signal the term to stop and wait for it
//!
//! Nothing is handed over between terms. Silences opened by a previous
//! leader are only cleaned up by their own expiry.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Api, PostParams};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use crate::reconciler::cancelled;

/// Errors from lease operations.
#[derive(Debug, Error)]
pub enum LeaseError {
    #[error("lease API error: {0}")]
    Kube(#[from] kube::Error),

    /// Someone else wrote the lease between our read and write.
    #[error("lease {0} was modified concurrently")]
    Conflict(String),

    #[error("lease operation did not finish within {0:?}")]
    Timeout(Duration),
}

/// Lease contents relevant to the election.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseRecord {
    pub holder: Option<String>,
    pub lease_duration: Duration,
    pub acquired_at: Option<DateTime<Utc>>,
    pub renewed_at: Option<DateTime<Utc>>,
    pub transitions: i32,
}

impl LeaseRecord {
    pub fn is_held_by(&self, identity: &str) -> bool {
        self.holder.as_deref() == Some(identity)
    }

    fn holder(&self) -> Option<&str> {
        self.holder.as_deref().filter(|h| !h.is_empty())
    }
}

/// A lease record plus the version it was read at.
#[derive(Debug, Clone)]
pub struct ObservedLease {
    pub record: LeaseRecord,
    pub version: String,
}

/// Storage for the election lock.
#[async_trait]
pub trait LeaseLock: Send + Sync {
    async fn get(&self) -> Result<Option<ObservedLease>, LeaseError>;

    /// Create the lease; fails with `Conflict` if it already exists.
    async fn create(&self, record: &LeaseRecord) -> Result<(), LeaseError>;

    /// Overwrite the lease if it is still at `version`.
    async fn update(&self, record: &LeaseRecord, version: &str) -> Result<(), LeaseError>;

    fn describe(&self) -> String;
}

/// `coordination.k8s.io/v1` Lease lock.
pub struct KubeLeaseLock {
    api: Api<Lease>,
    namespace: String,
    name: String,
}

impl KubeLeaseLock {
    pub fn new(client: kube::Client, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        let namespace = namespace.into();
        Self {
            api: Api::namespaced(client, &namespace),
            namespace,
            name: name.into(),
        }
    }

    fn lease(&self, record: &LeaseRecord, version: Option<&str>) -> Lease {
        Lease {
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                namespace: Some(self.namespace.clone()),
                resource_version: version.map(str::to_string),
                ..ObjectMeta::default()
            },
            spec: Some(spec_from_record(record)),
        }
    }

    fn map_err(&self, e: kube::Error) -> LeaseError {
        match e {
            kube::Error::Api(ae) if ae.code == 409 => LeaseError::Conflict(self.describe()),
            e => LeaseError::Kube(e),
        }
    }
}

#[async_trait]
impl LeaseLock for KubeLeaseLock {
    async fn get(&self) -> Result<Option<ObservedLease>, LeaseError> {
        let Some(lease) = self.api.get_opt(&self.name).await? else {
            return Ok(None);
        };

        Ok(Some(ObservedLease {
            version: lease.metadata.resource_version.unwrap_or_default(),
            record: record_from_spec(lease.spec.unwrap_or_default()),
        }))
    }

    async fn create(&self, record: &LeaseRecord) -> Result<(), LeaseError> {
        self.api
            .create(&PostParams::default(), &self.lease(record, None))
            .await
            .map_err(|e| self.map_err(e))?;
        Ok(())
    }

    async fn update(&self, record: &LeaseRecord, version: &str) -> Result<(), LeaseError> {
        self.api
            .replace(&self.name, &PostParams::default(), &self.lease(record, Some(version)))
            .await
            .map_err(|e| self.map_err(e))?;
        Ok(())
    }

    fn describe(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

fn record_from_spec(spec: LeaseSpec) -> LeaseRecord {
    LeaseRecord {
        holder: spec.holder_identity,
        lease_duration: Duration::from_secs(spec.lease_duration_seconds.unwrap_or(0).max(0) as u64),
        acquired_at: spec.acquire_time.map(|t| t.0),
        renewed_at: spec.renew_time.map(|t| t.0),
        transitions: spec.lease_transitions.unwrap_or(0),
    }
}

fn spec_from_record(record: &LeaseRecord) -> LeaseSpec {
    LeaseSpec {
        holder_identity: record.holder.clone(),
        lease_duration_seconds: Some(record.lease_duration.as_secs().min(i32::MAX as u64) as i32),
        acquire_time: record.acquired_at.map(MicroTime),
        renew_time: record.renewed_at.map(MicroTime),
        lease_transitions: Some(record.transitions),
        ..LeaseSpec::default()
    }
}

/// Election timing and identity.
#[derive(Debug, Clone)]
pub struct ElectionConfig {
    /// This replica's identity (the pod name).
    pub identity: String,

    /// How long a lease is valid after its last renewal.
    pub lease_duration: Duration,

    /// How long a leader keeps leading while renewals fail.
    pub renew_deadline: Duration,

    /// Interval between acquire/renew attempts.
    pub retry_period: Duration,

    /// Clear the lease on shutdown so another replica can take over at once.
    pub release_on_cancel: bool,
}

impl ElectionConfig {
    pub fn new(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            lease_duration: DEFAULT_LEASE_DURATION,
            renew_deadline: DEFAULT_RENEW_DEADLINE,
            retry_period: DEFAULT_RETRY_PERIOD,
            release_on_cancel: true,
        }
    }
}

pub const DEFAULT_LEASE_DURATION: Duration = Duration::from_secs(15);
pub const DEFAULT_RENEW_DEADLINE: Duration = Duration::from_secs(10);
pub const DEFAULT_RETRY_PERIOD: Duration = Duration::from_secs(2);

/// Election state of this replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Leadership {
    Follower,
    Leader,
}

/// Leadership changes, in the order they happen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeadershipEvent {
    StartedLeading,
    StoppedLeading,
    /// Another replica was observed holding the lease.
    NewLeader(String),
}

/// Outcome of one acquire-or-renew attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Attempt {
    Leading,
    Following(Option<String>),
}

/// A running leadership term.
struct Term {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl Term {
    fn start<F, Fut>(lead: &mut F) -> Self
    where
        F: FnMut(watch::Receiver<bool>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (stop, stop_rx) = watch::channel(false);
        Self {
            stop,
            handle: tokio::spawn(lead(stop_rx)),
        }
    }

    async fn stop(self) {
        let _ = self.stop.send(true);
        if let Err(e) = self.handle.await {
            error!(error = %e, "Leader task panicked");
        }
    }
}

/// Lease-based leader elector.
pub struct LeaderElector {
    lock: Arc<dyn LeaseLock>,
    config: ElectionConfig,
    state: Leadership,
    /// Last record seen and when it was first seen (local clock).
    observed: Option<(LeaseRecord, Instant)>,
    reported_leader: Option<String>,
    events: Option<mpsc::UnboundedSender<LeadershipEvent>>,
}

impl LeaderElector {
    pub fn new(lock: Arc<dyn LeaseLock>, config: ElectionConfig) -> Self {
        Self {
            lock,
            config,
            state: Leadership::Follower,
            observed: None,
            reported_leader: None,
            events: None,
        }
    }

    /// Receive leadership changes from now on.
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<LeadershipEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.events = Some(tx);
        rx
    }

    pub fn state(&self) -> Leadership {
        self.state
    }

    fn emit(&self, event: LeadershipEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    /// Campaign until `shutdown` fires, running `lead` for every term won.
    ///
    /// `lead` receives a stop signal that fires when the term ends.
    #[instrument(skip_all, fields(identity = %self.config.identity))]
    pub async fn run<F, Fut>(&mut self, mut shutdown: watch::Receiver<bool>, mut lead: F)
    where
        F: FnMut(watch::Receiver<bool>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        info!(
            lock = %self.lock.describe(),
            lease_duration_secs = self.config.lease_duration.as_secs(),
            renew_deadline_secs = self.config.renew_deadline.as_secs(),
            retry_period_ms = self.config.retry_period.as_millis() as u64,
            "Starting leader election"
        );

        let mut term: Option<Term> = None;
        let mut last_renew: Option<Instant> = None;

        loop {
            // A leader must hear back before its renew deadline, however slow the API is
            let renew_deadline = self.config.renew_deadline;
            let deadline = match (&term, last_renew) {
                (Some(_), Some(renewed)) => renewed + renew_deadline,
                _ => Instant::now() + renew_deadline,
            };

            let attempt = tokio::select! {
                attempt = tokio::time::timeout_at(deadline, self.try_acquire_or_renew()) => {
                    attempt.unwrap_or(Err(LeaseError::Timeout(renew_deadline)))
                }
                _ = cancelled(&mut shutdown) => break,
            };

            match attempt {
                Ok(Attempt::Leading) => {
                    last_renew = Some(Instant::now());
                    self.note_leader(Some(self.config.identity.clone()));
                    if term.is_none() {
                        info!("Acquired leadership, starting reconciler");
                        self.state = Leadership::Leader;
                        self.emit(LeadershipEvent::StartedLeading);
                        term = Some(Term::start(&mut lead));
                    }
                }
                Ok(Attempt::Following(holder)) => {
                    if let Some(t) = term.take() {
                        self.step_down(t, "lease taken by another replica").await;
                    }
                    self.note_leader(holder);
                }
                Err(e) => {
                    warn!(error = %e, "Failed to acquire or renew lease");
                    let deadline_passed = last_renew
                        .map(|t| t.elapsed() >= self.config.renew_deadline)
                        .unwrap_or(true);
                    if deadline_passed {
                        if let Some(t) = term.take() {
                            self.step_down(t, "renew deadline exceeded").await;
                        }
                    }
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.retry_period) => {}
                _ = cancelled(&mut shutdown) => break,
            }
        }

        if let Some(t) = term.take() {
            self.step_down(t, "shutdown").await;
            if self.config.release_on_cancel {
                let renew_deadline = self.config.renew_deadline;
                if tokio::time::timeout(renew_deadline, self.release()).await.is_err() {
                    warn!("Timed out releasing leader lease");
                }
            }
        }
        info!("Leader election stopped");
    }

    async fn step_down(&mut self, term: Term, reason: &str) {
        info!(reason, "Stepping down, stopping reconciler");
        term.stop().await;
        self.state = Leadership::Follower;
        self.emit(LeadershipEvent::StoppedLeading);
    }

    fn note_leader(&mut self, holder: Option<String>) {
        if holder == self.reported_leader {
            return;
        }
        match holder.as_deref() {
            Some(id) if id == self.config.identity => {
                debug!("re-elected as leader, continuing...");
            }
            Some(id) => {
                info!(leader = %id, "new leader elected");
                self.emit(LeadershipEvent::NewLeader(id.to_string()));
            }
            None => debug!("Lease is not held"),
        }
        self.reported_leader = holder;
    }

    async fn try_acquire_or_renew(&mut self) -> Result<Attempt, LeaseError> {
        let now = Utc::now();
        let mut desired = LeaseRecord {
            holder: Some(self.config.identity.clone()),
            lease_duration: self.config.lease_duration,
            acquired_at: Some(now),
            renewed_at: Some(now),
            transitions: 0,
        };

        let Some(current) = self.lock.get().await? else {
            self.lock.create(&desired).await?;
            self.observe(desired);
            return Ok(Attempt::Leading);
        };

        let record = current.record.clone();
        let first_seen = self.observe(record.clone());

        if let Some(holder) = record.holder() {
            let expired = first_seen + record.lease_duration <= Instant::now();
            if holder != self.config.identity && !expired {
                return Ok(Attempt::Following(Some(holder.to_string())));
            }
        }

        if record.is_held_by(&self.config.identity) {
            desired.acquired_at = record.acquired_at;
            desired.transitions = record.transitions;
        } else {
            desired.transitions = record.transitions.saturating_add(1);
        }

        self.lock.update(&desired, &current.version).await?;
        self.observe(desired);
        Ok(Attempt::Leading)
    }

    /// Remember `record`, returning when it was first seen unchanged.
    fn observe(&mut self, record: LeaseRecord) -> Instant {
        match &self.observed {
            Some((seen, at)) if *seen == record => *at,
            _ => {
                let now = Instant::now();
                self.observed = Some((record, now));
                now
            }
        }
    }

    /// Clear the lease if this replica still holds it.
    async fn release(&mut self) {
        let current = match self.lock.get().await {
            Ok(Some(current)) if current.record.is_held_by(&self.config.identity) => current,
            Ok(_) => return,
            Err(e) => {
                warn!(error = %e, "Failed to read lease for release");
                return;
            }
        };

        let now = Utc::now();
        let released = LeaseRecord {
            holder: None,
            lease_duration: Duration::from_secs(1),
            acquired_at: Some(now),
            renewed_at: Some(now),
            transitions: current.record.transitions,
        };

        match self.lock.update(&released, &current.version).await {
            Ok(()) => info!("Released leader lease"),
            Err(e) => warn!(error = %e, "Failed to release leader lease"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_election_config_defaults() {
        let config = ElectionConfig::new("pod-a");
        assert_eq!(config.identity, "pod-a");
        assert_eq!(config.lease_duration, Duration::from_secs(15));
        assert_eq!(config.renew_deadline, Duration::from_secs(10));
        assert_eq!(config.retry_period, Duration::from_secs(2));
        assert!(config.release_on_cancel);
    }

    #[test]
    fn test_lease_spec_conversion() {
        let now = Utc::now();
        let record = LeaseRecord {
            holder: Some("pod-a".to_string()),
            lease_duration: Duration::from_secs(15),
            acquired_at: Some(now),
            renewed_at: Some(now),
            transitions: 3,
        };

        let spec = spec_from_record(&record);
        assert_eq!(spec.holder_identity.as_deref(), Some("pod-a"));
        assert_eq!(spec.lease_duration_seconds, Some(15));
        assert_eq!(spec.lease_transitions, Some(3));

        assert_eq!(record_from_spec(spec), record);
    }

    #[test]
    fn test_empty_spec_is_unheld() {
        let record = record_from_spec(LeaseSpec::default());
        assert_eq!(record.holder(), None);
        assert_eq!(record.lease_duration, Duration::ZERO);
        assert_eq!(record.transitions, 0);

        let blank = LeaseRecord {
            holder: Some(String::new()),
            ..record
        };
        assert_eq!(blank.holder(), None);
    }
}
