//! Shared fakes for integration tests.
#![allow(dead_code)]

use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, StreamExt};
use kured_silencer::leader::{LeaseError, LeaseLock, LeaseRecord, ObservedLease};
use kured_silencer::watch::WatchError;
use kured_silencer::{AlertSilencer, LabelEvent, SilenceId, SilencerError, Subscription, WatchSource};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

/// What one `subscribe` call produces.
pub enum Script {
    /// Subscribing fails.
    Fail,
    /// The given events, then the subscription closes.
    Closed(Vec<LabelEvent>),
    /// The given events, then the subscription stays open and quiet.
    Open(Vec<LabelEvent>),
    /// Events pushed by the test through the paired sender.
    Live(mpsc::UnboundedReceiver<Result<LabelEvent, WatchError>>),
}

/// Watch source playing back scripted subscriptions.
///
/// Once the script runs out, every subscription replays `fallback` and then
/// stays open.
#[derive(Default)]
pub struct ScriptedSource {
    scripts: Mutex<VecDeque<Script>>,
    fallback: Vec<LabelEvent>,
    subscribes: AtomicUsize,
}

impl ScriptedSource {
    pub fn new(scripts: Vec<Script>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
            ..Self::default()
        }
    }

    /// Every subscription replays `events`, like a fresh watch does for nodes
    /// that still carry the label.
    pub fn replaying(events: Vec<LabelEvent>) -> Self {
        Self {
            fallback: events,
            ..Self::default()
        }
    }

    /// Add a live subscription and return its sender.
    pub fn push_live(&self) -> mpsc::UnboundedSender<Result<LabelEvent, WatchError>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.scripts.lock().unwrap().push_back(Script::Live(rx));
        tx
    }

    pub fn subscribes(&self) -> usize {
        self.subscribes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WatchSource for ScriptedSource {
    async fn subscribe(&self) -> Result<Subscription, WatchError> {
        self.subscribes.fetch_add(1, Ordering::SeqCst);
        let script = self.scripts.lock().unwrap().pop_front();

        let events: BoxStream<'static, Result<LabelEvent, WatchError>> = match script {
            Some(Script::Fail) => {
                return Err(WatchError::Api {
                    code: 503,
                    message: "apiserver unavailable".to_string(),
                })
            }
            Some(Script::Closed(events)) => stream::iter(events.into_iter().map(Ok)).boxed(),
            Some(Script::Open(events)) => stream::iter(events.into_iter().map(Ok))
                .chain(stream::pending())
                .boxed(),
            Some(Script::Live(rx)) => UnboundedReceiverStream::new(rx).boxed(),
            None => stream::iter(self.fallback.clone().into_iter().map(Ok))
                .chain(stream::pending())
                .boxed(),
        };

        Ok(Subscription::new(events))
    }
}

/// A call made against the recording silencer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Open(Duration),
    Close(String),
}

/// Silencer that hands out sequential ids and records every call.
pub struct RecordingSilencer {
    per_open: usize,
    next_id: AtomicUsize,
    calls: Mutex<Vec<Call>>,
    active: Mutex<HashSet<String>>,
    failing_opens: AtomicUsize,
}

impl RecordingSilencer {
    /// Each `open` creates `per_open` silences.
    pub fn new(per_open: usize) -> Self {
        Self {
            per_open,
            next_id: AtomicUsize::new(1),
            calls: Mutex::new(Vec::new()),
            active: Mutex::new(HashSet::new()),
            failing_opens: AtomicUsize::new(0),
        }
    }

    /// Make the next `n` opens fail.
    pub fn fail_opens(&self, n: usize) {
        self.failing_opens.store(n, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn opens(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, Call::Open(_)))
            .count()
    }

    pub fn closes(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Close(id) => Some(id),
                Call::Open(_) => None,
            })
            .collect()
    }

    /// Silences created and not yet closed.
    pub fn active(&self) -> usize {
        self.active.lock().unwrap().len()
    }
}

#[async_trait]
impl AlertSilencer for RecordingSilencer {
    async fn open(&self, duration: Duration) -> Result<Vec<SilenceId>, SilencerError> {
        self.calls.lock().unwrap().push(Call::Open(duration));

        let failing = self.failing_opens.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_opens.store(failing - 1, Ordering::SeqCst);
            return Err(SilencerError::Api {
                status: 500,
                body: "internal error".to_string(),
            });
        }

        let mut active = self.active.lock().unwrap();
        let ids = (0..self.per_open)
            .map(|_| {
                let id = format!("sil-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
                active.insert(id.clone());
                SilenceId::new(id)
            })
            .collect();
        Ok(ids)
    }

    async fn close(&self, id: &SilenceId) -> Result<(), SilencerError> {
        self.calls.lock().unwrap().push(Call::Close(id.to_string()));
        if self.active.lock().unwrap().remove(id.as_str()) {
            Ok(())
        } else {
            Err(SilencerError::Api {
                status: 404,
                body: format!("silence {id} not found"),
            })
        }
    }
}

/// In-memory lease with optimistic concurrency.
#[derive(Default)]
pub struct MemoryLeaseLock {
    state: Mutex<Option<(LeaseRecord, u64)>>,
    failing: AtomicUsize,
}

impl MemoryLeaseLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self) -> Option<LeaseRecord> {
        self.state.lock().unwrap().as_ref().map(|(r, _)| r.clone())
    }

    pub fn holder(&self) -> Option<String> {
        self.record().and_then(|r| r.holder)
    }

    /// Overwrite the lease as another replica would.
    pub fn set_holder(&self, holder: Option<&str>, lease_duration: Duration) {
        let mut state = self.state.lock().unwrap();
        let (transitions, version) = state
            .as_ref()
            .map(|(r, v)| (r.transitions + 1, v + 1))
            .unwrap_or((0, 1));
        let now = chrono::Utc::now();
        *state = Some((
            LeaseRecord {
                holder: holder.map(str::to_string),
                lease_duration,
                acquired_at: Some(now),
                renewed_at: Some(now),
                transitions,
            },
            version,
        ));
    }

    /// Make the next `n` reads fail.
    pub fn fail_reads(&self, n: usize) {
        self.failing.store(n, Ordering::SeqCst);
    }
}

#[async_trait]
impl LeaseLock for MemoryLeaseLock {
    async fn get(&self) -> Result<Option<ObservedLease>, LeaseError> {
        let failing = self.failing.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing.store(failing - 1, Ordering::SeqCst);
            return Err(LeaseError::Conflict(self.describe()));
        }

        Ok(self
            .state
            .lock()
            .unwrap()
            .as_ref()
            .map(|(record, version)| ObservedLease {
                record: record.clone(),
                version: version.to_string(),
            }))
    }

    async fn create(&self, record: &LeaseRecord) -> Result<(), LeaseError> {
        let mut state = self.state.lock().unwrap();
        if state.is_some() {
            return Err(LeaseError::Conflict(self.describe()));
        }
        *state = Some((record.clone(), 1));
        Ok(())
    }

    async fn update(&self, record: &LeaseRecord, version: &str) -> Result<(), LeaseError> {
        let mut state = self.state.lock().unwrap();
        match state.as_mut() {
            Some((current, v)) if v.to_string() == version => {
                *current = record.clone();
                *v += 1;
                Ok(())
            }
            _ => Err(LeaseError::Conflict(self.describe())),
        }
    }

    fn describe(&self) -> String {
        "memory/kured-silencer".to_string()
    }
}

/// In-memory lease whose reads never answer once stalled, like an API server
/// that accepts the connection and then goes quiet.
#[derive(Default)]
pub struct StallingLeaseLock {
    inner: MemoryLeaseLock,
    stalled: AtomicBool,
}

impl StallingLeaseLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stall(&self) {
        self.stalled.store(true, Ordering::SeqCst);
    }

    pub fn holder(&self) -> Option<String> {
        self.inner.holder()
    }
}

#[async_trait]
impl LeaseLock for StallingLeaseLock {
    async fn get(&self) -> Result<Option<ObservedLease>, LeaseError> {
        if self.stalled.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        self.inner.get().await
    }

    async fn create(&self, record: &LeaseRecord) -> Result<(), LeaseError> {
        self.inner.create(record).await
    }

    async fn update(&self, record: &LeaseRecord, version: &str) -> Result<(), LeaseError> {
        self.inner.update(record, version).await
    }

    fn describe(&self) -> String {
        self.inner.describe()
    }
}

/// Poll `check` until it holds, sleeping between attempts.
///
/// Meant for paused-time tests, where each sleep advances the clock.
pub async fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
    for _ in 0..10_000 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("timed out waiting for {what}");
}

/// Await `fut`, failing the test if it takes longer than `limit`.
pub async fn within<T>(limit: Duration, fut: impl Future<Output = T>) -> T {
    tokio::time::timeout(limit, fut)
        .await
        .unwrap_or_else(|_| panic!("did not finish within {limit:?}"))
}
