//! Node label watch.
//!
//! A [`WatchSource`] opens time-bounded subscriptions to label changes on
//! nodes. Each [`Subscription`] is pulled one event at a time until it
//! closes; closing is normal (server timeout, upstream exhaustion) and the
//! reconciler simply opens a new one.
//!
//! Delivery is not exactly-once: every fresh subscription starts with an
//! `Added` event for each node that already carries the label.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{BoxStream, StreamExt};
use k8s_openapi::api::core::v1::Node;
use kured_reconcile::DEFAULT_WATCH_TIMEOUT;
use kube::api::{Api, ResourceExt, WatchEvent, WatchParams};
use thiserror::Error;
use tracing::{debug, info};

/// Errors from the label watch.
#[derive(Debug, Error)]
pub enum WatchError {
    #[error("failed to open watch: {0}")]
    Open(#[source] kube::Error),

    #[error("watch stream failed: {0}")]
    Stream(#[source] kube::Error),

    /// The API server sent an error object in the stream (e.g. 410 Gone).
    #[error("watch error from API server ({code}): {message}")]
    Api { code: u16, message: String },
}

/// Kind of label change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabelEventKind {
    /// The node started matching the label selector.
    Added,

    /// The node stopped matching the label selector.
    Removed,

    /// The node still matches but was otherwise updated.
    Modified,
}

impl std::fmt::Display for LabelEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LabelEventKind::Added => write!(f, "added"),
            LabelEventKind::Removed => write!(f, "removed"),
            LabelEventKind::Modified => write!(f, "modified"),
        }
    }
}

/// A label change on one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelEvent {
    pub kind: LabelEventKind,
    pub node: String,
}

impl LabelEvent {
    pub fn added(node: impl Into<String>) -> Self {
        Self {
            kind: LabelEventKind::Added,
            node: node.into(),
        }
    }

    pub fn removed(node: impl Into<String>) -> Self {
        Self {
            kind: LabelEventKind::Removed,
            node: node.into(),
        }
    }

    pub fn modified(node: impl Into<String>) -> Self {
        Self {
            kind: LabelEventKind::Modified,
            node: node.into(),
        }
    }
}

/// An open, pull-based subscription. Dropping it stops the watch.
pub struct Subscription {
    events: BoxStream<'static, Result<LabelEvent, WatchError>>,
}

impl Subscription {
    /// Wrap any stream of label events.
    pub fn new(events: BoxStream<'static, Result<LabelEvent, WatchError>>) -> Self {
        Self { events }
    }

    /// Next event, or `None` once the subscription has closed.
    pub async fn next(&mut self) -> Option<Result<LabelEvent, WatchError>> {
        self.events.next().await
    }
}

/// Opens label subscriptions.
#[async_trait]
pub trait WatchSource: Send + Sync {
    async fn subscribe(&self) -> Result<Subscription, WatchError>;
}

/// Watches Kubernetes nodes matching a label selector.
pub struct NodeLabelWatch {
    api: Api<Node>,
    label_selector: String,
    timeout: Duration,
}

impl NodeLabelWatch {
    /// `timeout` is the server-side bound on each subscription.
    pub fn new(client: kube::Client, label_selector: impl Into<String>, timeout: Duration) -> Self {
        Self {
            api: Api::all(client),
            label_selector: label_selector.into(),
            timeout,
        }
    }

    fn params(&self) -> WatchParams {
        // kube caps watch timeouts below the API server's 5 minute limit
        let secs = self.timeout.as_secs().clamp(1, DEFAULT_WATCH_TIMEOUT.as_secs()) as u32;
        WatchParams::default()
            .labels(&self.label_selector)
            .timeout(secs)
    }
}

/// Map a raw watch event onto a label event; bookmarks carry no change.
fn translate(event: kube::Result<WatchEvent<Node>>) -> Option<Result<LabelEvent, WatchError>> {
    match event {
        Ok(WatchEvent::Added(node)) => Some(Ok(LabelEvent::added(node.name_any()))),
        Ok(WatchEvent::Deleted(node)) => Some(Ok(LabelEvent::removed(node.name_any()))),
        Ok(WatchEvent::Modified(node)) => Some(Ok(LabelEvent::modified(node.name_any()))),
        Ok(WatchEvent::Bookmark(_)) => None,
        Ok(WatchEvent::Error(e)) => Some(Err(WatchError::Api {
            code: e.code,
            message: e.message,
        })),
        Err(e) => Some(Err(WatchError::Stream(e))),
    }
}

#[async_trait]
impl WatchSource for NodeLabelWatch {
    async fn subscribe(&self) -> Result<Subscription, WatchError> {
        info!(
            label_selector = %self.label_selector,
            timeout_secs = self.timeout.as_secs(),
            "Opening node label watch"
        );

        // "0" starts from any cached version, so current matches replay as Added
        let stream = self
            .api
            .watch(&self.params(), "0")
            .await
            .map_err(WatchError::Open)?;

        let events = stream
            .filter_map(|event| async move {
                let translated = translate(event);
                if let Some(Ok(ev)) = &translated {
                    debug!(node = %ev.node, kind = %ev.kind, "Node label event");
                }
                translated
            })
            .boxed();

        Ok(Subscription::new(events))
    }
}
