//! In-memory silence state.
//!
//! Tracks which Alertmanager silences were opened on behalf of which node so
//! they can be lifted when the node's reboot label clears. The store lives
//! exactly as long as the reconciliation loop that owns it; nothing is
//! persisted, and a newly elected leader starts from an empty store.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Identifier issued by Alertmanager for a silence. Never parsed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SilenceId(String);

impl SilenceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SilenceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SilenceId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for SilenceId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Mapping of node name to the silences currently suppressing its alerts.
///
/// Single-writer: only the reconciliation loop that owns the store touches
/// it, so there is no internal locking.
#[derive(Debug, Default)]
pub struct SilenceStore {
    silences: HashMap<String, Vec<SilenceId>>,
    /// When Alertmanager drops a node's silences on its own.
    expires: HashMap<String, Instant>,
}

impl SilenceStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Silences tracked for `node`, if any.
    pub fn get(&self, node: &str) -> Option<&[SilenceId]> {
        self.silences.get(node).map(Vec::as_slice)
    }

    /// Track `ids` for `node`, replacing any previous entry.
    ///
    /// An empty set removes the node instead, so a present node always has at
    /// least one silence.
    pub fn put(&mut self, node: impl Into<String>, ids: Vec<SilenceId>) {
        let node = node.into();
        self.expires.remove(&node);
        if ids.is_empty() {
            self.silences.remove(&node);
        } else {
            self.silences.insert(node, ids);
        }
    }

    /// Like [`put`](Self::put), also recording when the silences lapse.
    pub fn put_until(&mut self, node: impl Into<String>, ids: Vec<SilenceId>, expires_at: Instant) {
        let node = node.into();
        if ids.is_empty() {
            self.put(node, ids);
            return;
        }
        self.expires.insert(node.clone(), expires_at);
        self.silences.insert(node, ids);
    }

    /// When the silences tracked for `node` lapse, if known.
    pub fn expires_at(&self, node: &str) -> Option<Instant> {
        self.expires.get(node).copied()
    }

    /// Stop tracking `node`. Returns the silences that were tracked.
    pub fn delete(&mut self, node: &str) -> Option<Vec<SilenceId>> {
        self.expires.remove(node);
        self.silences.remove(node)
    }

    pub fn contains(&self, node: &str) -> bool {
        self.silences.contains_key(node)
    }

    pub fn len(&self) -> usize {
        self.silences.len()
    }

    pub fn is_empty(&self) -> bool {
        self.silences.is_empty()
    }

    /// Names of all tracked nodes, sorted.
    pub fn nodes(&self) -> Vec<&str> {
        let mut nodes: Vec<&str> = self.silences.keys().map(String::as_str).collect();
        nodes.sort_unstable();
        nodes
    }

    /// Total number of silences tracked across all nodes.
    pub fn silence_count(&self) -> usize {
        self.silences.values().map(Vec::len).sum()
    }
}
