//! Presence/awareness: an unreliable, throttled side-channel for
//! ephemeral per-document state (cursor position, selection, "is
//! typing") that rides alongside the reliable CRDT sync stream but is
//! never persisted and never retried.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::{Map, Value};

/// Local awareness updates for the same document within this window
/// are coalesced into one outbound envelope.
pub const THROTTLE: Duration = Duration::from_millis(100);

struct DocState {
    local: Map<String, Value>,
    remote: Map<String, Value>,
    last_sent: Option<Instant>,
}

/// Per-document awareness state, local and remote, with outbound
/// throttling.
pub struct Awareness {
    docs: Mutex<HashMap<String, DocState>>,
}

impl Default for Awareness {
    fn default() -> Self {
        Self::new()
    }
}

impl Awareness {
    #[must_use]
    pub fn new() -> Self {
        Self { docs: Mutex::new(HashMap::new()) }
    }

    /// Update this node's own awareness state for `doc_id`. Returns
    /// `Some(state)` to send immediately if the throttle window has
    /// elapsed, or `None` if the update should be held and coalesced
    /// with whatever comes next within [`THROTTLE`].
    pub fn set_local(&self, doc_id: impl Into<String>, state: Map<String, Value>) -> Option<Map<String, Value>> {
        let doc_id = doc_id.into();
        let mut docs = self.docs.lock();
        let entry = docs.entry(doc_id).or_insert_with(|| DocState {
            local: Map::new(),
            remote: Map::new(),
            last_sent: None,
        });
        entry.local = state.clone();
        let should_send = entry.last_sent.is_none_or(|t| t.elapsed() >= THROTTLE);
        if should_send {
            entry.last_sent = Some(Instant::now());
            Some(state)
        } else {
            None
        }
    }

    /// Record a remote peer's awareness broadcast for `doc_id`.
    pub fn note_remote(&self, doc_id: impl Into<String>, states: Map<String, Value>) {
        let mut docs = self.docs.lock();
        let entry = docs.entry(doc_id.into()).or_insert_with(|| DocState {
            local: Map::new(),
            remote: Map::new(),
            last_sent: None,
        });
        for (k, v) in states {
            entry.remote.insert(k, v);
        }
    }

    /// The combined remote awareness state currently known for
    /// `doc_id`, or an empty map if nothing has arrived yet.
    #[must_use]
    pub fn remote_state(&self, doc_id: &str) -> Map<String, Value> {
        self.docs.lock().get(doc_id).map(|d| d.remote.clone()).unwrap_or_default()
    }

    /// Drop all state for `doc_id`. Called when a document is closed.
    pub fn forget(&self, doc_id: &str) {
        self.docs.lock().remove(doc_id);
    }
}
