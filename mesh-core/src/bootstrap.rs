//! Overlay membership bookkeeping: the known/connected/pending/queried
//! peer sets and the invariants that keep them consistent. This module
//! holds state and pure transitions only; the actual dialing,
//! request/response I/O, and timers live in [`crate::peer_manager`],
//! which calls into this type to decide what to do next.

use std::collections::{HashMap, HashSet};
use std::time::{SystemTime, UNIX_EPOCH};

use mesh_proto::{PeerAddress, PeerId, RequestId, Topic};
use parking_lot::Mutex;

/// A peer is evicted from the known set if its last-seen timestamp is
/// older than this.
pub const STALE_PEER_TIMEOUT_SECS: u64 = 5 * 60;
/// Interval between maintenance sweeps (eviction, re-discovery,
/// re-announce).
pub const MAINTENANCE_INTERVAL_SECS: u64 = 30;
/// Recursive discovery gives up after this many rounds even if the
/// overlay has not filled to `max_connections`.
pub const MAX_DISCOVERY_ROUNDS: u32 = 10;
/// How long a `peer-request` is allowed to go unanswered before its
/// correlation id is abandoned.
pub const PEER_REQUEST_TIMEOUT_SECS: u64 = 5;

fn now() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

/// The overlay membership state for one joined workspace.
struct OverlayState {
    my_address: PeerAddress,
    current_topic: Option<Topic>,
    known: HashMap<PeerId, PeerAddress>,
    connected: HashSet<PeerId>,
    /// An outbound `connect` is in flight; excluded from new connect
    /// attempts until it resolves either way.
    pending: HashSet<PeerId>,
    /// Already asked for their own peer list this discovery pass.
    queried: HashSet<PeerId>,
    /// In-flight `peer-request` correlation ids, mapped to who we asked.
    outstanding_requests: HashMap<RequestId, PeerId>,
    discovery_rounds: u32,
}

impl OverlayState {
    fn assert_invariants(&self) {
        debug_assert!(
            self.pending.is_disjoint(&self.connected),
            "a peer cannot be simultaneously pending and connected"
        );
        debug_assert!(
            !self.known.contains_key(&self.my_address.peer_id),
            "the local peer must never appear in its own known set"
        );
        debug_assert!(
            !self.connected.contains(&self.my_address.peer_id),
            "the local peer must never appear in its own connected set"
        );
    }
}

/// Overlay membership tracker for a single joined workspace. Cheap to
/// clone (internally `Arc`-free; wrap in `Arc` at the call site if
/// shared across tasks).
pub struct Bootstrap {
    state: Mutex<OverlayState>,
    max_connections: usize,
}

impl Bootstrap {
    #[must_use]
    pub fn new(my_address: PeerAddress, max_connections: usize) -> Self {
        Self {
            state: Mutex::new(OverlayState {
                my_address,
                current_topic: None,
                known: HashMap::new(),
                connected: HashSet::new(),
                pending: HashSet::new(),
                queried: HashSet::new(),
                outstanding_requests: HashMap::new(),
                discovery_rounds: 0,
            }),
            max_connections,
        }
    }

    /// Begin tracking a new topic; clears all membership state from any
    /// previously joined workspace.
    pub fn begin_join(&self, topic: Topic) {
        let mut state = self.state.lock();
        state.current_topic = Some(topic);
        state.known.clear();
        state.connected.clear();
        state.pending.clear();
        state.queried.clear();
        state.outstanding_requests.clear();
        state.discovery_rounds = 0;
    }

    /// Forget all membership state. Called on leave.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.current_topic = None;
        state.known.clear();
        state.connected.clear();
        state.pending.clear();
        state.queried.clear();
        state.outstanding_requests.clear();
        state.discovery_rounds = 0;
    }

    #[must_use]
    pub fn current_topic(&self) -> Option<Topic> {
        self.state.lock().current_topic
    }

    #[must_use]
    pub fn my_address(&self) -> PeerAddress {
        self.state.lock().my_address.clone()
    }

    /// Merge freshly discovered peer addresses into the known set.
    /// Never records the local peer, and never regresses a peer's
    /// `last_seen`.
    pub fn record_discovered(&self, peers: impl IntoIterator<Item = PeerAddress>) {
        let mut state = self.state.lock();
        let me = state.my_address.peer_id;
        for peer in peers {
            if peer.peer_id == me || !peer.is_valid() {
                continue;
            }
            match state.known.get(&peer.peer_id) {
                Some(existing) if existing.last_seen >= peer.last_seen => {}
                _ => {
                    state.known.insert(peer.peer_id, peer);
                }
            }
        }
        state.assert_invariants();
    }

    /// Known peers eligible for a fresh outbound connect attempt: not
    /// already connected, not already dialing, and only enough to
    /// bring the overlay up to `max_connections`.
    #[must_use]
    pub fn next_connect_targets(&self) -> Vec<PeerAddress> {
        let state = self.state.lock();
        let budget = self.max_connections.saturating_sub(state.connected.len());
        if budget == 0 {
            return Vec::new();
        }
        state
            .known
            .values()
            .filter(|p| !state.connected.contains(&p.peer_id) && !state.pending.contains(&p.peer_id))
            .take(budget)
            .cloned()
            .collect()
    }

    pub fn mark_pending(&self, peer: PeerId) {
        let mut state = self.state.lock();
        state.pending.insert(peer);
        state.assert_invariants();
    }

    /// A dial resolved into a confirmed, live link. Per the overlay's
    /// connection-type discipline, this is the only path that should
    /// ever move a peer into `connected` — a transport accepting a
    /// socket is not by itself proof of liveness; the peer-connect
    /// sub-procedure still liveness-probes before calling this.
    pub fn mark_connected(&self, peer: PeerId) {
        let mut state = self.state.lock();
        state.pending.remove(&peer);
        state.connected.insert(peer);
        state.assert_invariants();
    }

    pub fn mark_disconnected(&self, peer: PeerId) {
        let mut state = self.state.lock();
        state.pending.remove(&peer);
        state.connected.remove(&peer);
        state.assert_invariants();
    }

    #[must_use]
    pub fn is_connected(&self, peer: PeerId) -> bool {
        self.state.lock().connected.contains(&peer)
    }

    #[must_use]
    pub fn connected_count(&self) -> usize {
        self.state.lock().connected.len()
    }

    #[must_use]
    pub fn has_connection_budget(&self) -> bool {
        self.state.lock().connected.len() < self.max_connections
    }

    /// Known peers not yet asked for their own peer list this
    /// discovery pass, capped at `limit`. Returns an empty list once
    /// [`MAX_DISCOVERY_ROUNDS`] has been reached.
    pub fn next_discovery_targets(&self, limit: usize) -> Vec<PeerId> {
        let mut state = self.state.lock();
        if state.discovery_rounds >= MAX_DISCOVERY_ROUNDS {
            return Vec::new();
        }
        state.discovery_rounds += 1;
        state
            .known
            .keys()
            .filter(|id| !state.queried.contains(*id))
            .take(limit)
            .copied()
            .collect()
    }

    /// Record that `peer` was asked, and allocate a correlation id for
    /// the outstanding `peer-request`.
    pub fn begin_request(&self, peer: PeerId, request_id: RequestId) {
        let mut state = self.state.lock();
        state.queried.insert(peer);
        state.outstanding_requests.insert(request_id, peer);
    }

    /// Resolve a `peer-list` reply by its correlation id. Returns the
    /// peer that was asked, if the id is still outstanding (a reply
    /// after the 5 s timeout window is simply ignored by the caller).
    pub fn resolve_request(&self, request_id: RequestId) -> Option<PeerId> {
        self.state.lock().outstanding_requests.remove(&request_id)
    }

    /// Evict known peers that have not been seen within
    /// [`STALE_PEER_TIMEOUT_SECS`] and are not currently connected.
    /// Returns the evicted peer ids.
    pub fn evict_stale(&self) -> Vec<PeerId> {
        let mut state = self.state.lock();
        let cutoff = now().saturating_sub(STALE_PEER_TIMEOUT_SECS);
        let stale: Vec<PeerId> = state
            .known
            .iter()
            .filter(|(id, addr)| !state.connected.contains(*id) && addr.last_seen < cutoff)
            .map(|(id, _)| *id)
            .collect();
        for id in &stale {
            state.known.remove(id);
            state.queried.remove(id);
        }
        stale
    }

    /// Reset discovery-round bookkeeping so the next maintenance sweep
    /// can re-query the whole known set again.
    pub fn reset_discovery_pass(&self) {
        let mut state = self.state.lock();
        state.queried.clear();
        state.discovery_rounds = 0;
    }

    #[must_use]
    pub fn known_peers(&self) -> Vec<PeerAddress> {
        self.state.lock().known.values().cloned().collect()
    }

    /// Known peers this node currently holds a confirmed, live
    /// connection to — the set a `peer-request` reply must be built
    /// from, per spec: stale/never-connected/disconnected peers are
    /// never handed out as a `peer-list`.
    #[must_use]
    pub fn connected_peers(&self) -> Vec<PeerAddress> {
        let state = self.state.lock();
        state.known.values().filter(|p| state.connected.contains(&p.peer_id)).cloned().collect()
    }
}
