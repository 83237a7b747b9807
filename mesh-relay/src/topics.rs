//! Topic membership registry.
//!
//! The rendezvous server's only notion of grouping is the topic: peers
//! `join-topic`/`leave-topic` and become visible to each other's
//! `request-peers`/`relay-broadcast`. Membership is purely a property of
//! the live connection — there is no persistence, and a peer's
//! membership is dropped the moment its socket closes.

use std::collections::{HashMap, HashSet};

use mesh_proto::{PeerId, Topic};
use tokio::sync::RwLock;

/// Tracks which peers are joined to which topics, in both directions so
/// that both "who else is on this topic" and "what must be cleaned up
/// when this peer disconnects" are O(1) lookups.
#[derive(Default)]
pub struct TopicRegistry {
    by_topic: RwLock<HashMap<Topic, HashSet<PeerId>>>,
    by_peer: RwLock<HashMap<PeerId, HashSet<Topic>>>,
}

impl TopicRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Join `peer` to `topic`. Idempotent.
    pub async fn join(&self, peer: PeerId, topic: Topic) {
        self.by_topic.write().await.entry(topic).or_default().insert(peer);
        self.by_peer.write().await.entry(peer).or_default().insert(topic);
    }

    /// Remove `peer` from `topic`. Idempotent.
    pub async fn leave(&self, peer: PeerId, topic: Topic) {
        if let Some(members) = self.by_topic.write().await.get_mut(&topic) {
            members.remove(&peer);
        }
        if let Some(topics) = self.by_peer.write().await.get_mut(&peer) {
            topics.remove(&topic);
        }
    }

    /// Remove `peer` from every topic it had joined, returning the set
    /// of topics it was a member of (so callers can decide whether to
    /// notify anyone left behind — this protocol doesn't, but the
    /// caller needs it to know which rooms go quiet).
    pub async fn leave_all(&self, peer: PeerId) -> HashSet<Topic> {
        let topics = self.by_peer.write().await.remove(&peer).unwrap_or_default();
        let mut by_topic = self.by_topic.write().await;
        for topic in &topics {
            if let Some(members) = by_topic.get_mut(topic) {
                members.remove(&peer);
            }
        }
        topics
    }

    /// The other peers currently joined to `topic` (excludes `peer`
    /// itself, since `request-peers` answers "who else is here").
    pub async fn members_excluding(&self, topic: Topic, peer: PeerId) -> Vec<PeerId> {
        self.by_topic
            .read()
            .await
            .get(&topic)
            .into_iter()
            .flatten()
            .filter(|&&p| p != peer)
            .copied()
            .collect()
    }

    /// Every peer currently joined to `topic`, `peer` included.
    pub async fn members(&self, topic: Topic) -> Vec<PeerId> {
        self.by_topic.read().await.get(&topic).into_iter().flatten().copied().collect()
    }
}
