//! The rendezvous wire protocol: the operations a relay transport runs
//! on its single long-lived link to a rendezvous server, distinct from
//! the peer-to-peer [`crate::control::Envelope`] catalog those
//! operations carry as payload.
//!
//! Client -> server operations: `join_topic`, `leave_topic`,
//! `request_peers`, `forward_signaling`, `relay_unicast`,
//! `relay_broadcast`, plus a keepalive ping. Server -> client messages
//! deliver the results: topic membership, signaling forwarded from
//! another peer, unicast/broadcast payloads carrying an opaque binary
//! frame, and rate-limit backpressure.

use serde::{Deserialize, Serialize};

use crate::peer::{PeerId, Topic};

/// A message sent from a relay transport client to the rendezvous server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "kebab-case")]
pub enum ClientOp {
    /// Announce this peer's identity for the lifetime of the connection.
    /// Must be the first message sent; the server rejects anything else.
    Identify { peer_id: PeerId },
    /// Join a topic, becoming discoverable to other members via
    /// `request_peers` and eligible to receive broadcasts on it.
    JoinTopic { topic: Topic },
    /// Leave a previously joined topic.
    LeaveTopic { topic: Topic },
    /// Ask the server for the set of other peers currently joined to a
    /// topic. Answered with [`ServerOp::PeerList`].
    RequestPeers { topic: Topic },
    /// Forward an opaque signaling blob to another peer on a shared
    /// topic (used by the direct transport's offer/answer/candidate
    /// exchange). Answered with nothing on success; the target receives
    /// [`ServerOp::Signal`].
    ForwardSignaling {
        target: PeerId,
        blob: serde_json::Value,
    },
    /// Send a single binary frame to exactly one peer.
    RelayUnicast { target: PeerId, frame: Vec<u8> },
    /// Send a single binary frame to every peer joined to `topic`.
    RelayBroadcast { topic: Topic, frame: Vec<u8> },
    /// Keepalive; the server answers with [`ServerOp::Pong`].
    Ping { timestamp: u64 },
}

/// A message sent from the rendezvous server to a relay transport client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "kebab-case")]
pub enum ServerOp {
    /// Acknowledges [`ClientOp::Identify`].
    Identified { peer_id: PeerId },
    /// Acknowledges [`ClientOp::JoinTopic`].
    Joined { topic: Topic },
    /// Acknowledges [`ClientOp::LeaveTopic`].
    Left { topic: Topic },
    /// Answers [`ClientOp::RequestPeers`].
    PeerList {
        topic: Topic,
        peers: Vec<crate::peer::PeerAddress>,
    },
    /// Delivers a signaling blob forwarded by another peer via
    /// [`ClientOp::ForwardSignaling`].
    Signal {
        from: PeerId,
        blob: serde_json::Value,
    },
    /// Delivers a frame sent to this peer, unicast or broadcast, by
    /// another peer. `origin` is the sending peer, extracted from the
    /// server's own connection bookkeeping rather than trusted from the
    /// client.
    Inbound { origin: PeerId, frame: Vec<u8> },
    /// Answers a [`ClientOp::Ping`].
    Pong { ping_timestamp: u64 },
    /// The client exceeded the server's rate limit; the named operation
    /// is paused for at least `retry_after_secs`.
    RateLimited { retry_after_secs: u64 },
    /// A client operation was malformed or violated a protocol
    /// precondition (e.g. any op sent before `Identify`).
    Error { message: String },
}
