//! The transport capability contract: one trait every
//! variant — relay, direct, DHT, local-network — implements identically,
//! so the peer manager can treat all four uniformly.

pub mod direct;
pub mod dht;
pub mod local;
pub mod relay;

use std::future::Future;
use std::pin::Pin;

use mesh_proto::{PeerAddress, PeerId};

/// The lifecycle state of a transport's link to one peer (spec §3,
/// "Transport state").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// An outbound connection attempt is in flight.
    Dialing,
    /// The link is open; `send` is expected to succeed.
    Open,
    /// Teardown has started but has not yet completed.
    Closing,
    /// The link is gone.
    Closed,
}

/// Errors a transport can surface. Transport-internal errors are
/// absorbed by the implementation and turned into
/// [`TransportEvent::Error`]; this type is only returned directly from
/// synchronous preconditions (`send` before `initialize`, `send` to an
/// unsupported transport).
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The transport has not been initialized, or has been destroyed.
    #[error("transport not initialized")]
    NotInitialized,
    /// This transport does not support the requested operation
    /// (spec §4.3.4: local-network transport's `send`/`broadcast`).
    #[error("operation not supported by this transport")]
    NotSupported,
    /// No open link to the named peer.
    #[error("peer {0} is unreachable on this transport")]
    Unreachable(PeerId),
    /// I/O failure talking to the remote end or a host sidecar.
    #[error("transport I/O error: {0}")]
    Io(String),
    /// The operation timed out.
    #[error("transport operation timed out")]
    Timeout,
}

/// Events a transport emits on its event stream.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A bidirectional path to `peer` is open and accepts `send`.
    PeerConnected { peer: PeerId },
    /// The link to `peer` is gone.
    PeerDisconnected { peer: PeerId },
    /// An opaque application payload arrived from `peer`.
    Message { peer: PeerId, payload: Vec<u8> },
    /// A recoverable transport-internal failure (spec `Transient`);
    /// the transport keeps trying to reconnect where applicable.
    Error { message: String },
    /// New candidate addresses were discovered (DHT, local-network).
    PeersDiscovered { peers: Vec<PeerAddress> },
    /// A peer announced its own address (spec §4.6 `peer-announce`,
    /// surfaced here when a transport learns it out of band, e.g. the
    /// rendezvous server's own directory).
    PeerAnnounced { address: PeerAddress },
    /// An opaque signaling blob arrived from `from`, destined for the
    /// local peer's direct-transport negotiation.
    Signal {
        from: PeerId,
        blob: serde_json::Value,
    },
}

/// A boxed future, used to let [`Transport`] stay object-safe (the peer
/// manager holds `Arc<dyn Transport>` for all four variants).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// The capability contract every transport variant implements
/// identically.
pub trait Transport: Send + Sync {
    /// Bring resources up. Idempotent. Does not imply peer
    /// connectivity — only that the transport is ready to attempt it.
    fn initialize(&self) -> BoxFuture<'_, Result<(), TransportError>>;

    /// Initiate an outbound link to `peer` at `address`. Transport-
    /// specific; a transport that cannot reach `address` at all
    /// returns `Err` synchronously instead of dialing.
    fn connect<'a>(
        &'a self,
        peer: PeerId,
        address: &'a PeerAddress,
    ) -> BoxFuture<'a, Result<(), TransportError>>;

    /// Close the link to `peer` and release its handle.
    fn disconnect(&self, peer: PeerId) -> BoxFuture<'_, Result<(), TransportError>>;

    /// Enqueue `payload` for delivery to `peer`. Returns `Ok(())` once
    /// the transport has written to its underlying channel — this is
    /// not end-to-end delivery confirmation.
    fn send<'a>(&'a self, peer: PeerId, payload: &'a [u8]) -> BoxFuture<'a, Result<(), TransportError>>;

    /// Send `payload` to every peer this transport currently holds
    /// open. Individual failures are this transport's own concern; the
    /// peer manager handles non-duplication across transports.
    fn broadcast<'a>(&'a self, payload: &'a [u8]) -> BoxFuture<'a, Result<(), TransportError>>;

    /// Whether a send to `peer` is expected to succeed right now.
    fn is_connected(&self, peer: PeerId) -> bool;

    /// The peers this transport currently holds an open link to.
    fn connected_peers(&self) -> Vec<PeerId>;

    /// Tear down all links and background tasks. After this resolves,
    /// every other method returns [`TransportError::NotInitialized`].
    fn destroy(&self) -> BoxFuture<'_, Result<(), TransportError>>;

    /// Subscribe to this transport's event stream. May be called once;
    /// implementations hand out a single receiver (listener
    /// registration happens exactly once per component lifetime, per
    /// spec §9 "Listener accumulation").
    fn subscribe(&self) -> tokio::sync::mpsc::UnboundedReceiver<TransportEvent>;
}
