//! The top-level error kinds of spec §7, and the propagation policy
//! around them: `AuthFail` never reaches a caller, transport errors are
//! absorbed into events, and only user-invoked APIs (`join_workspace`,
//! `send`, `broadcast`) propagate `MeshError` at all.

use mesh_proto::{ControlError, FrameError, PeerId};

use crate::crypto::CryptoError;
use crate::transport::TransportError;

/// Errors surfaced to callers of the mesh core's public API.
#[derive(Debug, thiserror::Error)]
pub enum MeshError {
    /// Caller-provided data violated a documented precondition.
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// A workspace key was the wrong length or shape, or all-zero.
    #[error("invalid workspace key")]
    InvalidKey,
    /// A frame's version mismatched or its header was truncated. Drop
    /// and continue; never propagated from the event-routing path, only
    /// from direct calls to the codec.
    #[error("protocol error: {0}")]
    Protocol(#[from] FrameError),
    /// A transport I/O failure, timeout, or server disconnect.
    #[error("transient transport error: {0}")]
    Transient(#[from] TransportError),
    /// `send`/`broadcast` found no reachable path to the target peer.
    #[error("no transport can reach peer {0}")]
    NoTransport(PeerId),
    /// The operation was invoked before `initialize` or after `destroy`.
    #[error("mesh core is not initialized")]
    NotInitialized,
    /// A control envelope failed to encode or exceeded the size bound.
    #[error("control envelope error: {0}")]
    Control(#[from] ControlError),
}

impl From<CryptoError> for MeshError {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::InvalidInput => Self::InvalidInput("plaintext out of bounds".to_string()),
            CryptoError::InvalidKey => Self::InvalidKey,
            // AuthFail is never propagated; callers that map a
            // CryptoError through `?` into MeshError only ever see this
            // for genuinely out-of-band cases (e.g. re-keying checks),
            // not for inbound frame decryption, which is handled
            // separately by dropping the frame silently.
            CryptoError::AuthFail => Self::InvalidInput("authentication failed".to_string()),
        }
    }
}
