//! The JSON-encoded control envelope catalog (protocol message catalog,
//! see spec §4.6): `sync`, `awareness`, `peer-request`, `peer-list`,
//! `peer-announce`, `signal`, `identity`, `ping`/`pong`, `disconnect`.
//!
//! Every variant carries `timestamp` (monotonic milliseconds). Unknown
//! `type` values round-trip through [`Envelope::Unknown`], preserving
//! only `type` and `timestamp` as required.
//!
//! A statically typed catalog like this one has no prototype chain for
//! a `__proto__`/`constructor`/`prototype` key to pollute, so unlike a
//! dynamically typed implementation of the same wire format, no
//! recursive key-scrubbing pass is needed here — messages are parsed
//! straight into these variants or rejected.

use serde::{Deserialize, Serialize, Serializer};

use crate::peer::PeerAddress;

/// Default maximum size, in bytes, of a control envelope accepted by
/// [`decode_control`].
pub const DEFAULT_MAX_ENVELOPE_BYTES: usize = 10 * 1024 * 1024;

/// Errors encoding or decoding a control envelope.
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    /// JSON serialization failed.
    #[error("failed to encode control envelope: {0}")]
    Encode(#[from] serde_json::Error),
    /// The encoded payload exceeded the configured size bound.
    #[error("control envelope too large: {size} bytes (max {max})")]
    TooLarge { size: usize, max: usize },
}

/// A `peer-request`/`peer-list` correlation id.
pub type RequestId = uuid::Uuid;

/// The protocol message catalog, internally tagged on
/// `type` in kebab-case, exactly matching the wire table in the spec.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
enum KnownEnvelope {
    Sync {
        #[serde(rename = "docId")]
        doc_id: String,
        /// Base64-encoded `frame_encode` output.
        data: String,
        origin: crate::peer::PeerId,
        timestamp: u64,
    },
    Awareness {
        #[serde(rename = "docId")]
        doc_id: String,
        states: serde_json::Map<String, serde_json::Value>,
        timestamp: u64,
    },
    #[serde(rename = "peer-request")]
    PeerRequest {
        #[serde(rename = "requestId")]
        request_id: RequestId,
        timestamp: u64,
    },
    #[serde(rename = "peer-list")]
    PeerList {
        peers: Vec<PeerAddress>,
        #[serde(rename = "requestId", default, skip_serializing_if = "Option::is_none")]
        request_id: Option<RequestId>,
        timestamp: u64,
    },
    #[serde(rename = "peer-announce")]
    PeerAnnounce { peer: PeerAddress, timestamp: u64 },
    Signal {
        #[serde(rename = "targetPeerId")]
        target_peer_id: crate::peer::PeerId,
        #[serde(rename = "fromPeerId")]
        from_peer_id: crate::peer::PeerId,
        #[serde(rename = "signalData")]
        signal_data: serde_json::Value,
        timestamp: u64,
    },
    Identity {
        #[serde(rename = "publicKey")]
        public_key: String,
        #[serde(rename = "displayName")]
        display_name: String,
        color: String,
        transports: Vec<String>,
        timestamp: u64,
    },
    Ping { timestamp: u64 },
    Pong {
        #[serde(rename = "pingTimestamp")]
        ping_timestamp: u64,
        timestamp: u64,
    },
    Disconnect { reason: String, timestamp: u64 },
}

/// Preserves the `type` and `timestamp` of an envelope this
/// implementation does not otherwise understand.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnknownEnvelope {
    #[serde(rename = "type")]
    pub kind: String,
    pub timestamp: u64,
    /// Any other fields, preserved opaquely.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// A decoded control envelope: either one of the known catalog types
/// or an [`Envelope::Unknown`] fallback that preserves
/// `type`/`timestamp` only.
///
/// The `Envelope::Sync { .. }`-style variant constructors below mirror
/// [`KnownEnvelope`]'s shape; `Envelope` itself has a hand-written
/// [`Deserialize`] impl (rather than `#[serde(tag = "type")]` directly)
/// because serde's internally tagged representation has no built-in
/// "else" arm — an unrecognized `type` value is a hard error under that
/// derive, whereas spec §9 requires unknown types to degrade gracefully
/// into a preserved catch-all instead.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    Sync {
        doc_id: String,
        data: String,
        origin: crate::peer::PeerId,
        timestamp: u64,
    },
    Awareness {
        doc_id: String,
        states: serde_json::Map<String, serde_json::Value>,
        timestamp: u64,
    },
    PeerRequest {
        request_id: RequestId,
        timestamp: u64,
    },
    PeerList {
        peers: Vec<PeerAddress>,
        request_id: Option<RequestId>,
        timestamp: u64,
    },
    PeerAnnounce {
        peer: PeerAddress,
        timestamp: u64,
    },
    Signal {
        target_peer_id: crate::peer::PeerId,
        from_peer_id: crate::peer::PeerId,
        signal_data: serde_json::Value,
        timestamp: u64,
    },
    Identity {
        public_key: String,
        display_name: String,
        color: String,
        transports: Vec<String>,
        timestamp: u64,
    },
    Ping {
        timestamp: u64,
    },
    Pong {
        ping_timestamp: u64,
        timestamp: u64,
    },
    Disconnect {
        reason: String,
        timestamp: u64,
    },
    /// Catch-all for any `type` this implementation does not recognize.
    Unknown(UnknownEnvelope),
}

impl From<KnownEnvelope> for Envelope {
    fn from(known: KnownEnvelope) -> Self {
        match known {
            KnownEnvelope::Sync { doc_id, data, origin, timestamp } => {
                Self::Sync { doc_id, data, origin, timestamp }
            }
            KnownEnvelope::Awareness { doc_id, states, timestamp } => {
                Self::Awareness { doc_id, states, timestamp }
            }
            KnownEnvelope::PeerRequest { request_id, timestamp } => {
                Self::PeerRequest { request_id, timestamp }
            }
            KnownEnvelope::PeerList { peers, request_id, timestamp } => {
                Self::PeerList { peers, request_id, timestamp }
            }
            KnownEnvelope::PeerAnnounce { peer, timestamp } => {
                Self::PeerAnnounce { peer, timestamp }
            }
            KnownEnvelope::Signal { target_peer_id, from_peer_id, signal_data, timestamp } => {
                Self::Signal { target_peer_id, from_peer_id, signal_data, timestamp }
            }
            KnownEnvelope::Identity { public_key, display_name, color, transports, timestamp } => {
                Self::Identity { public_key, display_name, color, transports, timestamp }
            }
            KnownEnvelope::Ping { timestamp } => Self::Ping { timestamp },
            KnownEnvelope::Pong { ping_timestamp, timestamp } => {
                Self::Pong { ping_timestamp, timestamp }
            }
            KnownEnvelope::Disconnect { reason, timestamp } => Self::Disconnect { reason, timestamp },
        }
    }
}

impl TryFrom<Envelope> for KnownEnvelope {
    type Error = UnknownEnvelope;

    fn try_from(envelope: Envelope) -> Result<Self, Self::Error> {
        match envelope {
            Envelope::Sync { doc_id, data, origin, timestamp } => {
                Ok(Self::Sync { doc_id, data, origin, timestamp })
            }
            Envelope::Awareness { doc_id, states, timestamp } => {
                Ok(Self::Awareness { doc_id, states, timestamp })
            }
            Envelope::PeerRequest { request_id, timestamp } => {
                Ok(Self::PeerRequest { request_id, timestamp })
            }
            Envelope::PeerList { peers, request_id, timestamp } => {
                Ok(Self::PeerList { peers, request_id, timestamp })
            }
            Envelope::PeerAnnounce { peer, timestamp } => Ok(Self::PeerAnnounce { peer, timestamp }),
            Envelope::Signal { target_peer_id, from_peer_id, signal_data, timestamp } => {
                Ok(Self::Signal { target_peer_id, from_peer_id, signal_data, timestamp })
            }
            Envelope::Identity { public_key, display_name, color, transports, timestamp } => {
                Ok(Self::Identity { public_key, display_name, color, transports, timestamp })
            }
            Envelope::Ping { timestamp } => Ok(Self::Ping { timestamp }),
            Envelope::Pong { ping_timestamp, timestamp } => {
                Ok(Self::Pong { ping_timestamp, timestamp })
            }
            Envelope::Disconnect { reason, timestamp } => Ok(Self::Disconnect { reason, timestamp }),
            Envelope::Unknown(u) => Err(u),
        }
    }
}

impl Serialize for Envelope {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self.clone().try_into() {
            Ok(known) => KnownEnvelope::serialize(&known, serializer),
            Err(unknown) => UnknownEnvelope::serialize(&unknown, serializer),
        }
    }
}

impl<'de> Deserialize<'de> for Envelope {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let value = serde_json::Value::deserialize(deserializer)?;
        if let Ok(known) = serde_json::from_value::<KnownEnvelope>(value.clone()) {
            return Ok(known.into());
        }
        let unknown: UnknownEnvelope =
            serde_json::from_value(value).map_err(serde::de::Error::custom)?;
        Ok(Self::Unknown(unknown))
    }
}

impl Envelope {
    /// The `timestamp` field carried by every variant.
    #[must_use]
    pub fn timestamp(&self) -> u64 {
        match self {
            Self::Sync { timestamp, .. }
            | Self::Awareness { timestamp, .. }
            | Self::PeerRequest { timestamp, .. }
            | Self::PeerList { timestamp, .. }
            | Self::PeerAnnounce { timestamp, .. }
            | Self::Signal { timestamp, .. }
            | Self::Identity { timestamp, .. }
            | Self::Ping { timestamp }
            | Self::Pong { timestamp, .. }
            | Self::Disconnect { timestamp, .. } => *timestamp,
            Self::Unknown(u) => u.timestamp,
        }
    }
}

/// Encode an [`Envelope`] as JSON.
///
/// # Errors
///
/// Returns [`ControlError::Encode`] only on malformed input (should not
/// occur for well-typed envelopes; serialization of these types cannot
/// fail in ordinary operation).
pub fn encode_control(envelope: &Envelope) -> Result<Vec<u8>, ControlError> {
    Ok(serde_json::to_vec(envelope)?)
}

/// Decode a JSON control envelope, rejecting payloads over `max_bytes`.
///
/// Returns `Ok(None)` if the bytes are not valid JSON or do not match
/// the envelope schema — a malformed control message is dropped, not
/// treated as fatal, matching the `ProtocolError` policy in spec §7.
///
/// # Errors
///
/// Returns [`ControlError::TooLarge`] if `bytes.len()` exceeds
/// `max_bytes`.
pub fn decode_control(bytes: &[u8], max_bytes: usize) -> Result<Option<Envelope>, ControlError> {
    if bytes.len() > max_bytes {
        return Err(ControlError::TooLarge {
            size: bytes.len(),
            max: max_bytes,
        });
    }
    Ok(serde_json::from_slice(bytes).ok())
}
