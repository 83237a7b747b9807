//! Peer identity, peer addressing, and topic derivation.
//!
//! These are the stable identifiers the rest of the mesh core is built
//! around: a [`PeerId`] names a participant, a [`PeerAddress`] records
//! which transports can reach them, and a [`Topic`] is the group
//! identifier peers rendezvous on.

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// The literal prefix hashed together with a workspace id to derive its
/// [`Topic`]. Fixed for interop — changing it breaks discovery between
/// implementations that agree on the wire format.
const TOPIC_PREFIX: &[u8] = b"nightjar-workspace:";

/// A stable 16-byte opaque peer identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct PeerId([u8; 16]);

/// Errors constructing a [`PeerId`] from its hex representation.
#[derive(Debug, thiserror::Error)]
pub enum PeerIdError {
    /// The hex string did not decode to exactly 16 bytes.
    #[error("peer id must be 32 hex characters (16 bytes), got {0}")]
    WrongLength(usize),
    /// The string was not valid hex.
    #[error("invalid hex in peer id: {0}")]
    InvalidHex(String),
}

impl PeerId {
    /// Build a `PeerId` from raw bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Generate a random `PeerId` using the system CSPRNG.
    #[must_use]
    pub fn random() -> Self {
        use rand::RngCore;
        let mut bytes = [0u8; 16];
        rand::rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// The raw bytes of this peer id.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl FromStr for PeerId {
    type Err = PeerIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 32 {
            return Err(PeerIdError::WrongLength(s.len()));
        }
        let mut bytes = [0u8; 16];
        for (i, chunk) in s.as_bytes().chunks(2).enumerate() {
            let hex = std::str::from_utf8(chunk).map_err(|_| PeerIdError::InvalidHex(s.to_string()))?;
            bytes[i] = u8::from_str_radix(hex, 16).map_err(|_| PeerIdError::InvalidHex(s.to_string()))?;
        }
        Ok(Self(bytes))
    }
}

impl From<PeerId> for String {
    fn from(id: PeerId) -> Self {
        id.to_string()
    }
}

impl TryFrom<String> for PeerId {
    type Error = PeerIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// A 32-byte group identifier; peers on the same topic are candidates
/// for connection on DHT and rendezvous transports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct Topic([u8; 32]);

impl Topic {
    /// Derive the topic for a workspace id: SHA-256 of the fixed
    /// interop prefix concatenated with the workspace id's utf-8 bytes.
    ///
    /// This is bit-exact with spec property P5 and must never change.
    #[must_use]
    pub fn for_workspace(workspace_id: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(TOPIC_PREFIX);
        hasher.update(workspace_id.as_bytes());
        let digest = hasher.finalize();
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&digest);
        Self(bytes)
    }

    /// Raw bytes of the topic.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl FromStr for Topic {
    type Err = PeerIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 64 {
            return Err(PeerIdError::WrongLength(s.len()));
        }
        let mut bytes = [0u8; 32];
        for (i, chunk) in s.as_bytes().chunks(2).enumerate() {
            let hex = std::str::from_utf8(chunk).map_err(|_| PeerIdError::InvalidHex(s.to_string()))?;
            bytes[i] = u8::from_str_radix(hex, 16).map_err(|_| PeerIdError::InvalidHex(s.to_string()))?;
        }
        Ok(Self(bytes))
    }
}

impl From<Topic> for String {
    fn from(t: Topic) -> Self {
        t.to_string()
    }
}

impl TryFrom<String> for Topic {
    type Error = PeerIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Records which transports can reach a peer, plus advisory display
/// metadata. A `PeerAddress` is valid iff it names a peer and at least
/// one transport slot is populated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerAddress {
    /// The peer this address describes.
    pub peer_id: PeerId,
    /// Rendezvous URL, if reachable via relay.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relay: Option<String>,
    /// Whether the peer accepts direct-link dial.
    #[serde(default)]
    pub direct: bool,
    /// DHT public key, if the peer is in the DHT.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dht: Option<String>,
    /// `host:port` for local-network discovery.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local: Option<SocketAddr>,
    /// Advisory, untrusted display name.
    #[serde(default)]
    pub display_name: String,
    /// Advisory, untrusted color tag.
    #[serde(default)]
    pub color: String,
    /// Monotonic last-seen timestamp, milliseconds.
    pub last_seen: u64,
}

impl PeerAddress {
    /// A `PeerAddress` is valid iff at least one transport slot is
    /// non-empty/true.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.relay.is_some() || self.direct || self.dht.is_some() || self.local.is_some()
    }
}
