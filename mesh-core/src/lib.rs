//! The mesh core: peer discovery, overlay maintenance, and the
//! encrypted-frame transport layer underneath a CRDT-backed workspace.
//!
//! This crate owns no CRDT state itself — it moves encrypted bytes
//! between peers and hands the embedder decoded plaintext updates
//! through [`sink::DocSink`].

pub mod awareness;
pub mod bootstrap;
pub mod bridge;
pub mod config;
pub mod crypto;
pub mod error;
pub mod peer_manager;
pub mod sink;
pub mod transport;

pub use bridge::DocRouter;
pub use error::MeshError;
pub use peer_manager::{MeshEvent, PeerManager};
