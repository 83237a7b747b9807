//! Mesh rendezvous/relay server library.
//!
//! Accepts WebSocket connections from relay transports, tracks topic
//! membership, and forwards opaque frames and signaling blobs between
//! peers. Exposed as a library so integration tests and `meshd` itself
//! can start an in-process instance.

pub mod config;
pub mod ratelimit;
pub mod server;
pub mod topics;
