//! Wire types shared by every crate in the workspace: peer identity and
//! addressing, topic derivation, the binary frame layout, and the JSON
//! control envelope catalog. This crate does no I/O — it only defines
//! the shapes that cross the wire and the pure functions that encode
//! and decode them.

pub mod control;
pub mod frame;
pub mod peer;
pub mod rendezvous;

pub use control::{
    decode_control, encode_control, ControlError, Envelope, RequestId, UnknownEnvelope,
    DEFAULT_MAX_ENVELOPE_BYTES,
};
pub use frame::{frame_decode, frame_encode, FrameError, FRAME_VERSION};
pub use peer::{PeerAddress, PeerId, PeerIdError, Topic};
pub use rendezvous::{ClientOp, ServerOp};
