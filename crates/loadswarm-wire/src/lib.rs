//! LoadSwarm console wire protocol.
//!
//! Every process that talks to the console — agents, console clients,
//! and workers — uses JSON-framed messages over TCP. Each message is
//! prefixed with a 4-byte big-endian length header, and the first frame
//! on every connection must be a role declaration.
//!
//! ## Architecture
//!
//! - **ConnectionRole**: which pool a connection is drained by
//! - **PeerAddress**: identity of one remote endpoint
//! - **WireMessage**: the JSON-framed envelope
//! - **MessageKind**: the dispatch key for decoded messages

pub mod message;
pub mod role;

pub use message::{
    decode_frames, encode_frame, FrameError, MessageKind, ReceivedMessage, WireMessage,
    WirePayload, MAX_FRAME_SIZE, PROTOCOL_VERSION,
};
pub use role::{ConnectionRole, PeerAddress};
