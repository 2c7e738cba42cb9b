//! The wire protocol spoken between a host wrapper and the deployed agent.
//!
//! Everything travels as length-prefixed frames over the agent's piped
//! stdio: a 4-byte big-endian payload length, a 1-byte frame kind, then the
//! payload. Control frames carry JSON-encoded [`Request`]s and
//! [`Response`]s; streaming bodies (file contents, the stdio of `Run`) are
//! chunked as data frames terminated by an empty end-marker frame.
//!
//! A connection starts with a handshake (magic + protocol version from the
//! agent, echoed back by the client); a mismatch is fatal. Requests on one
//! connection are strictly serialized: the client sends a request (plus its
//! body, if any) and reads frames until the response terminator before
//! submitting the next request.

mod frames;
mod messages;

pub use frames::{
    read_frame, read_handshake, write_control, write_frame, write_handshake, Frame, FrameKind,
    CHUNK_SIZE, MAGIC, MAX_FRAME_SIZE,
};
pub use messages::{
    ErrorKind, ExitStatus, FileMetadata, FileType, Group, Request, Response, User,
};

use common::thiserror::{self, Error};

/// Errors arising from the wire itself, as opposed to errors the agent
/// reports about an operation
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("i/o on agent pipe: {0}")]
    Io(#[from] std::io::Error),

    #[error("bad magic in handshake: expected {MAGIC:?}, got {0:?}")]
    BadMagic([u8; 4]),

    #[error("agent protocol version mismatch: ours {ours}, theirs {theirs}")]
    VersionMismatch { ours: u32, theirs: u32 },

    #[error("frame of {0} bytes exceeds the {MAX_FRAME_SIZE} byte limit")]
    FrameTooLarge(usize),

    #[error("unknown frame kind {0}")]
    UnknownFrameKind(u8),

    #[error("unexpected frame: expected {expected}, got {got}")]
    UnexpectedFrame {
        expected: &'static str,
        got: &'static str,
    },

    #[error("encoding control frame: {0}")]
    Encode(#[source] common::serde_json::Error),

    #[error("decoding control frame: {0}")]
    Decode(#[source] common::serde_json::Error),
}
