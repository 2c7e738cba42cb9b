//! Frame and handshake codecs.

use common::{
    bytes::Bytes,
    serde::{de::DeserializeOwned, Serialize},
    serde_json,
    tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
};

use crate::ProtocolError;

/// First bytes on the wire, before the protocol version
pub const MAGIC: &[u8; 4] = b"RSNC";

/// Upper bound on a single frame payload
///
/// Streaming bodies are chunked well below this; anything larger indicates a
/// corrupt length prefix.
pub const MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;

/// Chunk size used when streaming bodies
pub const CHUNK_SIZE: usize = 64 * 1024;

/// The kind byte following the length prefix
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    /// JSON-encoded [`crate::Request`] or [`crate::Response`]
    Control = 0,
    /// A chunk of a streaming body (file contents, `Run` stdin or stdout)
    Data = 1,
    /// End marker for a streaming body; always has an empty payload
    DataEnd = 2,
    /// A chunk of `Run` stderr
    Stderr = 3,
}

impl FrameKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Control => "control",
            Self::Data => "data",
            Self::DataEnd => "data-end",
            Self::Stderr => "stderr",
        }
    }

    fn from_byte(byte: u8) -> Result<Self, ProtocolError> {
        match byte {
            0 => Ok(Self::Control),
            1 => Ok(Self::Data),
            2 => Ok(Self::DataEnd),
            3 => Ok(Self::Stderr),
            other => Err(ProtocolError::UnknownFrameKind(other)),
        }
    }
}

/// One frame off the wire
#[derive(Debug, Clone)]
pub struct Frame {
    pub kind: FrameKind,
    pub payload: Bytes,
}

impl Frame {
    /// Decode a control frame's JSON payload
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        if self.kind != FrameKind::Control {
            return Err(ProtocolError::UnexpectedFrame {
                expected: "control",
                got: self.kind.name(),
            });
        }
        serde_json::from_slice(&self.payload).map_err(ProtocolError::Decode)
    }
}

/// Write the handshake: magic then protocol version
pub async fn write_handshake<W>(writer: &mut W, protocol_version: u32) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(MAGIC).await?;
    writer.write_u32(protocol_version).await?;
    writer.flush().await?;
    Ok(())
}

/// Read and verify the handshake, returning the peer's protocol version
///
/// The caller compares the returned version against its own and fails the
/// connection on mismatch.
pub async fn read_handshake<R>(reader: &mut R, ours: u32) -> Result<u32, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut magic = [0u8; 4];
    reader.read_exact(&mut magic).await?;
    if &magic != MAGIC {
        return Err(ProtocolError::BadMagic(magic));
    }
    let theirs = reader.read_u32().await?;
    if theirs != ours {
        return Err(ProtocolError::VersionMismatch { ours, theirs });
    }
    Ok(theirs)
}

/// Write one frame: length prefix, kind byte, payload
pub async fn write_frame<W>(
    writer: &mut W,
    kind: FrameKind,
    payload: &[u8],
) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    if payload.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(payload.len()));
    }
    writer.write_u32(payload.len() as u32).await?;
    writer.write_u8(kind as u8).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame
pub async fn read_frame<R>(reader: &mut R) -> Result<Frame, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let len = reader.read_u32().await? as usize;
    if len > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(len));
    }
    let kind = FrameKind::from_byte(reader.read_u8().await?)?;
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Frame {
        kind,
        payload: payload.into(),
    })
}

/// Serialize and write a control frame
pub async fn write_control<W, T>(writer: &mut W, message: &T) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let payload = serde_json::to_vec(message).map_err(ProtocolError::Encode)?;
    write_frame(writer, FrameKind::Control, &payload).await
}
