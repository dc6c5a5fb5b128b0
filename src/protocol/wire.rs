//! Wire Framing
//!
//! Length-prefixed (u32 big-endian) JSON envelopes over any reliable ordered
//! byte stream. Requests carry an id echoed by the matching response so both
//! sides can correlate replies on a fully duplex connection.

use crate::error::ProtocolError;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on a single frame. A full cluster snapshot fits comfortably;
/// anything larger is a protocol violation.
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

/// One framed protocol message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Envelope {
    Request {
        id: u64,
        command: String,
        args: serde_json::Value,
    },
    Response {
        id: u64,
        result: serde_json::Value,
    },
    /// Command-level failure, isolated to the request it answers.
    Error {
        id: u64,
        message: String,
    },
}

impl Envelope {
    pub fn id(&self) -> u64 {
        match self {
            Envelope::Request { id, .. } => *id,
            Envelope::Response { id, .. } => *id,
            Envelope::Error { id, .. } => *id,
        }
    }
}

/// Write one envelope as a length-prefixed frame.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    envelope: &Envelope,
) -> Result<(), ProtocolError> {
    let payload = serde_json::to_vec(envelope)
        .map_err(|e| ProtocolError::MalformedFrame(e.to_string()))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| ProtocolError::FrameTooLarge(u32::MAX))?;
    if len > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge(len));
    }
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed envelope. A clean EOF before the length prefix
/// reports [`ProtocolError::ConnectionClosed`].
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Envelope, ProtocolError> {
    let mut len_bytes = [0u8; 4];
    match reader.read_exact(&mut len_bytes).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(ProtocolError::ConnectionClosed)
        }
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(len_bytes);
    if len > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge(len));
    }
    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await?;
    serde_json::from_slice(&payload).map_err(|e| ProtocolError::MalformedFrame(e.to_string()))
}
