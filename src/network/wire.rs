//! Length-prefixed JSON wire protocol for peer sessions.
//!
//! Frame format: 4-byte big-endian length, then UTF-8 JSON
//! `{"code": <int>, "data": <any>}`. Maximum frame size 4 MiB.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum allowed frame size (4 MiB).
pub const MAX_FRAME_SIZE: u32 = 4 * 1024 * 1024;

#[derive(thiserror::Error, Debug)]
pub enum WireError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame too large: {0} bytes")]
    FrameTooLarge(u32),

    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("unknown message code {0}")]
    UnknownCode(u8),

    #[error("bad payload for code {code}: {reason}")]
    BadPayload { code: u8, reason: String },
}

/// Raw `{code, data}` envelope.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Frame {
    pub code: u8,
    pub data: Value,
}

/// Serialize and write one frame.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    frame: &Frame,
) -> Result<(), WireError> {
    let payload = serde_json::to_vec(frame)?;
    let len = payload.len() as u32;
    if len > MAX_FRAME_SIZE {
        return Err(WireError::FrameTooLarge(len));
    }
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame. `Ok(None)` on clean EOF.
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<Option<Frame>, WireError> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_SIZE {
        return Err(WireError::FrameTooLarge(len));
    }

    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await?;
    let frame = serde_json::from_slice(&payload)?;
    Ok(Some(frame))
}
