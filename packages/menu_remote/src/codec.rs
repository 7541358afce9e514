//! Codec boundary and length-prefixed framing.
//!
//! Wire format: `[4-byte big-endian length][payload]`. The payload encoding
//! is whatever `MenuCodec` the connection was built with.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::RemoteError;
use crate::protocol::MenuCommand;

/// Maximum frame size (1 MiB). Larger frames are refused.
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Turns commands into frame payloads and back.
pub trait MenuCodec: Send + Sync + 'static {
    fn encode(&self, cmd: &MenuCommand) -> Result<Vec<u8>, RemoteError>;
    fn decode(&self, bytes: &[u8]) -> Result<MenuCommand, RemoteError>;
}

/// JSON payloads, one command per frame.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl MenuCodec for JsonCodec {
    fn encode(&self, cmd: &MenuCommand) -> Result<Vec<u8>, RemoteError> {
        Ok(serde_json::to_vec(cmd)?)
    }

    fn decode(&self, bytes: &[u8]) -> Result<MenuCommand, RemoteError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Write one frame.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<(), RemoteError>
where
    W: AsyncWrite + Unpin,
{
    if payload.len() > MAX_FRAME_SIZE {
        return Err(RemoteError::FrameTooLarge {
            len: payload.len(),
            max: MAX_FRAME_SIZE,
        });
    }
    let len = (payload.len() as u32).to_be_bytes();
    writer.write_all(&len).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame.
///
/// Returns `None` if the stream ended cleanly between frames.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Vec<u8>>, RemoteError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(RemoteError::FrameTooLarge {
            len,
            max: MAX_FRAME_SIZE,
        });
    }

    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(Some(buf))
}
