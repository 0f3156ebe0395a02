//! Stream transport: a single listener demultiplexed by a one-byte tag
//! into consensus RPC framing and replication streams.

pub mod client;
pub mod server;
pub mod stream_layer;

pub use client::RaftClient;
pub use stream_layer::{Connection, StreamLayer, CONSENSUS_TAG, STREAM_TAG};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

/// Consensus RPC opcodes carried in the frame header.
pub(crate) const OP_REQUEST_VOTE: u8 = 1;
pub(crate) const OP_APPEND_ENTRIES: u8 = 2;
pub(crate) const OP_JOIN: u8 = 3;
pub(crate) const OP_LEAVE: u8 = 4;

/// Response status codes.
pub(crate) const STATUS_OK: u8 = 0;
pub(crate) const STATUS_ERR: u8 = 1;

/// Upper bound on a single frame, to keep a misbehaving peer from forcing
/// an unbounded allocation.
const MAX_FRAME_LEN: usize = 8 * 1024 * 1024;

/// Writes one `code | u32 length | payload` frame.
pub(crate) async fn write_frame<W>(writer: &mut W, code: u8, payload: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_u8(code).await?;
    writer.write_u32(payload.len() as u32).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one frame, returning its code byte and payload.
pub(crate) async fn read_frame<R>(reader: &mut R) -> Result<(u8, Vec<u8>)>
where
    R: AsyncRead + Unpin,
{
    let code = reader.read_u8().await?;
    let len = reader.read_u32().await? as usize;
    if len > MAX_FRAME_LEN {
        return Err(Error::Protocol(format!("frame of {len} bytes exceeds limit")));
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok((code, payload))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frame_round_trip() {
        let (mut a, mut b) = tokio::io::duplex(1024);

        write_frame(&mut a, OP_APPEND_ENTRIES, b"payload").await.unwrap();
        let (code, payload) = read_frame(&mut b).await.unwrap();
        assert_eq!(code, OP_APPEND_ENTRIES);
        assert_eq!(payload, b"payload");

        write_frame(&mut b, STATUS_OK, &[]).await.unwrap();
        let (code, payload) = read_frame(&mut a).await.unwrap();
        assert_eq!(code, STATUS_OK);
        assert!(payload.is_empty());
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);

        tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            a.write_u8(OP_REQUEST_VOTE).await.unwrap();
            a.write_u32(u32::MAX).await.unwrap();
        });

        match read_frame(&mut b).await {
            Err(Error::Protocol(_)) => {}
            other => panic!("expected Protocol error, got {other:?}"),
        }
    }
}
