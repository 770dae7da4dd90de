//! Length-prefixed framing.
//!
//! Control messages and the token handshake travel as a 4-byte big-endian
//! length followed by the payload. A new tunnel stream opens with the fixed
//! 2-byte big-endian target port instead.

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on a single control frame. Tokens and signals are tiny;
/// anything near this size is a corrupt or hostile peer.
pub const MAX_FRAME_LEN: u32 = 1024 * 1024;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame of {0} bytes exceeds the control frame limit")]
    Oversize(u32),
}

/// Writes `payload` as one length-prefixed frame.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let len = payload.len() as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one length-prefixed frame.
pub async fn read_frame<R>(reader: &mut R) -> Result<Vec<u8>, FrameError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes).await?;
    let len = u32::from_be_bytes(len_bytes);
    if len > MAX_FRAME_LEN {
        return Err(FrameError::Oversize(len));
    }
    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await?;
    Ok(payload)
}

/// Writes the 2-byte big-endian target port that opens every tunnel stream.
pub async fn write_port<W>(writer: &mut W, port: u16) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    writer.write_all(&port.to_be_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads the 2-byte big-endian target port.
pub async fn read_port<R>(reader: &mut R) -> Result<u16, FrameError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut bytes = [0u8; 2];
    reader.read_exact(&mut bytes).await?;
    Ok(u16::from_be_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frame_round_trip() {
        let (mut a, mut b) = tokio::io::duplex(256);
        write_frame(&mut a, b"sahmadiut").await.unwrap();
        assert_eq!(read_frame(&mut b).await.unwrap(), b"sahmadiut");
    }

    #[tokio::test]
    async fn empty_frame_round_trip() {
        let (mut a, mut b) = tokio::io::duplex(64);
        write_frame(&mut a, b"").await.unwrap();
        assert_eq!(read_frame(&mut b).await.unwrap(), Vec::<u8>::new());
    }

    #[tokio::test]
    async fn oversize_frame_is_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        let len = MAX_FRAME_LEN + 1;
        tokio::io::AsyncWriteExt::write_all(&mut a, &len.to_be_bytes())
            .await
            .unwrap();
        assert!(matches!(
            read_frame(&mut b).await,
            Err(FrameError::Oversize(_))
        ));
    }

    #[tokio::test]
    async fn port_is_big_endian() {
        let (mut a, mut b) = tokio::io::duplex(64);
        write_port(&mut a, 22).await.unwrap();
        let mut raw = [0u8; 2];
        tokio::io::AsyncReadExt::read_exact(&mut b, &mut raw)
            .await
            .unwrap();
        assert_eq!(raw, [0x00, 0x16]);
    }

    #[tokio::test]
    async fn port_round_trip() {
        let (mut a, mut b) = tokio::io::duplex(64);
        write_port(&mut a, 65535).await.unwrap();
        assert_eq!(read_port(&mut b).await.unwrap(), 65535);
    }
}
