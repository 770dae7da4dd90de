//! Bidirectional byte pump.
//!
//! Splices a tunnel stream and a peer socket. Each direction runs
//! independently; a clean EOF in one direction only shuts down the other
//! endpoint's write side, so in-flight bytes the opposite way still drain.
//! Both endpoints close once both directions have finished.

use crate::usage::{ByteSink, Direction};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

const BUFFER_SIZE: usize = 16 * 1024;

/// Pumps bytes between `tunnel` and `peer` until both directions finish.
///
/// Bytes arriving from the tunnel count as [`Direction::Inbound`] on
/// `port`, bytes heading into the tunnel as [`Direction::Outbound`].
/// Returns the totals `(inbound, outbound)`.
pub async fn pipe<A, B>(
    tunnel: A,
    peer: B,
    port: u16,
    sink: Option<Arc<dyn ByteSink>>,
) -> (u64, u64)
where
    A: AsyncRead + AsyncWrite + Send + Unpin,
    B: AsyncRead + AsyncWrite + Send + Unpin,
{
    let (mut tunnel_read, mut tunnel_write) = tokio::io::split(tunnel);
    let (mut peer_read, mut peer_write) = tokio::io::split(peer);

    let inbound_sink = sink.clone();
    let inbound = async {
        copy_counted(
            &mut tunnel_read,
            &mut peer_write,
            port,
            Direction::Inbound,
            inbound_sink.as_deref(),
        )
        .await
    };
    let outbound = async {
        copy_counted(
            &mut peer_read,
            &mut tunnel_write,
            port,
            Direction::Outbound,
            sink.as_deref(),
        )
        .await
    };

    let (inbound_total, outbound_total) = tokio::join!(inbound, outbound);
    debug!(port, inbound_total, outbound_total, "relay finished");
    (inbound_total, outbound_total)
}

async fn copy_counted<R, W>(
    reader: &mut R,
    writer: &mut W,
    port: u16,
    direction: Direction,
    sink: Option<&dyn ByteSink>,
) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buffer = vec![0u8; BUFFER_SIZE];
    let mut total = 0u64;
    loop {
        match reader.read(&mut buffer).await {
            Ok(0) => break,
            Ok(n) => {
                if writer.write_all(&buffer[..n]).await.is_err() {
                    break;
                }
                total += n as u64;
                if let Some(sink) = sink {
                    sink.record(port, n as u64, direction);
                }
            }
            Err(e) => {
                debug!("relay read ended: {e}");
                break;
            }
        }
    }
    // half-close: the reverse direction keeps flowing until its own EOF
    let _ = writer.shutdown().await;
    total
}
