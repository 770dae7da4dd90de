//! Multiplexed tunnel sessions.
//!
//! One tunnel TCP connection carries many logical streams through yamux.
//! The server side opens data streams toward the client; the client side
//! accepts them. The client's very first stream on a fresh session is the
//! token handshake: it sends the shared token as a length-prefixed string
//! and the server answers `ok` or `error`.

use backhaul_proto::{read_frame, write_frame, AUTH_ERROR, AUTH_OK};
use backhaul_transport::{TransportError, TransportResult};
use futures_util::StreamExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tokio_yamux::config::Config as YamuxConfig;
use tokio_yamux::Control;
use tokio_yamux::session::Session;
use tokio_yamux::stream::StreamHandle;
use tracing::{debug, warn};

/// Keep-alive cadence, fixed short to detect dead peers quickly.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);
/// Writes stalled longer than this tear the session down.
const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(30);
/// yamux rejects stream windows below its 256 KiB initial window.
const MIN_STREAM_WINDOW: u32 = 256 * 1024;

/// Session tuning from the shared config surface.
///
/// `version`, `max_frame_size` and `max_receive_buffer` are smux-era knobs
/// with no yamux counterpart; they are validated upstream and recorded
/// here, while `max_stream_buffer` drives the per-stream window.
#[derive(Debug, Clone)]
pub struct MuxConfig {
    pub version: u8,
    pub max_frame_size: u32,
    pub max_receive_buffer: u32,
    pub max_stream_buffer: u32,
}

impl MuxConfig {
    fn to_yamux(&self) -> YamuxConfig {
        let mut config = YamuxConfig::default();
        config.keepalive_interval = KEEPALIVE_INTERVAL;
        config.connection_write_timeout = KEEPALIVE_TIMEOUT;
        config.max_stream_window_size = self.max_stream_buffer.max(MIN_STREAM_WINDOW);
        config
    }
}

/// Which functional side of the session this peer plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// Opens data streams (the tunnel server).
    Open,
    /// Accepts data streams (the tunnel client).
    Accept,
}

/// Handle to one live multiplexed session.
///
/// The yamux session is driven by a task spawned under the instance scope;
/// when the peer goes away or the scope is cancelled the driver exits and
/// the handle reads as closed.
pub struct MuxSession {
    control: Mutex<Control>,
    inbound: Mutex<mpsc::Receiver<StreamHandle>>,
    closed: Arc<AtomicBool>,
}

impl MuxSession {
    /// Wraps `io` in a yamux session and spawns its driver under `scope`.
    pub fn spawn<T>(io: T, side: Side, config: &MuxConfig, scope: CancellationToken) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let mut session = match side {
            Side::Open => Session::new_client(io, config.to_yamux()),
            Side::Accept => Session::new_server(io, config.to_yamux()),
        };
        let control = session.control();
        let (inbound_tx, inbound_rx) = mpsc::channel(64);
        let closed = Arc::new(AtomicBool::new(false));
        let closed_flag = closed.clone();

        tokio::spawn(async move {
            let mut session = Box::pin(session);
            loop {
                tokio::select! {
                    _ = scope.cancelled() => break,
                    next = session.next() => match next {
                        Some(Ok(stream)) => {
                            // a dropped receiver only means nobody wants
                            // inbound streams; keep polling to drive i/o
                            let _ = inbound_tx.send(stream).await;
                        }
                        Some(Err(e)) => {
                            debug!("mux session ended: {e}");
                            break;
                        }
                        None => {
                            debug!("mux session closed by peer");
                            break;
                        }
                    },
                }
            }
            closed_flag.store(true, Ordering::SeqCst);
        });

        Self {
            control: Mutex::new(control),
            inbound: Mutex::new(inbound_rx),
            closed,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Opens a new data stream on this session.
    pub async fn open_stream(&self) -> TransportResult<StreamHandle> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let mut control = self.control.lock().await;
        control
            .open_stream()
            .await
            .map_err(|e| TransportError::Protocol(format!("open stream: {e}")))
    }

    /// Waits for the peer to open a stream.
    pub async fn accept_stream(&self) -> TransportResult<StreamHandle> {
        let mut inbound = self.inbound.lock().await;
        inbound.recv().await.ok_or(TransportError::Closed)
    }

    /// Asks the session to shut down cleanly.
    pub async fn close(&self) {
        let mut control = self.control.lock().await;
        let _ = control.close().await;
    }
}

/// Client side of the token handshake: opens the session's first stream,
/// presents the token and waits for the verdict.
pub async fn authenticate(session: &MuxSession, token: &str) -> TransportResult<()> {
    let mut stream = session.open_stream().await?;
    write_frame(&mut stream, token.as_bytes()).await?;
    let reply = read_frame(&mut stream).await?;
    if reply == AUTH_OK {
        Ok(())
    } else {
        Err(TransportError::AuthRejected)
    }
}

/// Server side of the token handshake: reads the token off the session's
/// first stream and answers. `Ok(false)` is a mismatch; the caller closes
/// the session and rate-limits the next attempt.
pub async fn expect_token(session: &MuxSession, token: &str) -> TransportResult<bool> {
    let mut stream = session.accept_stream().await?;
    let presented = read_frame(&mut stream).await?;
    if presented == token.as_bytes() {
        write_frame(&mut stream, AUTH_OK).await?;
        Ok(true)
    } else {
        warn!("token mismatch on tunnel session");
        let _ = write_frame(&mut stream, AUTH_ERROR).await;
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn test_config() -> MuxConfig {
        MuxConfig {
            version: 1,
            max_frame_size: 32768,
            max_receive_buffer: 4 * 1024 * 1024,
            max_stream_buffer: 65536,
        }
    }

    fn session_pair(scope: &CancellationToken) -> (MuxSession, MuxSession) {
        let (server_io, client_io) = tokio::io::duplex(256 * 1024);
        let config = test_config();
        let opener = MuxSession::spawn(server_io, Side::Open, &config, scope.child_token());
        let acceptor = MuxSession::spawn(client_io, Side::Accept, &config, scope.child_token());
        (opener, acceptor)
    }

    #[tokio::test]
    async fn stream_carries_bytes_between_peers() {
        let scope = CancellationToken::new();
        let (opener, acceptor) = session_pair(&scope);

        let mut outgoing = opener.open_stream().await.unwrap();
        outgoing.write_all(b"ping").await.unwrap();
        outgoing.flush().await.unwrap();

        let mut incoming = acceptor.accept_stream().await.unwrap();
        let mut buf = [0u8; 4];
        incoming.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        scope.cancel();
    }

    #[tokio::test]
    async fn token_handshake_accepts_matching_token() {
        let scope = CancellationToken::new();
        let (opener, acceptor) = session_pair(&scope);

        let server = tokio::spawn(async move {
            let ok = expect_token(&opener, "sahmadiut").await.unwrap();
            (opener, ok)
        });
        authenticate(&acceptor, "sahmadiut").await.unwrap();

        let (_opener, ok) = server.await.unwrap();
        assert!(ok);
        scope.cancel();
    }

    #[tokio::test]
    async fn token_handshake_rejects_mismatch() {
        let scope = CancellationToken::new();
        let (opener, acceptor) = session_pair(&scope);

        let server = tokio::spawn(async move {
            let ok = expect_token(&opener, "sahmadiut").await.unwrap();
            (opener, ok)
        });
        let verdict = authenticate(&acceptor, "wrong").await;
        assert!(matches!(verdict, Err(TransportError::AuthRejected)));

        let (_opener, ok) = server.await.unwrap();
        assert!(!ok);
        scope.cancel();
    }

    #[tokio::test]
    async fn cancelled_scope_closes_the_session() {
        let scope = CancellationToken::new();
        let (opener, _acceptor) = session_pair(&scope);
        scope.cancel();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(opener.is_closed());
    }
}
