//! Transport abstraction for the backhaul tunnel core.
//!
//! The four transport variants (TCP, TCP+mux, WS, WSS) share this layer:
//! the error taxonomy, the type-erased tunnel byte stream, the control
//! signal reader/writer seam, the restart gate and the relay engine.

pub mod relay;
pub mod supervisor;
pub mod usage;

use async_trait::async_trait;
use backhaul_proto::{read_frame, write_frame, FrameError, Signal};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::{trace, warn};

pub use supervisor::{Supervisor, RESTART_GRACE};
pub use usage::{ByteSink, Direction, UsageMonitor};

/// Transport-level errors.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("connection closed")]
    Closed,

    #[error("protocol fault: {0}")]
    Protocol(String),

    #[error("authentication rejected by peer")]
    AuthRejected,

    #[error("timed out")]
    Timeout,

    #[error("configuration error: {0}")]
    Configuration(String),
}

pub type TransportResult<T> = Result<T, TransportError>;

/// Byte stream carrying exactly one end user's tunneled connection.
pub trait TunnelIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> TunnelIo for T {}

/// Owned, type-erased tunnel stream.
pub type TunnelStream = Box<dyn TunnelIo>;

/// The transport variant an instance runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Tcp,
    TcpMux,
    Ws,
    Wss,
}

impl Kind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Kind::Tcp => "tcp",
            Kind::TcpMux => "tcpmux",
            Kind::Ws => "ws",
            Kind::Wss => "wss",
        }
    }
}

impl FromStr for Kind {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(Kind::Tcp),
            "tcpmux" => Ok(Kind::TcpMux),
            "ws" => Ok(Kind::Ws),
            "wss" => Ok(Kind::Wss),
            other => Err(TransportError::Configuration(format!(
                "unknown transport {other:?}"
            ))),
        }
    }
}

impl std::fmt::Display for Kind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Receiving half of a control channel.
#[async_trait]
pub trait SignalReader: Send {
    async fn recv(&mut self) -> TransportResult<Signal>;
}

/// Sending half of a control channel.
#[async_trait]
pub trait SignalWriter: Send {
    async fn send(&mut self, signal: Signal) -> TransportResult<()>;
}

/// TCP-variant control framing: each signal is a length-prefixed string.
pub struct FramedSignalReader<R> {
    inner: R,
}

impl<R> FramedSignalReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<R: AsyncRead + Send + Unpin> SignalReader for FramedSignalReader<R> {
    async fn recv(&mut self) -> TransportResult<Signal> {
        let message = read_frame(&mut self.inner).await?;
        Signal::from_message(&message).map_err(|e| TransportError::Protocol(e.to_string()))
    }
}

pub struct FramedSignalWriter<W> {
    inner: W,
}

impl<W> FramedSignalWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<W: AsyncWrite + Send + Unpin> SignalWriter for FramedSignalWriter<W> {
    async fn send(&mut self, signal: Signal) -> TransportResult<()> {
        write_frame(&mut self.inner, &[signal.as_byte()]).await?;
        Ok(())
    }
}

/// Accepts Go-style listen addresses: ":3080" binds every interface.
pub fn normalize_bind_addr(addr: &str) -> String {
    if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    }
}

/// Applies the configured socket options to an accepted or dialed TCP
/// connection. Failures are logged and otherwise ignored; a socket that
/// rejects tuning still carries traffic.
pub fn tune_stream(stream: &TcpStream, nodelay: bool, keepalive: Duration) {
    if nodelay {
        if let Err(e) = stream.set_nodelay(true) {
            warn!("failed to set TCP_NODELAY: {e}");
        } else {
            trace!("TCP_NODELAY enabled");
        }
    }
    let sock = socket2::SockRef::from(stream);
    let params = socket2::TcpKeepalive::new().with_time(keepalive);
    if let Err(e) = sock.set_tcp_keepalive(&params) {
        warn!("failed to set TCP keepalive: {e}");
    }
}
