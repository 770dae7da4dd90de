//! Tunnel stream sources.
//!
//! The mux variant owns a fixed slot array of live sessions and opens a
//! stream per dispatch; the plain TCP and WebSocket variants keep a queue
//! of idle tunnel connections the client dialed in, asking for more over
//! the control channel as they are consumed.

use async_trait::async_trait;
use backhaul_proto::Signal;
use backhaul_transport::TunnelStream;
use backhaul_transport_mux::MuxSession;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::time::timeout;
use tracing::warn;

/// How long a dispatch waits for the client to deliver a tunnel
/// connection before giving up on that public socket.
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("mux slot {0} is empty or closed")]
    DeadSlot(usize),

    #[error("failed to open stream: {0}")]
    OpenStream(String),

    #[error("control channel unavailable")]
    ChannelGone,

    #[error("timed out waiting for a tunnel connection")]
    Timeout,
}

/// How a dispatch failure should be handled.
#[derive(Debug)]
pub enum SourceFault {
    /// Drop the public connection and keep serving.
    Transient(PoolError),
    /// The backing session is gone; the instance must restart.
    Fatal(PoolError),
}

impl std::fmt::Display for SourceFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceFault::Transient(e) | SourceFault::Fatal(e) => e.fmt(f),
        }
    }
}

/// Source of tunnel streams for the dispatcher.
#[async_trait]
pub trait StreamSource: Send + Sync {
    /// Obtains a fresh tunnel stream for one public connection.
    async fn obtain(&self) -> Result<TunnelStream, SourceFault>;
}

/// Fixed array of live mux sessions, dispatch by uniform random slot.
///
/// A nil or closed slot is not retried against another slot: the peer runs
/// all sessions, so a dead one means the peer is gone and the instance
/// must rebuild.
pub struct MuxSessionPool {
    slots: RwLock<Vec<Option<Arc<MuxSession>>>>,
}

impl MuxSessionPool {
    pub fn new(size: usize) -> Self {
        Self {
            slots: RwLock::new((0..size.max(1)).map(|_| None).collect()),
        }
    }

    pub async fn install(&self, id: usize, session: Arc<MuxSession>) {
        let mut slots = self.slots.write().await;
        if id < slots.len() {
            slots[id] = Some(session);
        }
    }

    /// Live sessions currently installed.
    pub async fn live(&self) -> usize {
        let slots = self.slots.read().await;
        slots
            .iter()
            .filter(|slot| matches!(slot, Some(session) if !session.is_closed()))
            .count()
    }

    /// Picks a uniformly random slot.
    pub async fn pick(&self) -> Result<Arc<MuxSession>, PoolError> {
        let slots = self.slots.read().await;
        let id = rand::thread_rng().gen_range(0..slots.len());
        match &slots[id] {
            Some(session) if !session.is_closed() => Ok(session.clone()),
            _ => Err(PoolError::DeadSlot(id)),
        }
    }
}

#[async_trait]
impl StreamSource for MuxSessionPool {
    async fn obtain(&self) -> Result<TunnelStream, SourceFault> {
        let session = self.pick().await.map_err(SourceFault::Fatal)?;
        let stream = session
            .open_stream()
            .await
            .map_err(|e| SourceFault::Fatal(PoolError::OpenStream(e.to_string())))?;
        Ok(Box::new(stream))
    }
}

/// Idle tunnel connections for the dial-per-stream variants.
pub struct DialPool {
    idle_tx: mpsc::Sender<TunnelStream>,
    idle_rx: Mutex<mpsc::Receiver<TunnelStream>>,
    requests: mpsc::Sender<Signal>,
}

impl DialPool {
    pub fn new(capacity: usize, requests: mpsc::Sender<Signal>) -> Self {
        let (idle_tx, idle_rx) = mpsc::channel(capacity.max(1) * 2);
        Self {
            idle_tx,
            idle_rx: Mutex::new(idle_rx),
            requests,
        }
    }

    /// Called by the tunnel listener when the client delivers a connection.
    pub fn offer(&self, stream: TunnelStream) {
        if self.idle_tx.try_send(stream).is_err() {
            warn!("idle tunnel queue full, discarding connection");
        }
    }

    /// Emits one new-stream request and takes the next idle connection.
    pub async fn acquire(&self, wait: Duration) -> Result<TunnelStream, PoolError> {
        timeout(wait, async {
            self.requests
                .send(Signal::NewStream)
                .await
                .map_err(|_| PoolError::ChannelGone)?;
            let mut idle = self.idle_rx.lock().await;
            idle.recv().await.ok_or(PoolError::ChannelGone)
        })
        .await
        .map_err(|_| PoolError::Timeout)?
    }

    /// Primes the pool at bring-up by requesting the configured watermark.
    pub async fn prefill(&self, count: usize) {
        for _ in 0..count {
            if self.requests.send(Signal::NewStream).await.is_err() {
                return;
            }
        }
    }
}

#[async_trait]
impl StreamSource for DialPool {
    async fn obtain(&self) -> Result<TunnelStream, SourceFault> {
        self.acquire(ACQUIRE_TIMEOUT)
            .await
            .map_err(SourceFault::Transient)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use backhaul_transport_mux::{MuxConfig, Side};
    use tokio_util::sync::CancellationToken;

    fn stub_stream() -> TunnelStream {
        let (near, _far) = tokio::io::duplex(64);
        Box::new(near)
    }

    #[tokio::test]
    async fn dial_pool_hands_out_fifo_and_requests_per_acquire() {
        let (request_tx, mut request_rx) = mpsc::channel(16);
        let pool = DialPool::new(4, request_tx);

        pool.offer(stub_stream());
        pool.offer(stub_stream());

        pool.acquire(Duration::from_secs(1)).await.unwrap();
        pool.acquire(Duration::from_secs(1)).await.unwrap();

        assert_eq!(request_rx.recv().await, Some(Signal::NewStream));
        assert_eq!(request_rx.recv().await, Some(Signal::NewStream));
        assert!(request_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn dial_pool_acquire_times_out_when_nothing_arrives() {
        let (request_tx, _request_rx) = mpsc::channel(16);
        let pool = DialPool::new(4, request_tx);

        let verdict = pool.acquire(Duration::from_millis(20)).await;
        assert!(matches!(verdict, Err(PoolError::Timeout)));
    }

    #[tokio::test]
    async fn dial_pool_prefill_emits_the_watermark() {
        let (request_tx, mut request_rx) = mpsc::channel(16);
        let pool = DialPool::new(8, request_tx);

        pool.prefill(8).await;
        for _ in 0..8 {
            assert_eq!(request_rx.recv().await, Some(Signal::NewStream));
        }
        assert!(request_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn empty_mux_slot_is_fatal() {
        let pool = MuxSessionPool::new(2);
        let fault = pool.obtain().await.unwrap_err();
        assert!(matches!(fault, SourceFault::Fatal(PoolError::DeadSlot(_))));
    }

    #[tokio::test]
    async fn installed_session_serves_streams() {
        let scope = CancellationToken::new();
        let config = MuxConfig {
            version: 1,
            max_frame_size: 32768,
            max_receive_buffer: 4 * 1024 * 1024,
            max_stream_buffer: 65536,
        };
        let (server_io, client_io) = tokio::io::duplex(256 * 1024);
        let opener = Arc::new(MuxSession::spawn(
            server_io,
            Side::Open,
            &config,
            scope.child_token(),
        ));
        let _acceptor = MuxSession::spawn(client_io, Side::Accept, &config, scope.child_token());

        let pool = MuxSessionPool::new(1);
        pool.install(0, opener).await;
        assert_eq!(pool.live().await, 1);
        assert!(pool.obtain().await.is_ok());
        scope.cancel();
    }
}
