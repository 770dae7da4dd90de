//! Public-port listeners and the dispatch path.
//!
//! Every expanded mapping entry gets one listener and one bounded accept
//! queue. A dispatcher drains the queue, pairs each socket with a fresh
//! tunnel stream, writes the 2-byte target port header and hands both ends
//! to the relay engine.

use crate::pool::{SourceFault, StreamSource};
use crate::FaultHandler;
use backhaul_proto::{write_port, PortMapping};
use backhaul_transport::{relay, tune_stream, ByteSink, TransportError, TransportResult};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Patience for a full accept queue before the newest connection is
/// dropped.
const ENQUEUE_TIMEOUT: Duration = Duration::from_secs(2);

/// A bound public port and the remote port its traffic is addressed to.
pub struct PortListener {
    pub local_port: u16,
    pub remote_port: u16,
    listener: TcpListener,
}

/// Binds every expanded mapping entry. Any bind failure is fatal.
pub async fn bind_all(mappings: &[PortMapping]) -> TransportResult<Vec<PortListener>> {
    let mut bound = Vec::new();
    for mapping in mappings {
        for (local_port, remote_port) in mapping.expand() {
            let listener = TcpListener::bind(("0.0.0.0", local_port))
                .await
                .map_err(|e| {
                    TransportError::Configuration(format!(
                        "cannot bind public port {local_port}: {e}"
                    ))
                })?;
            info!("listening on public port {local_port} -> remote port {remote_port}");
            bound.push(PortListener {
                local_port,
                remote_port,
                listener,
            });
        }
    }
    Ok(bound)
}

/// Spawns the accept loop and dispatcher for one public port.
#[allow(clippy::too_many_arguments)]
pub fn spawn(
    bound: PortListener,
    channel_size: usize,
    nodelay: bool,
    keepalive: Duration,
    source: Arc<dyn StreamSource>,
    sink: Option<Arc<dyn ByteSink>>,
    scope: CancellationToken,
    on_fault: FaultHandler,
) {
    let PortListener {
        local_port,
        remote_port,
        listener,
    } = bound;
    let (queue_tx, mut queue_rx) = mpsc::channel::<TcpStream>(channel_size.max(1));

    let accept_scope = scope.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = accept_scope.cancelled() => return,
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            error!("accept failed on port {local_port}: {e}");
                            continue;
                        }
                    };
                    tune_stream(&stream, nodelay, keepalive);
                    match timeout(ENQUEUE_TIMEOUT, queue_tx.send(stream)).await {
                        Ok(Ok(())) => debug!("accepted connection from {peer} on port {local_port}"),
                        Ok(Err(_)) => return, // dispatcher gone
                        Err(_) => {
                            warn!("accept queue full on port {local_port}, discarding connection from {peer}");
                        }
                    }
                }
            }
        }
    });

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = scope.cancelled() => return,
                next = queue_rx.recv() => {
                    let Some(public) = next else { return };
                    match source.obtain().await {
                        Ok(mut tunnel) => {
                            // the stream's first frame addresses the remote port
                            if let Err(e) = write_port(&mut tunnel, remote_port).await {
                                warn!("failed to send port {remote_port} over tunnel stream: {e}");
                                continue;
                            }
                            let sink = sink.clone();
                            let relay_scope = scope.clone();
                            tokio::spawn(async move {
                                tokio::select! {
                                    _ = relay_scope.cancelled() => {}
                                    _ = relay::pipe(tunnel, public, local_port, sink) => {}
                                }
                            });
                        }
                        Err(SourceFault::Transient(e)) => {
                            error!("no tunnel stream for port {local_port}: {e}");
                        }
                        Err(SourceFault::Fatal(e)) => {
                            error!("tunnel session unusable: {e}");
                            info!("attempting to restart server");
                            on_fault();
                            return;
                        }
                    }
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::PoolError;
    use async_trait::async_trait;
    use backhaul_transport::TunnelStream;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::sync::Mutex;

    struct QueueSource {
        streams: Mutex<Vec<TunnelStream>>,
    }

    #[async_trait]
    impl StreamSource for QueueSource {
        async fn obtain(&self) -> Result<TunnelStream, SourceFault> {
            self.streams
                .lock()
                .await
                .pop()
                .ok_or(SourceFault::Fatal(PoolError::DeadSlot(0)))
        }
    }

    struct FailingSource;

    #[async_trait]
    impl StreamSource for FailingSource {
        async fn obtain(&self) -> Result<TunnelStream, SourceFault> {
            Err(SourceFault::Fatal(PoolError::DeadSlot(0)))
        }
    }

    async fn bind_one(remote_port: u16) -> (PortListener, u16) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let local_port = listener.local_addr().unwrap().port();
        (
            PortListener {
                local_port,
                remote_port,
                listener,
            },
            local_port,
        )
    }

    #[tokio::test]
    async fn dispatch_prefixes_the_remote_port() {
        let (bound, local_port) = bind_one(22).await;
        let (tunnel_near, tunnel_far) = tokio::io::duplex(4096);
        let source = Arc::new(QueueSource {
            streams: Mutex::new(vec![Box::new(tunnel_near) as TunnelStream]),
        });

        let scope = CancellationToken::new();
        spawn(
            bound,
            8,
            false,
            Duration::from_secs(20),
            source,
            None,
            scope.clone(),
            Arc::new(|| {}),
        );

        let mut public = TcpStream::connect(("127.0.0.1", local_port)).await.unwrap();
        public.write_all(b"payload").await.unwrap();

        let mut tunnel = tunnel_far;
        let mut header = [0u8; 2];
        tunnel.read_exact(&mut header).await.unwrap();
        assert_eq!(header, [0x00, 0x16]);

        let mut body = [0u8; 7];
        tunnel.read_exact(&mut body).await.unwrap();
        assert_eq!(&body, b"payload");

        scope.cancel();
    }

    #[tokio::test]
    async fn dead_source_trips_the_fault_handler_once() {
        let (bound, local_port) = bind_one(80).await;
        let scope = CancellationToken::new();
        let faults = Arc::new(AtomicUsize::new(0));
        let fault_counter = faults.clone();

        spawn(
            bound,
            8,
            false,
            Duration::from_secs(20),
            Arc::new(FailingSource),
            None,
            scope.clone(),
            Arc::new(move || {
                fault_counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        let _first = TcpStream::connect(("127.0.0.1", local_port)).await.unwrap();
        let _second = TcpStream::connect(("127.0.0.1", local_port)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        // the dispatcher exits on the first fatal fault
        assert_eq!(faults.load(Ordering::SeqCst), 1);
        scope.cancel();
    }
}
