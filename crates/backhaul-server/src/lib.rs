//! Tunnel server role.
//!
//! Listens for the client's outbound tunnel connections on the bind
//! address and exposes the configured public ports. All four transport
//! variants share the same skeleton: bring up a tunnel intake, a stream
//! source and the public listeners, then let the restart gate rebuild the
//! whole graph on any session-fatal fault.

pub mod channel;
pub mod config;
pub mod listener;
pub mod pool;

pub use config::ServerConfig;

use backhaul_transport::{
    normalize_bind_addr, tune_stream, ByteSink, FramedSignalReader, FramedSignalWriter, Kind,
    Supervisor, TransportError, TransportResult, TunnelStream, UsageMonitor,
};
use backhaul_transport_mux::{expect_token, MuxSession, Side};
use backhaul_transport_ws::{TlsServer, WsByteStream, WsRoute, WsSocket};
use pool::{DialPool, MuxSessionPool};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Invoked by any task that hits a session-fatal fault.
pub type FaultHandler = Arc<dyn Fn() + Send + Sync>;

/// Rate limit after a failed token handshake on the tunnel listener.
const AUTH_FAILURE_DELAY: Duration = Duration::from_secs(2);
/// A peer that stalls mid-handshake is cut off after this long.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Server {
    cfg: ServerConfig,
    supervisor: Supervisor,
    usage: Option<Arc<UsageMonitor>>,
}

impl Server {
    pub fn new(cfg: ServerConfig) -> Arc<Self> {
        let usage = cfg
            .sniffing
            .then(|| UsageMonitor::new(&cfg.sniffer_log));
        Arc::new(Self {
            cfg,
            supervisor: Supervisor::new(),
            usage,
        })
    }

    /// Brings the instance up and serves until `shutdown` fires.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> TransportResult<()> {
        let scope = self.supervisor.scope().await;
        self.bring_up(scope).await?;
        shutdown.cancelled().await;
        self.supervisor.shutdown().await;
        Ok(())
    }

    fn sink(&self) -> Option<Arc<dyn ByteSink>> {
        self.usage
            .clone()
            .map(|monitor| monitor as Arc<dyn ByteSink>)
    }

    fn fault_handler(self: &Arc<Self>) -> FaultHandler {
        let server = self.clone();
        Arc::new(move || server.trigger_restart())
    }

    /// Requests a supervised restart; concurrent triggers collapse.
    fn trigger_restart(self: &Arc<Self>) {
        let server = self.clone();
        tokio::spawn(async move {
            let rebuild_target = server.clone();
            server
                .supervisor
                .restart(move |fresh| {
                    tokio::spawn(async move {
                        if let Err(e) = rebuild_target.bring_up(fresh).await {
                            // a bind that fails on rebuild will fail forever
                            error!("fatal error while rebuilding server: {e}");
                            std::process::exit(1);
                        }
                    });
                })
                .await;
        });
    }

    async fn bring_up(self: &Arc<Self>, scope: CancellationToken) -> TransportResult<()> {
        info!(
            "starting {} server on {}",
            self.cfg.transport, self.cfg.bind_addr
        );
        if let Some(usage) = &self.usage {
            usage.spawn_reporter(scope.clone());
        }
        match self.cfg.transport {
            Kind::Tcp => self.bring_up_tcp(scope).await,
            Kind::TcpMux => self.bring_up_mux(scope).await,
            Kind::Ws | Kind::Wss => self.bring_up_ws(scope).await,
        }
    }

    async fn bind_tunnel(&self) -> TransportResult<TcpListener> {
        let bind = normalize_bind_addr(&self.cfg.bind_addr);
        let listener = TcpListener::bind(&bind).await.map_err(|e| {
            TransportError::Configuration(format!("failed to bind tunnel listener on {bind}: {e}"))
        })?;
        info!("tunnel listener started on {bind}");
        Ok(listener)
    }

    /// Plain TCP: the first authenticated connection becomes the control
    /// channel; every later one is an idle tunnel connection for the pool.
    async fn bring_up_tcp(self: &Arc<Self>, scope: CancellationToken) -> TransportResult<()> {
        let tunnel = self.bind_tunnel().await?;
        let public = listener::bind_all(&self.cfg.ports).await?;

        let (request_tx, request_rx) = mpsc::channel(64);
        let pool = Arc::new(DialPool::new(self.cfg.connection_pool, request_tx));

        let server = self.clone();
        tokio::spawn(async move {
            let mut pending_control = Some((request_rx, public));
            loop {
                tokio::select! {
                    _ = scope.cancelled() => return,
                    accepted = tunnel.accept() => {
                        let (mut stream, peer) = match accepted {
                            Ok(pair) => pair,
                            Err(e) => {
                                error!("tunnel accept failed: {e}");
                                continue;
                            }
                        };
                        tune_stream(&stream, server.cfg.nodelay, server.cfg.keepalive);

                        let Some((request_rx, public)) = pending_control.take() else {
                            pool.offer(Box::new(stream));
                            continue;
                        };

                        match timeout(
                            HANDSHAKE_TIMEOUT,
                            channel::authenticate_control(&mut stream, &server.cfg.token),
                        )
                        .await
                        {
                            Ok(Ok(true)) => {
                                info!("control channel established with {peer}");
                                let (read_half, write_half) = stream.into_split();
                                channel::spawn(
                                    Box::new(FramedSignalWriter::new(write_half)),
                                    Box::new(FramedSignalReader::new(read_half)),
                                    request_rx,
                                    server.cfg.heartbeat,
                                    scope.clone(),
                                    server.fault_handler(),
                                );
                                pool.prefill(server.cfg.connection_pool).await;
                                server.open_public_side(public, pool.clone(), scope.clone());
                            }
                            Ok(Ok(false)) => {
                                warn!("rejected control connection from {peer}: token mismatch");
                                pending_control = Some((request_rx, public));
                                tokio::time::sleep(AUTH_FAILURE_DELAY).await;
                            }
                            Ok(Err(e)) => {
                                warn!("control handshake with {peer} failed: {e}");
                                pending_control = Some((request_rx, public));
                            }
                            Err(_) => {
                                warn!("control handshake with {peer} timed out");
                                pending_control = Some((request_rx, public));
                            }
                        }
                    }
                }
            }
        });
        Ok(())
    }

    /// TCP with multiplexing: accept exactly `mux_session` tunnel sockets,
    /// authenticate each on its first stream and fill the slot pool before
    /// the public side opens. No control channel exists; the mux keepalive
    /// is the liveness mechanism.
    async fn bring_up_mux(self: &Arc<Self>, scope: CancellationToken) -> TransportResult<()> {
        let tunnel = self.bind_tunnel().await?;
        let public = listener::bind_all(&self.cfg.ports).await?;
        let pool = Arc::new(MuxSessionPool::new(self.cfg.mux_session));

        let server = self.clone();
        tokio::spawn(async move {
            for id in 0..server.cfg.mux_session {
                loop {
                    tokio::select! {
                        _ = scope.cancelled() => return,
                        accepted = tunnel.accept() => {
                            let (stream, peer) = match accepted {
                                Ok(pair) => pair,
                                Err(e) => {
                                    debug!("tunnel accept failed: {e}");
                                    continue;
                                }
                            };
                            tune_stream(&stream, server.cfg.nodelay, server.cfg.keepalive);
                            let session = Arc::new(MuxSession::spawn(
                                stream,
                                Side::Open,
                                &server.cfg.mux,
                                scope.child_token(),
                            ));
                            match timeout(
                                HANDSHAKE_TIMEOUT,
                                expect_token(&session, &server.cfg.token),
                            )
                            .await
                            {
                                Ok(Ok(true)) => {
                                    info!("mux session {id} established with {peer}");
                                    pool.install(id, session).await;
                                    break;
                                }
                                Ok(Ok(false)) => {
                                    error!("token mismatch on session from {peer}");
                                    session.close().await;
                                    tokio::time::sleep(AUTH_FAILURE_DELAY).await;
                                }
                                Ok(Err(e)) => {
                                    error!("session handshake with {peer} failed: {e}");
                                    session.close().await;
                                }
                                Err(_) => {
                                    warn!("session handshake with {peer} timed out");
                                    session.close().await;
                                }
                            }
                        }
                    }
                }
            }
            info!(
                "all {} tunnel sessions established",
                server.cfg.mux_session
            );
            server.open_public_side(public, pool, scope.clone());

            // hold the tunnel listener open for the life of this generation
            scope.cancelled().await;
        });
        Ok(())
    }

    /// WebSocket variants: one listener accepts both the `/channel`
    /// control connection and the tunnel data connections; routing happens
    /// in the upgrade handshake.
    async fn bring_up_ws(self: &Arc<Self>, scope: CancellationToken) -> TransportResult<()> {
        let tls = match self.cfg.transport {
            Kind::Wss => {
                let cert = self.cfg.tls_cert.as_deref().ok_or_else(|| {
                    TransportError::Configuration("wss requires tls_cert".to_string())
                })?;
                let key = self.cfg.tls_key.as_deref().ok_or_else(|| {
                    TransportError::Configuration("wss requires tls_key".to_string())
                })?;
                Some(Arc::new(TlsServer::from_pem_files(cert, key)?))
            }
            _ => None,
        };

        let tunnel = self.bind_tunnel().await?;
        let public = listener::bind_all(&self.cfg.ports).await?;

        let (request_tx, request_rx) = mpsc::channel(64);
        let pool = Arc::new(DialPool::new(self.cfg.connection_pool, request_tx));
        let (control_tx, mut control_rx) = mpsc::channel::<WsSocket>(1);

        // the first control channel opens the public side
        let server = self.clone();
        let coordinator_scope = scope.clone();
        let coordinator_pool = pool.clone();
        tokio::spawn(async move {
            let mut pending = Some((request_rx, public));
            loop {
                tokio::select! {
                    _ = coordinator_scope.cancelled() => return,
                    socket = control_rx.recv() => {
                        let Some(socket) = socket else { return };
                        let Some((request_rx, public)) = pending.take() else {
                            warn!("duplicate control channel connection, dropping");
                            continue;
                        };
                        info!("websocket control channel established");
                        let (writer, reader) = backhaul_transport_ws::split_control(socket);
                        channel::spawn(
                            Box::new(writer),
                            Box::new(reader),
                            request_rx,
                            server.cfg.heartbeat,
                            coordinator_scope.clone(),
                            server.fault_handler(),
                        );
                        server.open_public_side(
                            public,
                            coordinator_pool.clone(),
                            coordinator_scope.clone(),
                        );
                    }
                }
            }
        });

        let server = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = scope.cancelled() => return,
                    accepted = tunnel.accept() => {
                        let (stream, peer) = match accepted {
                            Ok(pair) => pair,
                            Err(e) => {
                                error!("tunnel accept failed: {e}");
                                continue;
                            }
                        };
                        tune_stream(&stream, server.cfg.nodelay, server.cfg.keepalive);

                        // handshakes run off the accept loop
                        let server = server.clone();
                        let tls = tls.clone();
                        let pool = pool.clone();
                        let control_tx = control_tx.clone();
                        tokio::spawn(async move {
                            let io: TunnelStream = match &tls {
                                Some(tls) => match tls.accept(stream).await {
                                    Ok(secured) => Box::new(secured),
                                    Err(e) => {
                                        warn!("TLS handshake with {peer} failed: {e}");
                                        return;
                                    }
                                },
                                None => Box::new(stream),
                            };
                            match backhaul_transport_ws::accept(io, &server.cfg.token).await {
                                Ok((socket, WsRoute::Channel)) => {
                                    let _ = control_tx.send(socket).await;
                                }
                                Ok((socket, WsRoute::Data)) => {
                                    pool.offer(Box::new(WsByteStream::new(socket)));
                                }
                                Err(e) => {
                                    debug!("websocket handshake with {peer} failed: {e}");
                                }
                            }
                        });
                    }
                }
            }
        });
        Ok(())
    }

    fn open_public_side(
        self: &Arc<Self>,
        public: Vec<listener::PortListener>,
        source: Arc<dyn pool::StreamSource>,
        scope: CancellationToken,
    ) {
        let fault = self.fault_handler();
        for bound in public {
            listener::spawn(
                bound,
                self.cfg.channel_size,
                self.cfg.nodelay,
                self.cfg.keepalive,
                source.clone(),
                self.sink(),
                scope.clone(),
                fault.clone(),
            );
        }
    }
}
