//! Client side of the control channel.
//!
//! The client dials the control endpoint until it comes up, sleeping the
//! retry interval between attempts, then sits in a listener loop: `1`
//! spawns a tunnel dial, `0` is liveness evidence and is never answered.
//! Anything else, including a garbled first frame, restarts the client.

use crate::{dialer, Client};
use backhaul_proto::{read_frame, write_frame, Signal, AUTH_OK};
use backhaul_transport::{
    FramedSignalReader, SignalReader, TransportError, TransportResult,
};
use backhaul_transport_ws::{TlsClient, WsByteStream, CHANNEL_PATH};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Local dial timeout for the TCP variants.
pub(crate) const TCP_DIAL_TIMEOUT: Duration = Duration::from_secs(3);
/// Local dial timeout for the WebSocket variants.
pub(crate) const WS_DIAL_TIMEOUT: Duration = Duration::from_secs(2);

/// Dials and authenticates the TCP control channel, then listens.
pub(crate) async fn run_tcp(client: Arc<Client>, scope: CancellationToken) {
    loop {
        tokio::select! {
            _ = scope.cancelled() => return,
            attempt = dial_tcp_control(&client) => match attempt {
                Ok(reader) => {
                    info!("control channel established successfully");
                    listen(client, reader, scope, false).await;
                    return;
                }
                Err(e) => {
                    error!("failed to establish control channel: {e}");
                    tokio::time::sleep(client.cfg.retry_interval).await;
                }
            },
        }
    }
}

async fn dial_tcp_control(client: &Arc<Client>) -> TransportResult<Box<dyn SignalReader>> {
    info!(
        "attempting to establish a new control channel connection to {}",
        client.cfg.remote_addr
    );
    let mut stream = dialer::dial_tcp(
        &client.cfg.remote_addr,
        TCP_DIAL_TIMEOUT,
        client.cfg.nodelay,
        client.cfg.keepalive,
    )
    .await?;

    write_frame(&mut stream, client.cfg.token.as_bytes()).await?;
    let reply = read_frame(&mut stream).await?;
    if reply != AUTH_OK {
        return Err(TransportError::AuthRejected);
    }
    Ok(Box::new(FramedSignalReader::new(stream)))
}

/// Dials the WebSocket control channel on `/channel`, then listens.
pub(crate) async fn run_ws(client: Arc<Client>, scope: CancellationToken, tls: Option<Arc<TlsClient>>) {
    loop {
        tokio::select! {
            _ = scope.cancelled() => return,
            attempt = backhaul_transport_ws::dial(
                &client.cfg.remote_addr,
                CHANNEL_PATH,
                &client.cfg.token,
                client.cfg.nodelay,
                client.cfg.keepalive,
                tls.as_deref(),
            ) => match attempt {
                Ok(socket) => {
                    info!("websocket control channel established successfully");
                    let (_writer, reader) = backhaul_transport_ws::split_control(socket);
                    listen(client, Box::new(reader), scope, true).await;
                    return;
                }
                Err(e) => {
                    error!("failed to dial websocket control channel: {e}");
                    tokio::time::sleep(client.cfg.retry_interval).await;
                }
            },
        }
    }
}

/// Signal dispatch loop. Returns only after a fault has been raised or the
/// scope was cancelled.
async fn listen(
    client: Arc<Client>,
    mut reader: Box<dyn SignalReader>,
    scope: CancellationToken,
    websocket: bool,
) {
    loop {
        tokio::select! {
            _ = scope.cancelled() => return,
            received = reader.recv() => match received {
                Ok(Signal::Heartbeat) => debug!("heartbeat received successfully"),
                Ok(Signal::NewStream) => {
                    let client = client.clone();
                    let scope = scope.clone();
                    tokio::spawn(async move {
                        if websocket {
                            open_tunnel_ws(client, scope).await;
                        } else {
                            open_tunnel_tcp(client, scope).await;
                        }
                    });
                }
                Err(e) => {
                    error!("control channel failed: {e}; restarting client");
                    client.trigger_restart();
                    return;
                }
            },
        }
    }
}

/// One tunnel dial per new-stream signal, TCP variant. Dial failures are
/// transient: the public connection on the server side just times out.
async fn open_tunnel_tcp(client: Arc<Client>, scope: CancellationToken) {
    match dialer::dial_tcp(
        &client.cfg.remote_addr,
        TCP_DIAL_TIMEOUT,
        client.cfg.nodelay,
        client.cfg.keepalive,
    )
    .await
    {
        Ok(stream) => {
            dialer::serve_stream(client, Box::new(stream), TCP_DIAL_TIMEOUT, scope).await;
        }
        Err(e) => error!("failed to dial tunnel endpoint: {e}"),
    }
}

/// One tunnel dial per new-stream signal, WebSocket variant.
async fn open_tunnel_ws(client: Arc<Client>, scope: CancellationToken) {
    let tls = client.tls_client();
    match backhaul_transport_ws::dial(
        &client.cfg.remote_addr,
        "",
        &client.cfg.token,
        client.cfg.nodelay,
        client.cfg.keepalive,
        tls.as_deref(),
    )
    .await
    {
        Ok(socket) => {
            let stream = WsByteStream::new(socket);
            dialer::serve_stream(client, Box::new(stream), WS_DIAL_TIMEOUT, scope).await;
        }
        Err(e) => error!("failed to dial websocket tunnel endpoint: {e}"),
    }
}
