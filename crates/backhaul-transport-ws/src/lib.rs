//! WebSocket transport.
//!
//! Both roles upgrade plain HTTP: the control channel lives on `/channel`,
//! tunnel data connections on the bare path. The shared token travels as a
//! bearer credential in the upgrade request. WSS wraps the same flow in
//! rustls.

pub mod stream;
pub mod tls;

pub use stream::WsByteStream;
pub use tls::{TlsClient, TlsServer};

use async_trait::async_trait;
use backhaul_proto::Signal;
use backhaul_transport::{
    tune_stream, SignalReader, SignalWriter, TransportError, TransportResult, TunnelStream,
};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{lookup_host, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::http::{header, HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{accept_hdr_async, client_async, WebSocketStream};
use tracing::debug;

/// HTTP upgrade path carrying the control channel; tunnel data uses `/`.
pub const CHANNEL_PATH: &str = "/channel";

/// The whole dial (TCP, TLS, upgrade) must finish within this window.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// A WebSocket over whichever byte stream carried the upgrade.
pub type WsSocket = WebSocketStream<TunnelStream>;

/// Which endpoint an accepted WebSocket asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WsRoute {
    /// `/channel`: the one control channel.
    Channel,
    /// Anything else: a tunnel data connection.
    Data,
}

/// Dials `addr` and upgrades on `path`, presenting the shared token as a
/// bearer credential. Dials IPv4 only, with keepalive and nodelay applied
/// to the underlying socket.
pub async fn dial(
    addr: &str,
    path: &str,
    token: &str,
    nodelay: bool,
    keepalive: Duration,
    tls: Option<&TlsClient>,
) -> TransportResult<WsSocket> {
    timeout(HANDSHAKE_TIMEOUT, async {
        let target = lookup_host(addr)
            .await?
            .find(|candidate| candidate.is_ipv4())
            .ok_or_else(|| {
                TransportError::Configuration(format!("no IPv4 address for {addr}"))
            })?;

        let tcp = TcpStream::connect(target).await?;
        tune_stream(&tcp, nodelay, keepalive);

        let (scheme, io): (&str, TunnelStream) = match tls {
            Some(tls) => {
                let server_name = addr.rsplit_once(':').map(|(host, _)| host).unwrap_or(addr);
                ("wss", Box::new(tls.connect(server_name, tcp).await?))
            }
            None => ("ws", Box::new(tcp)),
        };

        let url = format!("{scheme}://{addr}{path}");
        let mut request = url
            .into_client_request()
            .map_err(|e| TransportError::Configuration(format!("invalid upgrade URL: {e}")))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|e| TransportError::Configuration(format!("invalid token header: {e}")))?;
        request.headers_mut().insert(header::AUTHORIZATION, bearer);

        let (socket, _response) = client_async(request, io)
            .await
            .map_err(|e| TransportError::Protocol(format!("websocket handshake: {e}")))?;
        Ok(socket)
    })
    .await
    .map_err(|_| TransportError::Timeout)?
}

/// Server side of the upgrade: validates the bearer token, answers 401 on
/// mismatch, and reports which endpoint the peer asked for.
pub async fn accept(io: TunnelStream, token: &str) -> TransportResult<(WsSocket, WsRoute)> {
    let expected = format!("Bearer {token}");
    let captured = Arc::new(Mutex::new(WsRoute::Data));
    let captured_in_callback = captured.clone();

    let callback = move |request: &Request, response: Response| {
        let authorized = request
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .map(|value| value == expected)
            .unwrap_or(false);
        if !authorized {
            let rejection = Response::builder()
                .status(StatusCode::UNAUTHORIZED)
                .body(None)
                .unwrap();
            return Err(rejection);
        }

        let path = request.uri().path();
        let route = if path == CHANNEL_PATH || path == "/channel/" {
            WsRoute::Channel
        } else {
            WsRoute::Data
        };
        if let Ok(mut guard) = captured_in_callback.lock() {
            *guard = route;
        }
        Ok(response)
    };

    let socket = timeout(HANDSHAKE_TIMEOUT, accept_hdr_async(io, callback))
        .await
        .map_err(|_| TransportError::Timeout)?
        .map_err(|e| TransportError::Protocol(format!("websocket handshake: {e}")))?;

    let route = captured.lock().map(|guard| *guard).unwrap_or(WsRoute::Data);
    debug!("accepted websocket upgrade for {route:?}");
    Ok((socket, route))
}

/// Splits a control-channel socket into its signal halves. One WS message
/// carries exactly one signal byte.
pub fn split_control(socket: WsSocket) -> (WsSignalWriter, WsSignalReader) {
    let (sink, source) = socket.split();
    (WsSignalWriter { sink }, WsSignalReader { source })
}

pub struct WsSignalWriter {
    sink: SplitSink<WsSocket, Message>,
}

#[async_trait]
impl SignalWriter for WsSignalWriter {
    async fn send(&mut self, signal: Signal) -> TransportResult<()> {
        self.sink
            .send(Message::Binary(vec![signal.as_byte()]))
            .await
            .map_err(|e| TransportError::Protocol(format!("control send: {e}")))
    }
}

pub struct WsSignalReader {
    source: SplitStream<WsSocket>,
}

#[async_trait]
impl SignalReader for WsSignalReader {
    async fn recv(&mut self) -> TransportResult<Signal> {
        loop {
            match self.source.next().await {
                Some(Ok(Message::Binary(data))) => {
                    return Signal::from_message(&data)
                        .map_err(|e| TransportError::Protocol(e.to_string()));
                }
                Some(Ok(Message::Text(text))) => {
                    return Signal::from_message(text.as_bytes())
                        .map_err(|e| TransportError::Protocol(e.to_string()));
                }
                Some(Ok(Message::Close(_))) | None => return Err(TransportError::Closed),
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    return Err(TransportError::Protocol(format!("control read: {e}")))
                }
            }
        }
    }
}
