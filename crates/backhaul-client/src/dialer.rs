//! Tunnel and local dialing.
//!
//! Every tunnel stream opens with a 2-byte big-endian port; the client
//! resolves it through the forwarder table (falling back to loopback),
//! dials the origin service and splices the two ends. A failed local dial
//! closes the tunnel stream silently; the server notices the stream
//! close and the end user sees a dropped connection.

use crate::Client;
use backhaul_proto::read_port;
use backhaul_transport::{relay, tune_stream, TransportResult, TunnelStream};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// Dials a TCP endpoint with the client's socket options applied.
pub(crate) async fn dial_tcp(
    addr: &str,
    wait: Duration,
    nodelay: bool,
    keepalive: Duration,
) -> TransportResult<TcpStream> {
    let stream = timeout(wait, TcpStream::connect(addr))
        .await
        .map_err(|_| backhaul_transport::TransportError::Timeout)??;
    tune_stream(&stream, nodelay, keepalive);
    Ok(stream)
}

/// Serves one tunnel stream: reads the target port, dials the origin and
/// pumps bytes until either side finishes.
pub(crate) async fn serve_stream(
    client: Arc<Client>,
    mut tunnel: TunnelStream,
    dial_timeout: Duration,
    scope: CancellationToken,
) {
    let port = match read_port(&mut tunnel).await {
        Ok(port) => port,
        Err(e) => {
            debug!("tunnel stream carried no port header: {e}");
            return;
        }
    };

    let target = client.cfg.resolve_target(port);
    let local = match dial_tcp(
        &target,
        dial_timeout,
        client.cfg.nodelay,
        client.cfg.keepalive,
    )
    .await
    {
        Ok(stream) => stream,
        Err(e) => {
            // dropping the tunnel stream is the only error report
            error!("connecting to local address {target} is not possible: {e}");
            return;
        }
    };
    debug!("connected to {target} for tunneled port {port}");

    let sink = client.sink();
    tokio::select! {
        _ = scope.cancelled() => {}
        _ = relay::pipe(tunnel, local, port, sink) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ClientConfig;
    use backhaul_proto::write_port;
    use backhaul_transport::Kind;
    use backhaul_transport_mux::MuxConfig;
    use std::collections::HashMap;
    use std::path::PathBuf;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn test_client(forwarder: HashMap<u16, String>) -> Arc<Client> {
        Client::new(ClientConfig {
            transport: Kind::Tcp,
            remote_addr: "127.0.0.1:0".to_string(),
            token: "sahmadiut".to_string(),
            forwarder,
            retry_interval: Duration::from_secs(1),
            keepalive: Duration::from_secs(20),
            nodelay: false,
            mux_session: 1,
            mux: MuxConfig {
                version: 1,
                max_frame_size: 32768,
                max_receive_buffer: 4 * 1024 * 1024,
                max_stream_buffer: 65536,
            },
            sniffing: false,
            sniffer_log: PathBuf::from("backhaul.json"),
            web_port: 0,
            tls_insecure: false,
        })
    }

    #[tokio::test]
    async fn stream_is_spliced_to_the_forwarded_service() {
        // stand-in origin service that echoes one payload back
        let origin = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let origin_addr = origin.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = origin.accept().await.unwrap();
            let mut buf = [0u8; 5];
            socket.read_exact(&mut buf).await.unwrap();
            socket.write_all(b"echo:").await.unwrap();
            socket.write_all(&buf).await.unwrap();
        });

        let client = test_client(HashMap::from([(8080, origin_addr.to_string())]));
        let (tunnel_near, tunnel_far) = tokio::io::duplex(4096);
        let scope = CancellationToken::new();

        let served = tokio::spawn(serve_stream(
            client,
            Box::new(tunnel_near) as TunnelStream,
            Duration::from_secs(2),
            scope.clone(),
        ));

        let mut far = tunnel_far;
        write_port(&mut far, 8080).await.unwrap();
        far.write_all(b"hello").await.unwrap();

        let mut reply = [0u8; 10];
        far.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"echo:hello");

        drop(far);
        served.await.unwrap();
    }

    #[tokio::test]
    async fn failed_local_dial_closes_the_tunnel_stream() {
        // port 1 on loopback is almost certainly closed; the dial fails fast
        let client = test_client(HashMap::from([(9999, "127.0.0.1:1".to_string())]));
        let (tunnel_near, tunnel_far) = tokio::io::duplex(4096);
        let scope = CancellationToken::new();

        let served = tokio::spawn(serve_stream(
            client,
            Box::new(tunnel_near) as TunnelStream,
            Duration::from_millis(500),
            scope,
        ));

        let mut far = tunnel_far;
        write_port(&mut far, 9999).await.unwrap();

        served.await.unwrap();
        // the stream just closes; EOF is all the server side sees
        let mut buf = [0u8; 1];
        assert_eq!(far.read(&mut buf).await.unwrap(), 0);
    }
}
