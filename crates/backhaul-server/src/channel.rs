//! Server side of the control channel.
//!
//! Exactly one control connection exists per instance. A single writer
//! task owns the send half: heartbeats on the configured cadence plus any
//! queued new-stream requests from the dispatchers. The reader task is a
//! fault detector: the client never speaks on the channel, so inbound
//! traffic and read errors alike tear the instance down.

use crate::FaultHandler;
use backhaul_proto::{read_frame, write_frame, Signal, AUTH_ERROR, AUTH_OK};
use backhaul_transport::{SignalReader, SignalWriter, TransportResult};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// TCP-variant handshake: the client leads with the token, the server
/// answers `ok` or `error`. `Ok(false)` is a mismatch.
pub async fn authenticate_control<S>(stream: &mut S, token: &str) -> TransportResult<bool>
where
    S: AsyncRead + AsyncWrite + Send + Unpin,
{
    let presented = read_frame(stream).await?;
    if presented == token.as_bytes() {
        write_frame(stream, AUTH_OK).await?;
        Ok(true)
    } else {
        let _ = write_frame(stream, AUTH_ERROR).await;
        Ok(false)
    }
}

/// Spawns the writer/reader pair for an authenticated control connection.
pub fn spawn(
    mut writer: Box<dyn SignalWriter>,
    mut reader: Box<dyn SignalReader>,
    mut requests: mpsc::Receiver<Signal>,
    heartbeat: Duration,
    scope: CancellationToken,
    on_fault: FaultHandler,
) {
    let writer_scope = scope.clone();
    let writer_fault = on_fault.clone();
    tokio::spawn(async move {
        let mut beat = tokio::time::interval(heartbeat);
        beat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = writer_scope.cancelled() => return,
                _ = beat.tick() => {
                    if let Err(e) = writer.send(Signal::Heartbeat).await {
                        error!("control heartbeat failed: {e}");
                        writer_fault();
                        return;
                    }
                }
                request = requests.recv() => match request {
                    Some(signal) => {
                        if let Err(e) = writer.send(signal).await {
                            error!("control send failed: {e}");
                            writer_fault();
                            return;
                        }
                    }
                    None => return,
                },
            }
        }
    });

    tokio::spawn(async move {
        tokio::select! {
            _ = scope.cancelled() => {}
            result = reader.recv() => {
                match result {
                    Ok(signal) => error!("unexpected control message from client: {signal:?}"),
                    Err(e) => error!("control channel read failed: {e}"),
                }
                info!("attempting to restart server");
                on_fault();
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use backhaul_transport::{FramedSignalReader, FramedSignalWriter};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn handshake_accepts_the_shared_token() {
        let (mut server_io, mut client_io) = tokio::io::duplex(256);

        let handshake =
            tokio::spawn(
                async move { authenticate_control(&mut server_io, "sahmadiut").await },
            );

        write_frame(&mut client_io, b"sahmadiut").await.unwrap();
        assert_eq!(read_frame(&mut client_io).await.unwrap(), AUTH_OK);
        assert!(handshake.await.unwrap().unwrap());
    }

    #[tokio::test]
    async fn handshake_rejects_a_bad_token() {
        let (mut server_io, mut client_io) = tokio::io::duplex(256);

        let handshake =
            tokio::spawn(
                async move { authenticate_control(&mut server_io, "sahmadiut").await },
            );

        write_frame(&mut client_io, b"wrong").await.unwrap();
        assert_eq!(read_frame(&mut client_io).await.unwrap(), AUTH_ERROR);
        assert!(!handshake.await.unwrap().unwrap());
    }

    #[tokio::test]
    async fn writer_relays_requests_and_heartbeats() {
        let (server_io, client_io) = tokio::io::duplex(1024);
        let (server_read, server_write) = tokio::io::split(server_io);
        let (client_read, _client_write) = tokio::io::split(client_io);

        let (request_tx, request_rx) = mpsc::channel(8);
        let scope = CancellationToken::new();
        let faults = Arc::new(AtomicUsize::new(0));
        let fault_counter = faults.clone();

        spawn(
            Box::new(FramedSignalWriter::new(server_write)),
            Box::new(FramedSignalReader::new(server_read)),
            request_rx,
            Duration::from_secs(60),
            scope.clone(),
            Arc::new(move || {
                fault_counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        let mut reader = FramedSignalReader::new(client_read);
        // the interval's first tick fires immediately
        assert_eq!(reader.recv().await.unwrap(), Signal::Heartbeat);

        request_tx.send(Signal::NewStream).await.unwrap();
        assert_eq!(reader.recv().await.unwrap(), Signal::NewStream);

        assert_eq!(faults.load(Ordering::SeqCst), 0);
        scope.cancel();
    }

    #[tokio::test]
    async fn client_traffic_on_the_channel_is_a_fault() {
        let (server_io, client_io) = tokio::io::duplex(1024);
        let (server_read, server_write) = tokio::io::split(server_io);
        let (_client_read, mut client_write) = tokio::io::split(client_io);

        let (_request_tx, request_rx) = mpsc::channel(8);
        let scope = CancellationToken::new();
        let (fault_tx, mut fault_rx) = mpsc::channel(4);

        spawn(
            Box::new(FramedSignalWriter::new(server_write)),
            Box::new(FramedSignalReader::new(server_read)),
            request_rx,
            Duration::from_secs(60),
            scope.clone(),
            Arc::new(move || {
                let _ = fault_tx.try_send(());
            }),
        );

        write_frame(&mut client_write, b"0").await.unwrap();
        assert!(fault_rx.recv().await.is_some());
        scope.cancel();
    }
}
