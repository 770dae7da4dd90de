//! Mux session workers.
//!
//! The TCPMUX client dials one tunnel connection per configured session at
//! startup, authenticates each on its first stream, then serves whatever
//! streams the server opens. A session that dies after authentication is
//! the liveness signal for this variant: the whole client restarts.

use crate::{channel::TCP_DIAL_TIMEOUT, dialer, Client};
use backhaul_transport_mux::{authenticate, MuxSession, Side};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Spawns one worker per configured session.
pub(crate) fn spawn_workers(client: Arc<Client>, scope: CancellationToken) {
    for id in 0..client.cfg.mux_session {
        let client = client.clone();
        let scope = scope.clone();
        tokio::spawn(worker(client, id, scope));
    }
}

async fn worker(client: Arc<Client>, id: usize, scope: CancellationToken) {
    loop {
        if scope.is_cancelled() {
            return;
        }

        let stream = match dialer::dial_tcp(
            &client.cfg.remote_addr,
            TCP_DIAL_TIMEOUT,
            client.cfg.nodelay,
            client.cfg.keepalive,
        )
        .await
        {
            Ok(stream) => stream,
            Err(e) => {
                error!("failed to dial tunnel endpoint for session {id}: {e}");
                tokio::time::sleep(client.cfg.retry_interval).await;
                continue;
            }
        };

        let session = MuxSession::spawn(stream, Side::Accept, &client.cfg.mux, scope.child_token());
        if let Err(e) = authenticate(&session, &client.cfg.token).await {
            error!("session {id} handshake failed: {e}");
            session.close().await;
            tokio::time::sleep(client.cfg.retry_interval).await;
            continue;
        }
        info!("mux session {id} established successfully");

        loop {
            tokio::select! {
                _ = scope.cancelled() => return,
                accepted = session.accept_stream() => match accepted {
                    Ok(stream) => {
                        let client = client.clone();
                        let scope = scope.clone();
                        tokio::spawn(async move {
                            dialer::serve_stream(
                                client,
                                Box::new(stream),
                                TCP_DIAL_TIMEOUT,
                                scope,
                            )
                            .await;
                        });
                    }
                    Err(_) => break,
                },
            }
        }

        error!("mux session {id} lost; restarting client");
        client.trigger_restart();
        return;
    }
}
