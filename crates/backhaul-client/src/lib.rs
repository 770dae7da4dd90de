//! Tunnel client role.
//!
//! Runs next to the origin services and dials out to the public server:
//! one control channel (or, for TCPMUX, a fixed set of multiplexed
//! sessions), plus one tunnel connection per end-user stream. The restart
//! gate rebuilds everything whenever the control path is lost.

mod channel;
mod dialer;
mod mux;

pub mod config;

pub use config::ClientConfig;

use backhaul_transport::{ByteSink, Kind, Supervisor, TransportResult, UsageMonitor};
use backhaul_transport_ws::TlsClient;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub struct Client {
    pub(crate) cfg: ClientConfig,
    supervisor: Supervisor,
    usage: Option<Arc<UsageMonitor>>,
    tls: Option<Arc<TlsClient>>,
}

impl Client {
    pub fn new(cfg: ClientConfig) -> Arc<Self> {
        let usage = cfg
            .sniffing
            .then(|| UsageMonitor::new(&cfg.sniffer_log));
        let tls = matches!(cfg.transport, Kind::Wss)
            .then(|| Arc::new(TlsClient::new(cfg.tls_insecure)));
        Arc::new(Self {
            cfg,
            supervisor: Supervisor::new(),
            usage,
            tls,
        })
    }

    /// Brings the instance up and serves until `shutdown` fires.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> TransportResult<()> {
        let scope = self.supervisor.scope().await;
        self.bring_up(scope);
        shutdown.cancelled().await;
        self.supervisor.shutdown().await;
        Ok(())
    }

    pub(crate) fn sink(&self) -> Option<Arc<dyn ByteSink>> {
        self.usage
            .clone()
            .map(|monitor| monitor as Arc<dyn ByteSink>)
    }

    pub(crate) fn tls_client(&self) -> Option<Arc<TlsClient>> {
        self.tls.clone()
    }

    /// Requests a supervised restart; concurrent triggers collapse.
    pub(crate) fn trigger_restart(self: &Arc<Self>) {
        let client = self.clone();
        tokio::spawn(async move {
            let rebuild_target = client.clone();
            client
                .supervisor
                .restart(move |fresh| {
                    rebuild_target.bring_up(fresh);
                })
                .await;
        });
    }

    fn bring_up(self: &Arc<Self>, scope: CancellationToken) {
        info!(
            "starting {} client against {}",
            self.cfg.transport, self.cfg.remote_addr
        );
        if let Some(usage) = &self.usage {
            usage.spawn_reporter(scope.clone());
        }
        match self.cfg.transport {
            Kind::Tcp => {
                tokio::spawn(channel::run_tcp(self.clone(), scope));
            }
            Kind::Ws | Kind::Wss => {
                let tls = self.tls_client();
                tokio::spawn(channel::run_ws(self.clone(), scope, tls));
            }
            Kind::TcpMux => {
                mux::spawn_workers(self.clone(), scope);
            }
        }
    }
}
