//! Immutable client settings, defaults already applied.

use backhaul_transport::Kind;
use backhaul_transport_mux::MuxConfig;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub transport: Kind,
    pub remote_addr: String,
    pub token: String,
    /// Tunneled port to local target address; unmapped ports fall back to
    /// `127.0.0.1:<port>`.
    pub forwarder: HashMap<u16, String>,
    pub retry_interval: Duration,
    pub keepalive: Duration,
    pub nodelay: bool,
    pub mux_session: usize,
    pub mux: MuxConfig,
    pub sniffing: bool,
    pub sniffer_log: PathBuf,
    /// Dashboard port, recorded for operators; the client itself does not
    /// serve it.
    pub web_port: u16,
    /// Skip WSS certificate verification for self-signed servers.
    pub tls_insecure: bool,
}

impl ClientConfig {
    /// Local target for a tunneled port.
    pub fn resolve_target(&self, port: u16) -> String {
        self.forwarder
            .get(&port)
            .cloned()
            .unwrap_or_else(|| format!("127.0.0.1:{port}"))
    }
}
