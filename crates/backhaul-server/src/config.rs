//! Immutable server settings.
//!
//! Built by the binary's config loader with defaults already applied and
//! the port mappings already parsed; an instance never reconfigures, a
//! restart rebuilds from the same values.

use backhaul_proto::PortMapping;
use backhaul_transport::Kind;
use backhaul_transport_mux::MuxConfig;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub transport: Kind,
    pub bind_addr: String,
    pub token: String,
    pub ports: Vec<PortMapping>,
    pub channel_size: usize,
    pub connection_pool: usize,
    pub mux_session: usize,
    pub heartbeat: Duration,
    pub keepalive: Duration,
    pub nodelay: bool,
    pub mux: MuxConfig,
    pub sniffing: bool,
    pub sniffer_log: PathBuf,
    /// Dashboard port, recorded for operators; the server itself does not
    /// serve it.
    pub web_port: u16,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
}
