//! TOML configuration and default application.
//!
//! One file configures one role: a `[server]` or a `[client]` table. Every
//! missing or out-of-range value falls back to a default before the core
//! sees the config; invalid port mappings and missing TLS material are
//! startup-fatal.

use anyhow::{bail, Context, Result};
use backhaul_client::ClientConfig;
use backhaul_proto::parse_mappings;
use backhaul_server::ServerConfig;
use backhaul_transport::Kind;
use backhaul_transport_mux::MuxConfig;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

const DEFAULT_TOKEN: &str = "sahmadiut";
const DEFAULT_CHANNEL_SIZE: i64 = 2048;
const DEFAULT_RETRY_INTERVAL: i64 = 1;
const DEFAULT_CONNECTION_POOL: i64 = 8;
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_MUX_SESSION: i64 = 1;
const DEFAULT_KEEPALIVE: i64 = 20;
const DEFAULT_MUX_VERSION: i64 = 1;
const DEFAULT_MAX_FRAME_SIZE: i64 = 32768;
const DEFAULT_MAX_RECEIVE_BUFFER: i64 = 4_194_304;
const DEFAULT_MAX_STREAM_BUFFER: i64 = 65536;
const DEFAULT_SNIFFER_LOG: &str = "backhaul.json";
const DEFAULT_HEARTBEAT: i64 = 20;

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub server: Option<ServerSection>,
    pub client: Option<ClientSection>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read {}", path.display()))?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self> {
        toml::from_str(text).context("invalid configuration file")
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerSection {
    pub transport: String,
    pub bind_addr: String,
    pub token: String,
    pub channel_size: i64,
    pub connection_pool: i64,
    pub log_level: String,
    pub mux_session: i64,
    pub keepalive: i64,
    pub mux_version: i64,
    pub max_frame_size: i64,
    pub max_receive_buffer: i64,
    pub max_stream_buffer: i64,
    pub sniffer_log: String,
    pub heartbeat: i64,
    pub nodelay: bool,
    pub sniffing: bool,
    pub web_port: u16,
    pub ports: Vec<String>,
    pub tls_cert: String,
    pub tls_key: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClientSection {
    pub transport: String,
    pub remote_addr: String,
    pub token: String,
    pub retry_interval: i64,
    pub log_level: String,
    pub mux_session: i64,
    pub keepalive: i64,
    pub mux_version: i64,
    pub max_frame_size: i64,
    pub max_receive_buffer: i64,
    pub max_stream_buffer: i64,
    pub sniffer_log: String,
    pub nodelay: bool,
    pub sniffing: bool,
    pub web_port: u16,
    pub tls_insecure: bool,
    pub forwarder: HashMap<String, String>,
}

fn transport_or_default(raw: &str, role: &str) -> Kind {
    if raw.is_empty() {
        return Kind::Tcp;
    }
    raw.parse().unwrap_or_else(|_| {
        warn!("invalid transport value {raw:?} for {role}, defaulting to tcp");
        Kind::Tcp
    })
}

fn positive_or(value: i64, fallback: i64) -> i64 {
    if value <= 0 {
        fallback
    } else {
        value
    }
}

fn token_or_default(token: String) -> String {
    if token.is_empty() {
        DEFAULT_TOKEN.to_string()
    } else {
        token
    }
}

fn sniffer_log_or_default(path: String) -> PathBuf {
    if path.is_empty() {
        PathBuf::from(DEFAULT_SNIFFER_LOG)
    } else {
        PathBuf::from(path)
    }
}

fn log_level_or_default(raw: &str) -> String {
    match raw {
        "trace" | "debug" | "info" | "warn" | "error" => raw.to_string(),
        _ => DEFAULT_LOG_LEVEL.to_string(),
    }
}

fn mux_config(version: i64, frame: i64, receive: i64, stream: i64) -> MuxConfig {
    MuxConfig {
        version: if (1..=2).contains(&version) {
            version as u8
        } else {
            DEFAULT_MUX_VERSION as u8
        },
        max_frame_size: positive_or(frame, DEFAULT_MAX_FRAME_SIZE) as u32,
        max_receive_buffer: positive_or(receive, DEFAULT_MAX_RECEIVE_BUFFER) as u32,
        max_stream_buffer: positive_or(stream, DEFAULT_MAX_STREAM_BUFFER) as u32,
    }
}

impl ServerSection {
    pub fn log_level(&self) -> String {
        log_level_or_default(&self.log_level)
    }

    pub fn into_config(self) -> Result<ServerConfig> {
        if self.bind_addr.is_empty() {
            bail!("server bind_addr is required");
        }
        let ports = parse_mappings(&self.ports).context("invalid port mapping")?;
        let transport = transport_or_default(&self.transport, "server");

        let tls_cert = (!self.tls_cert.is_empty()).then(|| PathBuf::from(&self.tls_cert));
        let tls_key = (!self.tls_key.is_empty()).then(|| PathBuf::from(&self.tls_key));
        if matches!(transport, Kind::Wss) && (tls_cert.is_none() || tls_key.is_none()) {
            bail!("wss transport requires tls_cert and tls_key");
        }

        Ok(ServerConfig {
            transport,
            bind_addr: self.bind_addr,
            token: token_or_default(self.token),
            ports,
            channel_size: positive_or(self.channel_size, DEFAULT_CHANNEL_SIZE) as usize,
            connection_pool: positive_or(self.connection_pool, DEFAULT_CONNECTION_POOL) as usize,
            mux_session: positive_or(self.mux_session, DEFAULT_MUX_SESSION) as usize,
            heartbeat: Duration::from_secs(if self.heartbeat < 1 {
                DEFAULT_HEARTBEAT
            } else {
                self.heartbeat
            } as u64),
            keepalive: Duration::from_secs(positive_or(self.keepalive, DEFAULT_KEEPALIVE) as u64),
            nodelay: self.nodelay,
            mux: mux_config(
                self.mux_version,
                self.max_frame_size,
                self.max_receive_buffer,
                self.max_stream_buffer,
            ),
            sniffing: self.sniffing,
            sniffer_log: sniffer_log_or_default(self.sniffer_log),
            web_port: self.web_port,
            tls_cert,
            tls_key,
        })
    }
}

impl ClientSection {
    pub fn log_level(&self) -> String {
        log_level_or_default(&self.log_level)
    }

    pub fn into_config(self) -> Result<ClientConfig> {
        if self.remote_addr.is_empty() {
            bail!("client remote_addr is required");
        }

        let mut forwarder = HashMap::new();
        for (port, target) in self.forwarder {
            let port: u16 = port
                .parse()
                .with_context(|| format!("invalid forwarder port {port:?}"))?;
            forwarder.insert(port, target);
        }

        Ok(ClientConfig {
            transport: transport_or_default(&self.transport, "client"),
            remote_addr: self.remote_addr,
            token: token_or_default(self.token),
            forwarder,
            retry_interval: Duration::from_secs(positive_or(
                self.retry_interval,
                DEFAULT_RETRY_INTERVAL,
            ) as u64),
            keepalive: Duration::from_secs(positive_or(self.keepalive, DEFAULT_KEEPALIVE) as u64),
            nodelay: self.nodelay,
            mux_session: positive_or(self.mux_session, DEFAULT_MUX_SESSION) as usize,
            mux: mux_config(
                self.mux_version,
                self.max_frame_size,
                self.max_receive_buffer,
                self.max_stream_buffer,
            ),
            sniffing: self.sniffing,
            sniffer_log: sniffer_log_or_default(self.sniffer_log),
            web_port: self.web_port,
            tls_insecure: self.tls_insecure,
        })
    }
}
