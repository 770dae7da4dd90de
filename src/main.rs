//! backhaul, a reverse tunnel relay.
//!
//! One binary, two roles: a publicly reachable server exposing configured
//! ports, and a client next to the origin services dialing out to it. The
//! configuration file decides which role this process plays.

mod config;

use anyhow::{bail, Context, Result};
use clap::Parser;
use config::FileConfig;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Reverse tunnel relay: expose TCP services behind NAT through a public
/// intermediary.
#[derive(Parser, Debug)]
#[command(name = "backhaul")]
#[command(about = "Reverse tunnel relay for NAT'd TCP services")]
#[command(version)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, env = "BACKHAUL_CONFIG")]
    config: PathBuf,

    /// Override the configured log level
    #[arg(long)]
    log_level: Option<String>,
}

fn setup_logging(level: &str) {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let file = FileConfig::load(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;

    let level = cli
        .log_level
        .or_else(|| file.server.as_ref().map(|s| s.log_level()))
        .or_else(|| file.client.as_ref().map(|c| c.log_level()))
        .unwrap_or_else(|| "info".to_string());
    setup_logging(&level);

    let shutdown = CancellationToken::new();
    let on_ctrl_c = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received Ctrl+C, shutting down");
            on_ctrl_c.cancel();
        }
    });

    match (file.server, file.client) {
        (Some(section), None) => {
            let cfg = section.into_config()?;
            backhaul_server::Server::new(cfg).run(shutdown).await?;
        }
        (None, Some(section)) => {
            let cfg = section.into_config()?;
            backhaul_client::Client::new(cfg).run(shutdown).await?;
        }
        (Some(_), Some(_)) => bail!("config must define exactly one of [server] or [client]"),
        (None, None) => bail!("config defines neither [server] nor [client]"),
    }

    info!("backhaul stopped");
    Ok(())
}
