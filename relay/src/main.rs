use anyhow::{Context, Result};
use clap::Parser;
use std::net::IpAddr;
use std::path::PathBuf;
use tracing::info;

use deskgate_relay::config::{Overrides, RelayConfig};
use deskgate_relay::server::{self, AppState};
use deskgate_shared::logging::{self, LogTarget};
use deskgate_shared::signal;

#[derive(Parser)]
#[command(name = "deskgate-relay")]
#[command(author = "Deskgate Team")]
#[command(version)]
#[command(about = "Origin-checked reachability probe and request relay for the desktop broker", long_about = None)]
struct Cli {
    /// Configuration file (YAML)
    #[arg(short, long, env = "DESKGATE_CONFIG")]
    config: Option<PathBuf>,

    /// Address to listen on
    #[arg(long, env = "DESKGATE_LISTEN")]
    listen: Option<IpAddr>,

    /// Port to listen on
    #[arg(short, long, env = "DESKGATE_PORT")]
    port: Option<u16>,

    /// TLS certificate (PEM)
    #[arg(long, env = "DESKGATE_TLS_CERT")]
    tls_cert: Option<PathBuf>,

    /// TLS private key (PEM)
    #[arg(long, env = "DESKGATE_TLS_KEY")]
    tls_key: Option<PathBuf>,

    /// Trusted peer address or CIDR (repeatable)
    #[arg(short = 't', long = "trusted-peer", env = "DESKGATE_TRUSTED_PEERS", value_delimiter = ',')]
    trusted_peers: Vec<String>,

    /// Accept any upstream certificate
    #[arg(long, env = "DESKGATE_SKIP_VERIFY")]
    skip_verify: bool,

    /// Upstream call timeout in seconds
    #[arg(long, env = "DESKGATE_UPSTREAM_TIMEOUT")]
    upstream_timeout: Option<u64>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init("deskgate_relay", cli.verbose, LogTarget::Stdout);

    let config = match cli.config.clone().or_else(RelayConfig::find_config) {
        Some(path) => {
            info!("Loading configuration from {}", path.display());
            RelayConfig::load(&path)?
        }
        None => RelayConfig::default(),
    };

    let config = config.apply(Overrides {
        listen: cli.listen,
        port: cli.port,
        tls_cert: cli.tls_cert,
        tls_key: cli.tls_key,
        trusted_peers: cli.trusted_peers,
        skip_verify: cli.skip_verify,
        upstream_timeout_secs: cli.upstream_timeout,
    });
    config.validate().context("Invalid relay configuration")?;

    info!(
        "Trusted peers: {} | upstream timeout {}s | certificate checks {}",
        config.trusted_peers.join(", "),
        config.upstream_timeout_secs,
        if config.skip_verify { "off" } else { "on" },
    );

    let state = AppState::from_config(&config)?;
    let app = server::build_router(state);
    server::serve(&config, app, signal::shutdown_signal()).await
}
