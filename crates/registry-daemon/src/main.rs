//! Registry daemon
//!
//! Runs a registry server on smol: one task per accepted connection plus
//! the ack retransmitter.

use anyhow::{Context, Result};
use clap::Parser;
use rpc_registry::{RegistryConfig, RegistryServer, ServerConfig};
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "registry-daemon")]
#[command(about = "In-memory RPC service registry", long_about = None)]
struct Args {
    /// Address to listen on (overrides the config file)
    #[arg(short, long)]
    listen: Option<String>,

    /// YAML or JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// How long a push may stay unacknowledged before it is resent
    #[arg(long)]
    ack_timeout_ms: Option<u64>,

    /// How often to scan for unacknowledged pushes
    #[arg(long)]
    retransmit_interval_ms: Option<u64>,
}

impl Args {
    async fn server_config(&self) -> Result<ServerConfig> {
        let mut config = match &self.config {
            Some(path) => RegistryConfig::from_file(path)
                .await
                .with_context(|| format!("Failed to load config {}", path.display()))?
                .server
                .unwrap_or_default(),
            None => ServerConfig::default(),
        };
        if let Some(listen) = &self.listen {
            config.listen_addr = listen.clone();
        }
        if let Some(ms) = self.ack_timeout_ms {
            config.ack_timeout_ms = ms;
        }
        if let Some(ms) = self.retransmit_interval_ms {
            config.retransmit_interval_ms = ms;
        }
        Ok(config)
    }
}

fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    // Run with smol
    smol::block_on(run(args))
}

async fn run(args: Args) -> Result<()> {
    let config = args.server_config().await?;
    info!(
        "Starting registry daemon (ack timeout {} ms, retransmit every {} ms)",
        config.ack_timeout_ms, config.retransmit_interval_ms
    );

    let server = RegistryServer::bind(config).await?;
    smol::spawn(server.run_retransmitter()).detach();

    loop {
        let handler = match server.accept().await {
            Ok(handler) => handler,
            Err(e) => {
                error!("Failed to accept connection: {}", e);
                continue;
            }
        };
        let peer = handler.remote_addr();
        smol::spawn(async move {
            if let Err(e) = handler.handle().await {
                error!("Connection {} ended with error: {}", peer, e);
            }
        })
        .detach();
    }
}
