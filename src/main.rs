//! deskpilot broker server entry point

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use deskpilot::broker::{BrokerConfig, BrokerServer};
use tracing::info;

/// Control server mediating managers and desktop agents
#[derive(Debug, Parser)]
#[command(name = "deskpilot-broker", version, about)]
struct Args {
    /// Path to a TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Listen port (overrides config and DESKPILOT_PORT)
    #[arg(long)]
    port: Option<u16>,

    /// Bind all interfaces instead of localhost
    #[arg(long)]
    public: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("deskpilot=info".parse()?),
        )
        .init();

    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => BrokerConfig::load(path)?,
        None if args.public => BrokerConfig::production(),
        None => BrokerConfig::development(),
    };
    if let Some(port) = args.port {
        config.port = port;
    }
    config.validate()?;

    info!(
        addr = %config.bind_addr(),
        sweep_secs = %config.liveness_sweep,
        dead_secs = %config.dead_timeout,
        "starting deskpilot broker"
    );

    let server = BrokerServer::new(config);
    let shutdown = server.shutdown_token();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("interrupt received, shutting down");
        shutdown.cancel();
    });

    let listener = server.bind().await?;
    server.serve(listener).await?;
    Ok(())
}
