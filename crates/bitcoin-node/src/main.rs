//! Bitcoin-style P2P daemon.
//!
//! Maintains a population of outbound peer connections, bootstraps from DNS
//! seeds on first run, and persists the learned peer addresses across
//! restarts.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

mod config;
mod node;

use config::NodeConfig;
use node::Node;

/// Bitcoin-style peer-to-peer network daemon.
#[derive(Parser, Debug)]
#[command(name = "bitcoin-node")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "bitcoin-node.toml")]
    config: PathBuf,

    /// Data directory
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    /// P2P service port
    #[arg(short, long)]
    port: Option<u16>,

    /// Outbound connection target
    #[arg(long)]
    max_outbound: Option<usize>,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("Starting bitcoin-node v{}", env!("CARGO_PKG_VERSION"));

    let config = NodeConfig::load(&args.config, &args)?;
    info!("Data directory: {:?}", config.data_dir);
    info!("P2P port: {}", config.network.port);
    info!("Outbound target: {}", config.network.max_outbound);

    let node = Node::new(&config)?;

    tokio::select! {
        result = node.run() => {
            if let Err(e) = result {
                tracing::error!("Node error: {:#}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
        }
    }

    node.shutdown().await?;
    info!("Node stopped");

    Ok(())
}
