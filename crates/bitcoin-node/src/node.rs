//! Node wiring: shared services plus the protocol manager.

use crate::config::NodeConfig;
use anyhow::{Context, Result};
use bitcoin_network::{
    Handshake, HandshakeConfig, Hosts, Network, NetworkConfig, Protocol, ProtocolConfig,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Interval between node status log lines.
const STATUS_INTERVAL: Duration = Duration::from_secs(30);

/// The running node.
pub struct Node {
    protocol: Protocol,
}

impl Node {
    /// Wire up the shared services from configuration.
    pub fn new(config: &NodeConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir).context("Failed to create data directory")?;

        let hosts = Arc::new(Hosts::new());
        let handshake = Arc::new(Handshake::new(HandshakeConfig::default()));
        let network = Arc::new(Network::new(NetworkConfig::default(), handshake.clone()));

        let protocol = Protocol::new(
            ProtocolConfig {
                hosts_file: config.hosts_path(),
                max_outbound: config.network.max_outbound,
                port: config.network.port,
                seeds: config.network.seeds.clone(),
            },
            hosts,
            handshake,
            network,
        );

        Ok(Self { protocol })
    }

    /// Start the protocol manager and run until the task is cancelled.
    pub async fn run(&self) -> Result<()> {
        self.protocol
            .start()
            .await
            .context("Failed to start protocol manager")?;
        info!("Node started");

        let mut status = tokio::time::interval(STATUS_INTERVAL);
        status.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            status.tick().await;
            match self.protocol.connection_count().await {
                Ok(connections) => info!(connections, "Node status"),
                Err(e) => warn!(error = %e, "Status query failed"),
            }
        }
    }

    /// Persist the host directory before exit.
    pub async fn shutdown(&self) -> Result<()> {
        self.protocol
            .stop()
            .await
            .context("Failed to save host directory")?;
        info!("Host directory saved");
        Ok(())
    }
}
