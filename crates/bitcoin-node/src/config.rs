//! Node configuration.

use crate::Args;
use anyhow::{Context, Result};
use bitcoin_network::{DEFAULT_PORT, DNS_SEEDS};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Complete node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Data directory; holds the persisted hosts file.
    pub data_dir: PathBuf,
    /// Network configuration.
    #[serde(default)]
    pub network: NetworkSettings,
}

/// Network configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkSettings {
    /// P2P service port.
    pub port: u16,
    /// Outbound connection target.
    pub max_outbound: usize,
    /// Hosts file name, relative to the data directory.
    pub hosts_file: String,
    /// DNS seed hostnames used when the host directory is empty.
    pub seeds: Vec<String>,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            max_outbound: 8,
            hosts_file: "hosts".to_string(),
            seeds: DNS_SEEDS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(".bitcoin-rust"),
            network: NetworkSettings::default(),
        }
    }
}

impl NodeConfig {
    /// Load configuration from file and CLI args.
    pub fn load(config_path: &Path, args: &Args) -> Result<Self> {
        let mut config = if config_path.exists() {
            let content =
                std::fs::read_to_string(config_path).context("Failed to read config file")?;
            toml::from_str(&content).context("Failed to parse config file")?
        } else {
            Self::default()
        };

        // Override with CLI args, only where explicitly provided.
        if let Some(ref data_dir) = args.data_dir {
            config.data_dir = data_dir.clone();
        }
        if let Some(port) = args.port {
            config.network.port = port;
        }
        if let Some(max_outbound) = args.max_outbound {
            config.network.max_outbound = max_outbound;
        }

        Ok(config)
    }

    /// Absolute path of the persisted hosts file.
    pub fn hosts_path(&self) -> PathBuf {
        self.data_dir.join(&self.network.hosts_file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = NodeConfig::default();
        assert_eq!(config.network.port, 8333);
        assert_eq!(config.network.max_outbound, 8);
        assert_eq!(config.network.seeds.len(), 4);
        assert!(config.hosts_path().ends_with("hosts"));
    }

    #[test]
    fn test_config_roundtrip() {
        let config = NodeConfig::default();
        let serialized = toml::to_string_pretty(&config).unwrap();
        let parsed: NodeConfig = toml::from_str(&serialized).unwrap();
        assert_eq!(parsed.network.port, config.network.port);
        assert_eq!(parsed.network.seeds, config.network.seeds);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let parsed: NodeConfig = toml::from_str("data_dir = \"/tmp/node\"").unwrap();
        assert_eq!(parsed.data_dir, PathBuf::from("/tmp/node"));
        assert_eq!(parsed.network.max_outbound, 8);
    }
}
