//! Node configuration.

use crate::Args;
use anyhow::{Context, Result};
use paw_p2p::NetworkConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Complete node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Local node identifier announced in the handshake.
    pub node_id: String,
    /// Chain this node belongs to.
    pub chain_id: String,
    /// Serve seed crawls instead of handshaking peers.
    #[serde(default)]
    pub seed_mode: bool,
    /// P2P configuration.
    #[serde(default)]
    pub p2p: P2pConfig,
    /// Reputation configuration.
    #[serde(default)]
    pub reputation: ReputationConfig,
}

/// P2P configuration as written in the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct P2pConfig {
    /// Listen address.
    pub listen_address: String,
    /// Seed addresses (`host:port`).
    pub seeds: Vec<String>,
    /// Persistent peers (`id@host:port`).
    pub persistent_peers: Vec<String>,
    pub max_peers: usize,
    pub max_inbound: usize,
    pub max_outbound: usize,
    pub min_outbound: usize,
    pub dial_timeout_secs: u64,
    pub handshake_timeout_secs: u64,
    pub read_timeout_secs: u64,
    pub write_timeout_secs: u64,
    pub ping_interval_secs: u64,
    pub inactivity_timeout_secs: u64,
    pub maintenance_interval_secs: u64,
    pub pex_interval_secs: u64,
    pub seed_crawl_interval_secs: u64,
    pub max_message_size: usize,
    pub discovery_pool_size: usize,
    pub pex_max_peers: usize,
}

impl Default for P2pConfig {
    fn default() -> Self {
        let defaults = NetworkConfig::default();
        Self {
            listen_address: format!("0.0.0.0:{}", paw_p2p::DEFAULT_PORT),
            seeds: Vec::new(),
            persistent_peers: Vec::new(),
            max_peers: defaults.max_peers,
            max_inbound: defaults.max_inbound,
            max_outbound: defaults.max_outbound,
            min_outbound: defaults.min_outbound,
            dial_timeout_secs: defaults.dial_timeout.as_secs(),
            handshake_timeout_secs: defaults.handshake_timeout.as_secs(),
            read_timeout_secs: defaults.read_timeout.as_secs(),
            write_timeout_secs: defaults.write_timeout.as_secs(),
            ping_interval_secs: defaults.ping_interval.as_secs(),
            inactivity_timeout_secs: defaults.inactivity_timeout.as_secs(),
            maintenance_interval_secs: defaults.maintenance_interval.as_secs(),
            pex_interval_secs: defaults.pex_interval.as_secs(),
            seed_crawl_interval_secs: defaults.seed_crawl_interval.as_secs(),
            max_message_size: defaults.max_message_size,
            discovery_pool_size: defaults.discovery_pool_size,
            pex_max_peers: defaults.pex_max_peers,
        }
    }
}

/// Reputation configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReputationConfig {
    /// How long a ban lasts.
    pub ban_duration_secs: u64,
}

impl Default for ReputationConfig {
    fn default() -> Self {
        Self {
            ban_duration_secs: 3600,
        }
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: "paw-node".to_string(),
            chain_id: "paw-mainnet".to_string(),
            seed_mode: false,
            p2p: P2pConfig::default(),
            reputation: ReputationConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Load configuration from file and CLI args.
    pub fn load(config_path: &Path, args: &Args) -> Result<Self> {
        let mut config = if config_path.exists() {
            let content = std::fs::read_to_string(config_path).context("Failed to read config file")?;
            toml::from_str(&content).context("Failed to parse config file")?
        } else {
            Self::default()
        };

        // Only override if explicitly provided via CLI
        if let Some(ref node_id) = args.node_id {
            config.node_id = node_id.clone();
        }
        if let Some(ref chain_id) = args.chain_id {
            config.chain_id = chain_id.clone();
        }
        if let Some(ref listen) = args.listen {
            config.p2p.listen_address = listen.clone();
        }
        if !args.seeds.is_empty() {
            config.p2p.seeds = args.seeds.clone();
        }
        if !args.persistent_peers.is_empty() {
            config.p2p.persistent_peers = args.persistent_peers.clone();
        }
        if args.seed_mode {
            config.seed_mode = true;
        }

        Ok(config)
    }

    /// Save configuration to file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }

    /// Library configuration, validated.
    pub fn network_config(&self) -> Result<NetworkConfig> {
        let p2p = &self.p2p;
        let secs = Duration::from_secs;
        let config = NetworkConfig {
            chain_id: self.chain_id.clone(),
            node_id: self.node_id.clone(),
            max_peers: p2p.max_peers,
            max_inbound: p2p.max_inbound,
            max_outbound: p2p.max_outbound,
            min_outbound: p2p.min_outbound,
            dial_timeout: secs(p2p.dial_timeout_secs),
            handshake_timeout: secs(p2p.handshake_timeout_secs),
            read_timeout: secs(p2p.read_timeout_secs),
            write_timeout: secs(p2p.write_timeout_secs),
            ping_interval: secs(p2p.ping_interval_secs),
            inactivity_timeout: secs(p2p.inactivity_timeout_secs),
            max_message_size: p2p.max_message_size,
            seeds: p2p.seeds.clone(),
            persistent_peers: p2p.persistent_peers.clone(),
            maintenance_interval: secs(p2p.maintenance_interval_secs),
            pex_interval: secs(p2p.pex_interval_secs),
            seed_crawl_interval: secs(p2p.seed_crawl_interval_secs),
            discovery_pool_size: p2p.discovery_pool_size,
            pex_max_peers: p2p.pex_max_peers,
            ..NetworkConfig::default()
        };
        config.validate().context("Invalid network configuration")?;
        Ok(config)
    }

    pub fn ban_duration(&self) -> Duration {
        Duration::from_secs(self.reputation.ban_duration_secs)
    }
}
