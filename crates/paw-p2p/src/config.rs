//! Network configuration.

use crate::peer::parse_host_port;
use crate::{NetworkError, NetworkResult, PeerAddress, MAX_MESSAGE_SIZE};
use std::time::Duration;

/// Smallest frame that can carry anything: 4-byte length + 2-byte type length.
const MIN_FRAME_SIZE: usize = 6;

/// P2P network configuration.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Chain identifier exchanged in the handshake.
    pub chain_id: String,
    /// Local node identifier exchanged in the handshake.
    pub node_id: String,
    /// Hard cap on total connections.
    pub max_peers: usize,
    /// Cap on inbound connections.
    pub max_inbound: usize,
    /// Cap on outbound connections.
    pub max_outbound: usize,
    /// Outbound floor the manager actively maintains.
    pub min_outbound: usize,
    /// Transport dial deadline.
    pub dial_timeout: Duration,
    /// Handshake completion deadline.
    pub handshake_timeout: Duration,
    /// Deadline for receiving the rest of a frame once it has started.
    pub read_timeout: Duration,
    /// Per-write deadline.
    pub write_timeout: Duration,
    /// Keep-alive cadence.
    pub ping_interval: Duration,
    /// Dead-peer detection.
    pub inactivity_timeout: Duration,
    /// Hard cap on frame size.
    pub max_message_size: usize,
    /// Seed addresses (`host:port`), used only to discover candidates.
    pub seeds: Vec<String>,
    /// Persistent peers (`id@host:port`), redialled forever.
    pub persistent_peers: Vec<String>,
    /// Reputation sweep and outbound top-up cadence.
    pub maintenance_interval: Duration,
    /// Peer-exchange cadence.
    pub pex_interval: Duration,
    /// Minimum spacing between repeated seed crawls.
    pub seed_crawl_interval: Duration,
    /// Candidate cache cap.
    pub discovery_pool_size: usize,
    /// Entries shared per peer-exchange response.
    pub pex_max_peers: usize,
    /// Capacity of the upward event channel.
    pub event_buffer: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            chain_id: String::new(),
            node_id: String::new(),
            max_peers: 100,
            max_inbound: 50,
            max_outbound: 50,
            min_outbound: 10,
            dial_timeout: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(30),
            write_timeout: Duration::from_secs(5),
            ping_interval: Duration::from_secs(30),
            inactivity_timeout: Duration::from_secs(5 * 60),
            max_message_size: MAX_MESSAGE_SIZE,
            seeds: Vec::new(),
            persistent_peers: Vec::new(),
            maintenance_interval: Duration::from_secs(30),
            pex_interval: Duration::from_secs(30),
            seed_crawl_interval: Duration::from_secs(5 * 60),
            discovery_pool_size: 1000,
            pex_max_peers: 100,
            event_buffer: 1000,
        }
    }
}

impl NetworkConfig {
    /// Create a default configuration for the given chain and node identity.
    pub fn new(chain_id: impl Into<String>, node_id: impl Into<String>) -> Self {
        Self {
            chain_id: chain_id.into(),
            node_id: node_id.into(),
            ..Default::default()
        }
    }

    /// Check the configuration for inconsistent limits and missing identity.
    pub fn validate(&self) -> NetworkResult<()> {
        if self.chain_id.is_empty() {
            return Err(NetworkError::Config("chain id must be set".into()));
        }
        if self.node_id.is_empty() {
            return Err(NetworkError::Config("node id must be set".into()));
        }
        if self.max_peers == 0 {
            return Err(NetworkError::Config("max_peers must be positive".into()));
        }
        if self.max_inbound > self.max_peers {
            return Err(NetworkError::Config(format!(
                "max_inbound ({}) exceeds max_peers ({})",
                self.max_inbound, self.max_peers
            )));
        }
        if self.max_outbound > self.max_peers {
            return Err(NetworkError::Config(format!(
                "max_outbound ({}) exceeds max_peers ({})",
                self.max_outbound, self.max_peers
            )));
        }
        if self.min_outbound > self.max_outbound {
            return Err(NetworkError::Config(format!(
                "min_outbound ({}) exceeds max_outbound ({})",
                self.min_outbound, self.max_outbound
            )));
        }
        if self.max_message_size < MIN_FRAME_SIZE {
            return Err(NetworkError::Config(format!(
                "max_message_size must be at least {} bytes",
                MIN_FRAME_SIZE
            )));
        }

        let timeouts = [
            ("dial_timeout", self.dial_timeout),
            ("handshake_timeout", self.handshake_timeout),
            ("read_timeout", self.read_timeout),
            ("write_timeout", self.write_timeout),
            ("ping_interval", self.ping_interval),
            ("inactivity_timeout", self.inactivity_timeout),
            ("maintenance_interval", self.maintenance_interval),
            ("pex_interval", self.pex_interval),
        ];
        for (name, value) in timeouts {
            if value.is_zero() {
                return Err(NetworkError::Config(format!("{} must be non-zero", name)));
            }
        }

        for seed in &self.seeds {
            parse_host_port(seed).map_err(|e| NetworkError::Config(format!("seed '{}': {}", seed, e)))?;
        }
        for peer in &self.persistent_peers {
            PeerAddress::parse(peer)
                .map_err(|e| NetworkError::Config(format!("persistent peer '{}': {}", peer, e)))?;
        }

        Ok(())
    }
}
