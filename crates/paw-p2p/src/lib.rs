//! # paw-p2p
//!
//! P2P networking layer for the PAW blockchain node.
//!
//! This crate provides:
//! - Length-prefixed message framing
//! - Fixed-size identity handshake
//! - Seed crawling and peer exchange
//! - Connection lifecycle with keep-alive and inactivity detection
//! - Connection management with limits, backoff and reputation hooks

pub mod codec;
pub mod config;
pub mod connection;
pub mod dial;
pub mod discovery;
mod error;
pub mod handshake;
mod manager;
mod peer;
pub mod penalties;
pub mod reputation;
mod scoring;
pub mod table;

pub use codec::{Message, MessageCodec};
pub use config::NetworkConfig;
pub use connection::{Connection, ConnectionConfig, DisconnectReason, PeerSnapshot, StatsSnapshot};
pub use dial::{backoff, DialTask, DIAL_QUEUE_CAPACITY, MAX_BACKOFF};
pub use discovery::{DiscoveryPool, PeerDiscovery, MAX_DISCOVERY_PEERS};
pub use error::{ErrorCategory, NetworkError, NetworkResult};
pub use handshake::{Handshake, HandshakeOutcome, HANDSHAKE_SIZE};
pub use manager::{ConnectionManager, ManagerStats, NetworkEvent};
pub use peer::{
    endpoint, parse_host_port, ConnectionState, Direction, PeerAddress, PeerId, PeerInfo, PeerSource,
    MAX_HOST_LEN, MAX_PEER_ID_LEN,
};
pub use penalties::PenaltyReason;
pub use reputation::{AllowAll, ReputationEvent, ReputationOracle, ReputationVerdict, ScoreBook};
pub use scoring::{PeerScore, Standing};
pub use table::{PeerCounts, PeerLimits, PeerTable};

/// Default P2P port.
pub const DEFAULT_PORT: u16 = 26656;

/// Maximum frame size, length prefix included.
pub const MAX_MESSAGE_SIZE: usize = 10 * 1024 * 1024; // 10 MB

/// Handshake protocol version.
pub const PROTOCOL_VERSION: u8 = 1;
