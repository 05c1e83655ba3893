//! Peer identity, addresses and discovery records.

use crate::{NetworkError, NetworkResult};
use std::fmt;
use std::time::Instant;

/// Maximum identifier length in bytes.
pub const MAX_PEER_ID_LEN: usize = 128;

/// Identifier bytes carried by the handshake. Longer identifiers are cut.
pub const WIRE_ID_LEN: usize = 32;

/// Maximum host length in bytes.
pub const MAX_HOST_LEN: usize = 64;

/// Unique peer identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(String);

impl PeerId {
    /// Create an identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the identifier.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Raw identifier bytes.
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The identifier a remote learns from our handshake.
    ///
    /// Connections are keyed by this form, so every lookup that starts from
    /// a configured or discovered identifier goes through it first.
    pub fn wire_form(&self) -> PeerId {
        if self.0.len() <= WIRE_ID_LEN {
            return self.clone();
        }
        PeerId(String::from_utf8_lossy(&self.0.as_bytes()[..WIRE_ID_LEN]).into_owned())
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for PeerId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Split `host:port`, accepting bracketed IPv6 hosts.
pub fn parse_host_port(s: &str) -> NetworkResult<(String, u16)> {
    let (host, port) = s
        .rsplit_once(':')
        .ok_or_else(|| NetworkError::InvalidAddress(format!("missing port in '{}'", s)))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    let port: u16 = port
        .parse()
        .map_err(|_| NetworkError::InvalidAddress(format!("bad port in '{}'", s)))?;
    validate_endpoint(host, port)?;
    Ok((host.to_string(), port))
}

fn validate_endpoint(host: &str, port: u16) -> NetworkResult<()> {
    if host.is_empty() {
        return Err(NetworkError::InvalidAddress("empty host".into()));
    }
    if host.len() > MAX_HOST_LEN {
        return Err(NetworkError::InvalidAddress(format!(
            "host of {} bytes exceeds {}",
            host.len(),
            MAX_HOST_LEN
        )));
    }
    if port == 0 {
        return Err(NetworkError::InvalidAddress("port 0".into()));
    }
    Ok(())
}

/// Format a host and port so that `TcpStream::connect` accepts it.
pub fn endpoint(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

/// A dialable peer: identifier plus transport endpoint.
///
/// Construction validates every field, so a `PeerAddress` in hand is always
/// within the wire bounds.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerAddress {
    id: PeerId,
    host: String,
    port: u16,
}

impl PeerAddress {
    /// Create a validated address.
    pub fn new(id: impl Into<PeerId>, host: impl Into<String>, port: u16) -> NetworkResult<Self> {
        let id = id.into();
        let host = host.into();
        if id.is_empty() {
            return Err(NetworkError::InvalidAddress("empty peer id".into()));
        }
        if id.as_bytes().len() > MAX_PEER_ID_LEN {
            return Err(NetworkError::InvalidAddress(format!(
                "peer id of {} bytes exceeds {}",
                id.as_bytes().len(),
                MAX_PEER_ID_LEN
            )));
        }
        validate_endpoint(&host, port)?;
        Ok(Self { id, host, port })
    }

    /// Parse `id@host:port`.
    pub fn parse(s: &str) -> NetworkResult<Self> {
        let (id, rest) = s
            .split_once('@')
            .ok_or_else(|| NetworkError::InvalidAddress(format!("expected id@host:port, got '{}'", s)))?;
        let (host, port) = parse_host_port(rest)?;
        Self::new(id, host, port)
    }

    pub fn id(&self) -> &PeerId {
        &self.id
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// `host:port` string suitable for dialing.
    pub fn endpoint(&self) -> String {
        endpoint(&self.host, self.port)
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.endpoint())
    }
}

/// Where a candidate address came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerSource {
    /// Seed crawl.
    Seed,
    /// Peer exchange with a connected peer.
    PeerExchange,
    /// Configured persistent peer.
    Persistent,
    /// Added by the application.
    Manual,
}

/// A discovered candidate.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    /// Dialable address.
    pub address: PeerAddress,
    /// Discovery source.
    pub source: PeerSource,
    /// When this candidate was last (re)discovered.
    pub last_seen: Instant,
}

impl PeerInfo {
    /// Create a candidate seen now.
    pub fn new(address: PeerAddress, source: PeerSource) -> Self {
        Self {
            address,
            source,
            last_seen: Instant::now(),
        }
    }

    pub fn id(&self) -> &PeerId {
        self.address.id()
    }
}

/// Which side opened the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Inbound,
    Outbound,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Inbound => f.write_str("inbound"),
            Direction::Outbound => f.write_str("outbound"),
        }
    }
}

/// Connection lifecycle state.
///
/// Transitions only move forward: `Connecting → Handshaking → Connected →
/// Disconnecting → Disconnected`, with early exits straight to
/// `Disconnecting`/`Disconnected` on failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ConnectionState {
    Connecting = 0,
    Handshaking = 1,
    Connected = 2,
    Disconnecting = 3,
    Disconnected = 4,
}

impl ConnectionState {
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Connecting,
            1 => Self::Handshaking,
            2 => Self::Connected,
            3 => Self::Disconnecting,
            _ => Self::Disconnected,
        }
    }

    /// Whether no further transitions are possible.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Disconnected)
    }
}
