//! What a peer's misbehaviour costs it.
//!
//! Points are accumulated in [`crate::scoring::PeerScore`]. The reject and
//! ban thresholds below decide when a peer is refused or banned.

use crate::NetworkError;

pub struct Penalties;

impl Penalties {
    pub const UNRESPONSIVE: u32 = 10;
    pub const STALLED_FRAME: u32 = 10;
    pub const INVALID_FRAME: u32 = 20;
    pub const INVALID_PEER_LIST: u32 = 20;
    /// A reserved message type sent out of turn.
    pub const UNEXPECTED_MESSAGE: u32 = 30;
    /// Length prefix above the frame limit.
    pub const OVERSIZED_FRAME: u32 = 100;
    /// Wrong protocol version, chain or identity. Enough for a ban on its own.
    pub const HANDSHAKE_VIOLATION: u32 = 500;

    pub const REJECT_THRESHOLD: u32 = 250;
    pub const BAN_THRESHOLD: u32 = 500;
    pub const DECAY_PER_MINUTE: u32 = 10;
    pub const MAX_PENALTY: u32 = 1000;
}

pub struct Rewards;

impl Rewards {
    pub const SUCCESSFUL_CONNECTION: i32 = 5;
    /// A peer-exchange reply that decoded cleanly.
    pub const USEFUL_PEER_LIST: i32 = 1;
    pub const MAX_SCORE: i32 = 100;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PenaltyReason {
    Unresponsive,
    StalledFrame,
    InvalidFrame,
    InvalidPeerList,
    UnexpectedMessage,
    OversizedFrame,
    HandshakeViolation,
}

impl PenaltyReason {
    pub fn penalty(&self) -> u32 {
        match self {
            Self::Unresponsive => Penalties::UNRESPONSIVE,
            Self::StalledFrame => Penalties::STALLED_FRAME,
            Self::InvalidFrame => Penalties::INVALID_FRAME,
            Self::InvalidPeerList => Penalties::INVALID_PEER_LIST,
            Self::UnexpectedMessage => Penalties::UNEXPECTED_MESSAGE,
            Self::OversizedFrame => Penalties::OVERSIZED_FRAME,
            Self::HandshakeViolation => Penalties::HANDSHAKE_VIOLATION,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unresponsive => "unresponsive",
            Self::StalledFrame => "stalled frame",
            Self::InvalidFrame => "invalid frame",
            Self::InvalidPeerList => "invalid peer list",
            Self::UnexpectedMessage => "unexpected message",
            Self::OversizedFrame => "oversized frame",
            Self::HandshakeViolation => "handshake violation",
        }
    }

    /// Whether this alone reaches the ban threshold.
    pub fn is_critical(&self) -> bool {
        self.penalty() >= Penalties::BAN_THRESHOLD
    }

    /// The penalty a remote earns for causing `error`, if any.
    pub fn for_error(error: &NetworkError) -> Option<Self> {
        match error {
            NetworkError::MessageTooLarge { .. } => Some(Self::OversizedFrame),
            NetworkError::InvalidFormat(_) => Some(Self::InvalidFrame),
            NetworkError::ProtocolVersionMismatch { .. }
            | NetworkError::ChainIdMismatch { .. }
            | NetworkError::IdentityMismatch { .. } => Some(Self::HandshakeViolation),
            NetworkError::ReadTimeout => Some(Self::StalledFrame),
            NetworkError::Inactive(_) => Some(Self::Unresponsive),
            _ => None,
        }
    }
}

impl std::fmt::Display for PenaltyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
