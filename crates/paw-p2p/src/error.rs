//! Network error types.

use thiserror::Error;

/// Broad classes of failure, used by the connection manager to decide
/// between retry, drop and ban.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Malformed or hostile input. Fatal to the connection, never retried on it.
    Protocol,
    /// Socket-level failure or timeout. Recoverable via persistent-peer backoff.
    Transport,
    /// A capacity limit was hit. The request is dropped, the node carries on.
    ResourceLimit,
    /// The reputation collaborator refused the peer.
    Reputation,
    /// Invalid local configuration.
    Config,
}

/// Network errors.
#[derive(Error, Debug)]
pub enum NetworkError {
    /// Frame length exceeds the configured maximum.
    #[error("Message too large: {size} bytes, max {max} bytes")]
    MessageTooLarge { size: usize, max: usize },

    /// Frame is structurally invalid.
    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    /// Remote speaks a different protocol version.
    #[error("Protocol version mismatch: expected {expected}, got {got}")]
    ProtocolVersionMismatch { expected: u8, got: u8 },

    /// Remote belongs to a different chain.
    #[error("Chain ID mismatch: expected {expected}, got {got}")]
    ChainIdMismatch { expected: String, got: String },

    /// Remote announced a node id other than the one we dialed.
    #[error("Peer identity mismatch: expected {expected}, got {got}")]
    IdentityMismatch { expected: String, got: String },

    /// Handshake did not complete in time.
    #[error("Handshake timeout")]
    HandshakeTimeout,

    /// Transport dial did not complete in time.
    #[error("Dial timeout")]
    DialTimeout,

    /// A frame was not fully received in time.
    #[error("Read timeout")]
    ReadTimeout,

    /// A write did not complete in time.
    #[error("Write timeout")]
    WriteTimeout,

    /// No traffic for the inactivity timeout.
    #[error("Peer inactive for {0:?}")]
    Inactive(std::time::Duration),

    /// Remote closed the connection.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Peer table is at capacity.
    #[error("Peer limit reached: {0}")]
    PeerLimitReached(String),

    /// Dial queue is at capacity.
    #[error("Dial queue full")]
    DialQueueFull,

    /// Reputation collaborator rejected the peer.
    #[error("Peer rejected by reputation: {0}")]
    ReputationRejected(String),

    /// Peer is banned.
    #[error("Peer banned: {0}")]
    PeerBanned(String),

    /// Peer is not in the connection table.
    #[error("Peer not connected: {0}")]
    NotConnected(String),

    /// Address failed validation.
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Operation aborted because the node is shutting down.
    #[error("Shutting down")]
    Shutdown,

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl NetworkError {
    /// Classify this error.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::MessageTooLarge { .. }
            | Self::InvalidFormat(_)
            | Self::ProtocolVersionMismatch { .. }
            | Self::ChainIdMismatch { .. }
            | Self::IdentityMismatch { .. } => ErrorCategory::Protocol,
            Self::HandshakeTimeout
            | Self::DialTimeout
            | Self::ReadTimeout
            | Self::WriteTimeout
            | Self::Inactive(_)
            | Self::ConnectionClosed
            | Self::NotConnected(_)
            | Self::Shutdown
            | Self::Io(_) => ErrorCategory::Transport,
            Self::PeerLimitReached(_) | Self::DialQueueFull => ErrorCategory::ResourceLimit,
            Self::ReputationRejected(_) | Self::PeerBanned(_) => ErrorCategory::Reputation,
            Self::InvalidAddress(_) | Self::Config(_) => ErrorCategory::Config,
        }
    }

    /// Whether a persistent peer may be redialled after this error.
    pub fn is_retryable(&self) -> bool {
        self.category() == ErrorCategory::Transport
    }
}

/// Result type for network operations.
pub type NetworkResult<T> = Result<T, NetworkError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categories() {
        assert_eq!(
            NetworkError::MessageTooLarge { size: 11, max: 10 }.category(),
            ErrorCategory::Protocol
        );
        assert_eq!(NetworkError::HandshakeTimeout.category(), ErrorCategory::Transport);
        assert_eq!(NetworkError::DialQueueFull.category(), ErrorCategory::ResourceLimit);
        assert_eq!(
            NetworkError::PeerBanned("x".into()).category(),
            ErrorCategory::Reputation
        );
    }

    #[test]
    fn test_retryable() {
        let io = NetworkError::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset",
        ));
        assert!(io.is_retryable());
        assert!(!NetworkError::InvalidFormat("bad".into()).is_retryable());
        assert!(!NetworkError::ReputationRejected("spam".into()).is_retryable());
    }
}
