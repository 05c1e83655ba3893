//! Reputation collaborator interface and the built-in score book.
//!
//! The connection manager consults a [`ReputationOracle`] before registering a
//! peer, after every disconnect and on every maintenance tick. Implementations
//! may call out to an external service; the manager time-boxes every check and
//! treats a timeout as a rejection.

use crate::connection::DisconnectReason;
use crate::penalties::PenaltyReason;
use crate::scoring::{PeerScore, Standing};
use crate::PeerId;
use async_trait::async_trait;
use dashmap::DashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Outcome of a reputation check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReputationVerdict {
    Admit,
    Reject(String),
    Banned,
}

impl ReputationVerdict {
    pub fn is_admit(&self) -> bool {
        matches!(self, Self::Admit)
    }
}

/// Things the manager tells the collaborator about.
#[derive(Debug, Clone)]
pub enum ReputationEvent {
    /// Peer completed the handshake and was registered.
    Connected { peer: PeerId },
    /// Peer's connection ended.
    Disconnected {
        peer: PeerId,
        reason: DisconnectReason,
    },
    /// Peer misbehaved without necessarily being disconnected.
    Misbehaved {
        peer: PeerId,
        reason: PenaltyReason,
    },
    /// Peer answered a peer-exchange request with usable entries.
    UsefulPeerList { peer: PeerId },
}

/// Scores peer trustworthiness. Consulted, not owned, by the manager.
#[async_trait]
pub trait ReputationOracle: Send + Sync {
    /// Decide whether `peer` at `addr` may be (or stay) connected.
    async fn check(&self, peer: &PeerId, addr: SocketAddr) -> ReputationVerdict;

    /// Observe an event.
    async fn record(&self, _event: ReputationEvent) {}

    /// Fast synchronous ban lookup, used to filter discovery results.
    fn is_banned(&self, _peer: &PeerId) -> bool {
        false
    }
}

/// Admits everyone.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

#[async_trait]
impl ReputationOracle for AllowAll {
    async fn check(&self, _peer: &PeerId, _addr: SocketAddr) -> ReputationVerdict {
        ReputationVerdict::Admit
    }
}

/// In-process reputation: decaying penalties per peer plus timed bans.
pub struct ScoreBook {
    scores: DashMap<PeerId, PeerScore>,
    /// Banned peers (id -> unban time).
    banned: DashMap<PeerId, Instant>,
    ban_duration: Duration,
}

impl Default for ScoreBook {
    fn default() -> Self {
        Self::new(Duration::from_secs(3600))
    }
}

impl ScoreBook {
    pub fn new(ban_duration: Duration) -> Self {
        Self {
            scores: DashMap::new(),
            banned: DashMap::new(),
            ban_duration,
        }
    }

    /// Apply a penalty. Returns `true` if the peer was banned as a result.
    pub fn penalize(&self, peer: &PeerId, reason: PenaltyReason) -> bool {
        let standing = self.scores.entry(peer.clone()).or_default().penalize(reason);
        let should_ban = standing == Standing::Banned;
        debug!(peer = %peer, reason = %reason, ?standing, "Penalized peer");
        if should_ban {
            self.ban(peer);
        }
        should_ban
    }

    pub fn reward(&self, peer: &PeerId, amount: i32) {
        self.scores.entry(peer.clone()).or_default().reward(amount);
    }

    pub fn ban(&self, peer: &PeerId) {
        warn!(peer = %peer, duration = ?self.ban_duration, "Banning peer");
        self.banned.insert(peer.clone(), Instant::now() + self.ban_duration);
    }

    pub fn unban(&self, peer: &PeerId) {
        self.banned.remove(peer);
        if let Some(mut score) = self.scores.get_mut(peer) {
            *score = PeerScore::new();
        }
        info!(peer = %peer, "Unbanned peer");
    }

    /// Current penalty for `peer`, after decay.
    pub fn penalty(&self, peer: &PeerId) -> u32 {
        self.scores.get(peer).map(|s| s.penalty()).unwrap_or(0)
    }

    pub fn banned_count(&self) -> usize {
        self.banned.len()
    }

    fn ban_active(&self, peer: &PeerId) -> bool {
        let active = match self.banned.get(peer) {
            Some(unban_time) => Instant::now() < *unban_time,
            None => return false,
        };
        if !active {
            self.banned.remove(peer);
        }
        active
    }
}

#[async_trait]
impl ReputationOracle for ScoreBook {
    async fn check(&self, peer: &PeerId, _addr: SocketAddr) -> ReputationVerdict {
        if self.ban_active(peer) {
            return ReputationVerdict::Banned;
        }
        match self.scores.get(peer).map(|s| (s.standing(), s.penalty())) {
            Some((Standing::Good, _)) | None => ReputationVerdict::Admit,
            Some((_, penalty)) => ReputationVerdict::Reject(format!("penalty {}", penalty)),
        }
    }

    async fn record(&self, event: ReputationEvent) {
        match event {
            ReputationEvent::Connected { peer } => {
                self.scores.entry(peer).or_default().connected();
            }
            ReputationEvent::Disconnected { peer, reason } => {
                if let Some(penalty) = reason.penalty() {
                    self.penalize(&peer, penalty);
                }
            }
            ReputationEvent::Misbehaved { peer, reason } => {
                self.penalize(&peer, reason);
            }
            ReputationEvent::UsefulPeerList { peer } => {
                self.reward(&peer, crate::penalties::Rewards::USEFUL_PEER_LIST);
            }
        }
    }

    fn is_banned(&self, peer: &PeerId) -> bool {
        self.ban_active(peer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorCategory;

    fn addr() -> SocketAddr {
        "127.0.0.1:26656".parse().unwrap()
    }

    #[tokio::test]
    async fn test_allow_all() {
        let oracle = AllowAll;
        assert!(oracle.check(&PeerId::from("a"), addr()).await.is_admit());
        assert!(!oracle.is_banned(&PeerId::from("a")));
    }

    #[tokio::test]
    async fn test_score_book_rejects_then_bans() {
        let book = ScoreBook::default();
        let peer = PeerId::from("noisy");
        assert!(book.check(&peer, addr()).await.is_admit());

        for _ in 0..3 {
            book.record(ReputationEvent::Misbehaved {
                peer: peer.clone(),
                reason: PenaltyReason::OversizedFrame,
            })
            .await;
        }
        assert!(matches!(book.check(&peer, addr()).await, ReputationVerdict::Reject(_)));
        assert!(!book.is_banned(&peer));

        book.record(ReputationEvent::Disconnected {
            peer: peer.clone(),
            reason: DisconnectReason::Violation {
                penalty: PenaltyReason::HandshakeViolation,
                message: "chain mismatch".into(),
            },
        })
        .await;
        assert_eq!(book.check(&peer, addr()).await, ReputationVerdict::Banned);
        assert!(book.is_banned(&peer));
        assert_eq!(book.banned_count(), 1);
    }

    #[tokio::test]
    async fn test_benign_disconnect_not_penalized() {
        let book = ScoreBook::default();
        let peer = PeerId::from("calm");
        book.record(ReputationEvent::Disconnected {
            peer: peer.clone(),
            reason: DisconnectReason::Error {
                category: ErrorCategory::Transport,
                message: "reset".into(),
            },
        })
        .await;
        assert_eq!(book.penalty(&peer), 0);
    }

    #[tokio::test]
    async fn test_ban_expires() {
        let book = ScoreBook::new(Duration::from_millis(20));
        let peer = PeerId::from("p");
        book.ban(&peer);
        assert!(book.is_banned(&peer));
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(!book.is_banned(&peer));
        assert_eq!(book.banned_count(), 0);
    }

    #[test]
    fn test_unban_resets_score() {
        let book = ScoreBook::default();
        let peer = PeerId::from("p");
        assert!(book.penalize(&peer, PenaltyReason::HandshakeViolation));
        book.unban(&peer);
        assert!(!book.is_banned(&peer));
        assert_eq!(book.penalty(&peer), 0);
    }
}
