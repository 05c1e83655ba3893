//! Per-peer misbehaviour score.
//!
//! Penalty points decay by [`Penalties::DECAY_PER_MINUTE`] for every whole
//! minute without a new violation. A peer's [`Standing`] is derived from the
//! decayed total.

use crate::penalties::{Penalties, PenaltyReason, Rewards};
use std::time::{Duration, Instant};

/// Where a peer stands after decay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Standing {
    Good,
    /// New connections are refused.
    Rejected,
    /// Over the ban threshold.
    Banned,
}

#[derive(Debug, Clone)]
pub struct PeerScore {
    /// Points as of `updated`, before decay.
    points: u32,
    updated: Instant,
    rewards: i32,
    violations: u32,
    last_violation: Option<PenaltyReason>,
    connections: u64,
    last_good: Instant,
}

impl Default for PeerScore {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerScore {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            points: 0,
            updated: now,
            rewards: 0,
            violations: 0,
            last_violation: None,
            connections: 0,
            last_good: now,
        }
    }

    fn decayed_at(&self, now: Instant) -> u32 {
        let minutes = now.saturating_duration_since(self.updated).as_secs() / 60;
        let decay = u32::try_from(minutes)
            .unwrap_or(u32::MAX)
            .saturating_mul(Penalties::DECAY_PER_MINUTE);
        self.points.saturating_sub(decay)
    }

    /// Penalty points after decay.
    pub fn penalty(&self) -> u32 {
        self.decayed_at(Instant::now())
    }

    pub fn standing(&self) -> Standing {
        match self.penalty() {
            p if p >= Penalties::BAN_THRESHOLD => Standing::Banned,
            p if p >= Penalties::REJECT_THRESHOLD => Standing::Rejected,
            _ => Standing::Good,
        }
    }

    /// Record a violation and return the resulting standing.
    pub fn penalize(&mut self, reason: PenaltyReason) -> Standing {
        self.violations += 1;
        self.last_violation = Some(reason);
        self.add_points(reason.penalty())
    }

    /// Add raw points, capped at [`Penalties::MAX_PENALTY`].
    pub fn add_points(&mut self, points: u32) -> Standing {
        let now = Instant::now();
        self.points = self
            .decayed_at(now)
            .saturating_add(points)
            .min(Penalties::MAX_PENALTY);
        self.updated = now;
        self.standing()
    }

    pub fn reward(&mut self, amount: i32) {
        self.rewards = self.rewards.saturating_add(amount).min(Rewards::MAX_SCORE);
        self.last_good = Instant::now();
    }

    /// A handshake completed and the peer was registered.
    pub fn connected(&mut self) {
        self.connections += 1;
        self.reward(Rewards::SUCCESSFUL_CONNECTION);
    }

    pub fn rewards(&self) -> i32 {
        self.rewards
    }

    pub fn violations(&self) -> u32 {
        self.violations
    }

    pub fn last_violation(&self) -> Option<PenaltyReason> {
        self.last_violation
    }

    pub fn connections(&self) -> u64 {
        self.connections
    }

    pub fn since_good(&self) -> Duration {
        self.last_good.elapsed()
    }
}
