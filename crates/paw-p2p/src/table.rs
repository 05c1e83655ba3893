//! Active connection table with admission limits.

use crate::{Direction, NetworkConfig, NetworkError, NetworkResult, PeerId};
use parking_lot::RwLock;
use std::collections::HashMap;

/// Connection caps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerLimits {
    pub max_peers: usize,
    pub max_inbound: usize,
    pub max_outbound: usize,
}

impl From<&NetworkConfig> for PeerLimits {
    fn from(config: &NetworkConfig) -> Self {
        Self {
            max_peers: config.max_peers,
            max_inbound: config.max_inbound,
            max_outbound: config.max_outbound,
        }
    }
}

/// Connection counts by direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PeerCounts {
    pub inbound: usize,
    pub outbound: usize,
}

impl PeerCounts {
    pub fn total(&self) -> usize {
        self.inbound + self.outbound
    }

    fn of(&self, direction: Direction) -> usize {
        match direction {
            Direction::Inbound => self.inbound,
            Direction::Outbound => self.outbound,
        }
    }
}

impl PeerLimits {
    fn cap(&self, direction: Direction) -> usize {
        match direction {
            Direction::Inbound => self.max_inbound,
            Direction::Outbound => self.max_outbound,
        }
    }

    /// Whether one more `direction` connection fits on top of `counts`.
    pub fn admits(&self, counts: PeerCounts, direction: Direction) -> NetworkResult<()> {
        if counts.total() >= self.max_peers {
            return Err(NetworkError::PeerLimitReached(format!(
                "{} peers, max {}",
                counts.total(),
                self.max_peers
            )));
        }
        if counts.of(direction) >= self.cap(direction) {
            return Err(NetworkError::PeerLimitReached(format!(
                "{} {} peers, max {}",
                counts.of(direction),
                direction,
                self.cap(direction)
            )));
        }
        Ok(())
    }
}

struct Entry<C> {
    direction: Direction,
    conn: C,
}

/// Peer table keyed by identifier.
///
/// All mutations happen under one write lock, so the limits hold for any
/// interleaving of inserts and removals. Counts are derived from the entries.
pub struct PeerTable<C> {
    entries: RwLock<HashMap<PeerId, Entry<C>>>,
    limits: PeerLimits,
}

impl<C: Clone> PeerTable<C> {
    pub fn new(limits: PeerLimits) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            limits,
        }
    }

    fn count(entries: &HashMap<PeerId, Entry<C>>, skip: Option<&PeerId>) -> PeerCounts {
        let mut counts = PeerCounts::default();
        for (id, entry) in entries {
            if Some(id) == skip {
                continue;
            }
            match entry.direction {
                Direction::Inbound => counts.inbound += 1,
                Direction::Outbound => counts.outbound += 1,
            }
        }
        counts
    }

    /// Register `conn` under `id`.
    ///
    /// An existing entry with the same identifier is replaced and returned so
    /// the caller can close it; capacity is checked as if it were already gone.
    pub fn insert(&self, id: PeerId, direction: Direction, conn: C) -> NetworkResult<Option<C>> {
        let mut entries = self.entries.write();
        let counts = Self::count(&entries, Some(&id));
        self.limits.admits(counts, direction)?;
        Ok(entries
            .insert(id, Entry { direction, conn })
            .map(|old| old.conn))
    }

    /// Remove the entry for `id` only if `matches` accepts the stored value.
    pub fn remove_if(&self, id: &PeerId, matches: impl FnOnce(&C) -> bool) -> Option<C> {
        let mut entries = self.entries.write();
        if !entries.get(id).map(|e| matches(&e.conn)).unwrap_or(false) {
            return None;
        }
        entries.remove(id).map(|e| e.conn)
    }

    pub fn remove(&self, id: &PeerId) -> Option<C> {
        self.entries.write().remove(id).map(|e| e.conn)
    }

    pub fn get(&self, id: &PeerId) -> Option<C> {
        self.entries.read().get(id).map(|e| e.conn.clone())
    }

    pub fn contains(&self, id: &PeerId) -> bool {
        self.entries.read().contains_key(id)
    }

    pub fn counts(&self) -> PeerCounts {
        Self::count(&self.entries.read(), None)
    }

    /// Cheap pre-check: could a `direction` connection be admitted right now?
    pub fn has_capacity(&self, direction: Direction) -> NetworkResult<()> {
        self.limits.admits(self.counts(), direction)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn values(&self) -> Vec<C> {
        self.entries.read().values().map(|e| e.conn.clone()).collect()
    }
}
