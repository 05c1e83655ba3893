//! Dial queue and reconnection backoff.

use crate::{NetworkError, NetworkResult, PeerAddress, PeerId};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

/// Bounded dial queue capacity.
pub const DIAL_QUEUE_CAPACITY: usize = 100;

/// Backoff ceiling.
pub const MAX_BACKOFF: Duration = Duration::from_secs(600);

/// Reconnect delay after `attempts` consecutive failures: `min(2^attempts s, 10 min)`.
pub fn backoff(attempts: u32) -> Duration {
    let secs = 1u64.checked_shl(attempts).unwrap_or(u64::MAX);
    Duration::from_secs(secs).min(MAX_BACKOFF)
}

/// A pending outbound dial.
#[derive(Debug, Clone)]
pub struct DialTask {
    pub address: PeerAddress,
    /// Consecutive failed attempts so far.
    pub attempts: u32,
    pub persistent: bool,
    /// Not to be dialled before this instant.
    pub next_eligible: Instant,
}

impl DialTask {
    /// A task eligible immediately.
    pub fn new(address: PeerAddress, persistent: bool) -> Self {
        Self {
            address,
            attempts: 0,
            persistent,
            next_eligible: Instant::now(),
        }
    }

    /// Redial after a lost connection: attempts start over at the base delay.
    pub fn reconnect(address: PeerAddress, persistent: bool) -> Self {
        Self {
            address,
            attempts: 0,
            persistent,
            next_eligible: Instant::now() + backoff(0),
        }
    }

    /// The follow-up task after this attempt failed.
    pub fn retry(&self) -> Self {
        Self {
            address: self.address.clone(),
            attempts: self.attempts.saturating_add(1),
            persistent: self.persistent,
            next_eligible: Instant::now() + backoff(self.attempts),
        }
    }

    /// The same attempt, deferred by `delay`.
    pub fn retry_after(self, delay: Duration) -> Self {
        Self {
            next_eligible: Instant::now() + delay,
            ..self
        }
    }

    pub fn id(&self) -> &PeerId {
        self.address.id()
    }

    /// Time left until eligible.
    pub fn delay(&self) -> Duration {
        self.next_eligible.saturating_duration_since(Instant::now())
    }
}

/// Bounded, de-duplicating dial queue.
///
/// An identifier is "claimed" from the moment a task is queued or scheduled
/// until the dial finishes, so the same peer is never dialled twice at once.
/// Claims are keyed by [`PeerId::wire_form`].
pub struct DialQueue {
    tx: mpsc::Sender<DialTask>,
    claimed: Mutex<HashSet<PeerId>>,
}

impl DialQueue {
    /// Create the queue and the receiver the dial consumer reads from.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<DialTask>) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            Self {
                tx,
                claimed: Mutex::new(HashSet::new()),
            },
            rx,
        )
    }

    /// Queue a task without blocking.
    ///
    /// A task for an identifier already claimed is ignored. A full queue
    /// drops the task and returns `DialQueueFull`.
    pub fn enqueue(&self, task: DialTask) -> NetworkResult<()> {
        if !self.claim(task.id()) {
            debug!(peer = %task.id(), "Dial already pending");
            return Ok(());
        }
        match self.push_claimed(task) {
            Ok(()) => Ok(()),
            Err((task, e)) => {
                if matches!(e, NetworkError::DialQueueFull) {
                    warn!(peer = %task.id(), "Dial queue full, dropping dial");
                }
                self.release(task.id());
                Err(e)
            }
        }
    }

    /// Queue a task whose identifier the caller already claimed.
    ///
    /// On failure the task comes back so a scheduler can try again later.
    pub fn push_claimed(&self, task: DialTask) -> Result<(), (DialTask, NetworkError)> {
        match self.tx.try_send(task) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(task)) => Err((task, NetworkError::DialQueueFull)),
            Err(TrySendError::Closed(task)) => Err((task, NetworkError::Shutdown)),
        }
    }

    /// Mark `id` as pending. Returns `false` if it already was.
    pub fn claim(&self, id: &PeerId) -> bool {
        self.claimed.lock().insert(id.wire_form())
    }

    /// Clear the pending mark for `id`.
    pub fn release(&self, id: &PeerId) {
        self.claimed.lock().remove(&id.wire_form());
    }

    pub fn is_pending(&self, id: &PeerId) -> bool {
        self.claimed.lock().contains(&id.wire_form())
    }

    /// Number of claimed identifiers (queued, scheduled or dialling).
    pub fn pending(&self) -> usize {
        self.claimed.lock().len()
    }
}
