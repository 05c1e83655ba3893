//! Connection manager.
//!
//! Owns the peer table and drives everything around it:
//! - a dial consumer that turns queued [`DialTask`]s into outbound connections
//! - inbound admission through [`ConnectionManager::accept_inbound`]
//! - an inbound router that answers peer exchange and delivers the rest upward
//! - a maintenance loop (reputation sweep and outbound top-up)
//! - a discovery loop (seed crawl and periodic peer exchange)
//! - persistent-peer redial with exponential backoff
//!
//! The application talks to the manager through the methods on
//! [`ConnectionManager`] and receives [`NetworkEvent`]s from a bounded channel.

use crate::codec::{Message, MSG_PEX_REQUEST, MSG_PEX_RESPONSE};
use crate::connection::{self, Connection, ConnectionConfig, DisconnectReason, InboundMessage, PeerSnapshot};
use crate::dial::{DialQueue, DialTask, DIAL_QUEUE_CAPACITY};
use crate::discovery::{self, encode_peer_list, DiscoveryPool, PeerDiscovery, DISCOVERY_REQUEST};
use crate::handshake::{self, Handshake};
use crate::penalties::PenaltyReason;
use crate::reputation::{ReputationEvent, ReputationOracle, ReputationVerdict};
use crate::table::{PeerCounts, PeerLimits, PeerTable};
use crate::{Direction, NetworkConfig, NetworkError, NetworkResult, PeerAddress, PeerId, PeerInfo, PeerSource};
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn};

/// Delay before retrying a scheduled dial that found the queue full.
const QUEUE_FULL_RETRY: Duration = Duration::from_secs(1);

/// Capacity of the channel from connection read loops to the router.
const INBOUND_BUFFER: usize = 1000;

/// Events emitted to the application.
#[derive(Debug, Clone)]
pub enum NetworkEvent {
    /// A peer completed the handshake and was registered.
    PeerConnected {
        peer_id: PeerId,
        addr: SocketAddr,
        direction: Direction,
    },
    /// A registered peer's connection ended.
    PeerDisconnected {
        peer_id: PeerId,
        reason: DisconnectReason,
    },
    /// Application message from a peer. Per-peer order is preserved.
    MessageReceived { peer_id: PeerId, message: Message },
    /// An outbound dial failed.
    DialFailed {
        address: PeerAddress,
        error: String,
        attempts: u32,
    },
}

#[derive(Debug, Default)]
struct Counters {
    connections: AtomicU64,
    disconnections: AtomicU64,
    dial_successes: AtomicU64,
    dial_failures: AtomicU64,
    inbound_rejected: AtomicU64,
    handshake_failures: AtomicU64,
    reputation_disconnects: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Manager counters and gauges.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ManagerStats {
    pub inbound: usize,
    pub outbound: usize,
    pub connections: u64,
    pub disconnections: u64,
    pub dial_successes: u64,
    pub dial_failures: u64,
    pub inbound_rejected: u64,
    pub handshake_failures: u64,
    pub reputation_disconnects: u64,
    pub pending_dials: usize,
    pub known_candidates: usize,
}

struct Inner {
    config: NetworkConfig,
    conn_config: ConnectionConfig,
    local: Handshake,
    local_id: PeerId,
    table: PeerTable<Arc<Connection>>,
    dials: DialQueue,
    discovery: PeerDiscovery,
    pool: Arc<DiscoveryPool>,
    reputation: Arc<dyn ReputationOracle>,
    /// Peers redialled forever.
    persistent: DashMap<PeerId, PeerAddress>,
    /// Peer-exchange requests awaiting a response.
    pex_outstanding: DashMap<PeerId, Instant>,
    events: mpsc::Sender<NetworkEvent>,
    inbound_tx: mpsc::Sender<InboundMessage>,
    receivers: Mutex<Option<(mpsc::Receiver<DialTask>, mpsc::Receiver<InboundMessage>)>>,
    counters: Counters,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

/// Handle to the connection manager. Cheap to clone.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    /// Create a manager.
    ///
    /// Returns the manager and the receiving end of the event channel.
    pub fn new(
        config: NetworkConfig,
        reputation: Arc<dyn ReputationOracle>,
    ) -> NetworkResult<(Self, mpsc::Receiver<NetworkEvent>)> {
        config.validate()?;

        let local_id = PeerId::new(config.node_id.clone());
        let local = Handshake::new(&config.chain_id, &config.node_id);
        let pool = Arc::new(DiscoveryPool::new(config.discovery_pool_size));
        let discovery = PeerDiscovery::new(
            &config.seeds,
            pool.clone(),
            local_id.clone(),
            config.dial_timeout,
            config.handshake_timeout,
            config.seed_crawl_interval,
        )
        .map_err(|e| NetworkError::Config(format!("seeds: {}", e)))?;

        let persistent = DashMap::new();
        for entry in &config.persistent_peers {
            let address = PeerAddress::parse(entry)
                .map_err(|e| NetworkError::Config(format!("persistent peer '{}': {}", entry, e)))?;
            persistent.insert(address.id().wire_form(), address);
        }

        let (events, event_rx) = mpsc::channel(config.event_buffer);
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_BUFFER);
        let (dials, dial_rx) = DialQueue::new(DIAL_QUEUE_CAPACITY);

        let inner = Inner {
            conn_config: ConnectionConfig::from(&config),
            table: PeerTable::new(PeerLimits::from(&config)),
            local,
            local_id,
            dials,
            discovery,
            pool,
            reputation,
            persistent,
            pex_outstanding: DashMap::new(),
            events,
            inbound_tx,
            receivers: Mutex::new(Some((dial_rx, inbound_rx))),
            counters: Counters::default(),
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
            config,
        };

        Ok((
            Self {
                inner: Arc::new(inner),
            },
            event_rx,
        ))
    }

    /// Spawn the background tasks and queue the persistent peers.
    pub fn start(&self) -> NetworkResult<()> {
        let (dial_rx, inbound_rx) = self
            .inner
            .receivers
            .lock()
            .take()
            .ok_or_else(|| NetworkError::Config("connection manager already started".into()))?;

        let inner = &self.inner;
        inner.tracker.spawn(inner.clone().dial_loop(dial_rx));
        inner.tracker.spawn(inner.clone().route_inbound(inbound_rx));
        inner.tracker.spawn(inner.clone().maintenance_loop());
        inner.tracker.spawn(inner.clone().discovery_loop());

        let persistent: Vec<PeerAddress> = inner.persistent.iter().map(|e| e.value().clone()).collect();
        for address in persistent {
            if inner.dials.claim(address.id()) {
                inner.schedule(DialTask::new(address, true));
            }
        }

        info!(
            node = %inner.local_id,
            chain = %inner.config.chain_id,
            seeds = inner.config.seeds.len(),
            persistent = inner.persistent.len(),
            "Connection manager started"
        );
        Ok(())
    }

    /// Cancel every task, close every connection and wait for all of them.
    pub async fn shutdown(&self) {
        info!("Connection manager shutting down");
        self.inner.cancel.cancel();
        for conn in self.inner.table.values() {
            conn.close(DisconnectReason::Shutdown);
        }
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        debug!("Connection manager stopped");
    }

    /// Queue an outbound dial. Never blocks.
    ///
    /// A persistent peer that finds the queue full is still retried later;
    /// the error only reports that this attempt was not queued.
    #[instrument(skip(self), fields(peer = %address.id()))]
    pub fn dial(&self, address: PeerAddress, persistent: bool) -> NetworkResult<()> {
        let inner = &self.inner;
        if inner.cancel.is_cancelled() {
            return Err(NetworkError::Shutdown);
        }
        let key = address.id().wire_form();
        if key == inner.local_id.wire_form() {
            return Err(NetworkError::InvalidAddress("refusing to dial self".into()));
        }
        if persistent {
            inner.persistent.insert(key.clone(), address.clone());
        }
        if inner.table.contains(&key) {
            debug!("Already connected");
            return Ok(());
        }

        if !persistent {
            return inner.dials.enqueue(DialTask::new(address, false));
        }
        if !inner.dials.claim(address.id()) {
            return Ok(());
        }
        match inner.dials.push_claimed(DialTask::new(address, true)) {
            Ok(()) => Ok(()),
            Err((task, NetworkError::DialQueueFull)) => {
                warn!("Dial queue full, deferring persistent dial");
                inner.schedule(task.retry_after(QUEUE_FULL_RETRY));
                Err(NetworkError::DialQueueFull)
            }
            Err((task, e)) => {
                inner.dials.release(task.id());
                Err(e)
            }
        }
    }

    /// Admit an accepted transport: capacity check, then handshake in the background.
    pub fn accept_inbound(&self, stream: TcpStream, addr: SocketAddr) -> NetworkResult<()> {
        let inner = &self.inner;
        if inner.cancel.is_cancelled() {
            return Err(NetworkError::Shutdown);
        }
        if let Err(e) = inner.table.has_capacity(Direction::Inbound) {
            Counters::bump(&inner.counters.inbound_rejected);
            warn!(addr = %addr, error = %e, "Rejecting inbound connection");
            return Err(e);
        }
        debug!(addr = %addr, "Inbound connection");
        inner.tracker.spawn(inner.clone().handle_inbound(stream, addr));
        Ok(())
    }

    /// Accept connections until shutdown.
    pub async fn run_listener(&self, listener: TcpListener) {
        if let Ok(addr) = listener.local_addr() {
            info!(addr = %addr, "Listening for peers");
        }
        loop {
            let accepted = tokio::select! {
                _ = self.inner.cancel.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, addr)) => {
                    let _ = self.accept_inbound(stream, addr);
                }
                Err(e) => {
                    error!("Accept error: {}", e);
                }
            }
        }
        debug!("Listener stopped");
    }

    /// Run [`Self::run_listener`] as a tracked background task.
    pub fn spawn_listener(&self, listener: TcpListener) {
        let manager = self.clone();
        self.inner
            .tracker
            .spawn(async move { manager.run_listener(listener).await });
    }

    /// Answer seed crawls from this node's candidate pool until shutdown.
    pub fn spawn_seed_responder(&self, listener: TcpListener) {
        self.inner.tracker.spawn(discovery::serve_seed_requests(
            listener,
            self.inner.pool.clone(),
            self.inner.cancel.clone(),
            self.inner.tracker.clone(),
            self.inner.config.handshake_timeout,
        ));
    }

    /// Send an application message to one peer.
    pub async fn send(&self, peer: &PeerId, msg_type: &str, payload: impl Into<Bytes>) -> NetworkResult<()> {
        let message = Message::new(msg_type, payload);
        if message.is_internal() {
            return Err(NetworkError::InvalidFormat(format!(
                "'{}' is reserved for the network layer",
                msg_type
            )));
        }
        let conn = self
            .inner
            .table
            .get(&peer.wire_form())
            .ok_or_else(|| NetworkError::NotConnected(peer.to_string()))?;
        conn.send(message).await
    }

    /// Send an application message to every connected peer.
    ///
    /// Returns the number of peers the message was written to.
    pub async fn broadcast(&self, msg_type: &str, payload: impl Into<Bytes>) -> NetworkResult<usize> {
        let message = Message::new(msg_type, payload);
        if message.is_internal() {
            return Err(NetworkError::InvalidFormat(format!(
                "'{}' is reserved for the network layer",
                msg_type
            )));
        }
        let conns = self.inner.table.values();
        let sends = conns.iter().map(|conn| {
            let message = message.clone();
            async move {
                match conn.send(message).await {
                    Ok(()) => true,
                    Err(e) => {
                        debug!(peer = %conn.id(), error = %e, "Broadcast send failed");
                        false
                    }
                }
            }
        });
        let delivered = futures::future::join_all(sends)
            .await
            .into_iter()
            .filter(|ok| *ok)
            .count();
        Ok(delivered)
    }

    /// Close the connection to `peer`.
    pub fn disconnect(&self, peer: &PeerId) -> NetworkResult<()> {
        let conn = self
            .inner
            .table
            .get(&peer.wire_form())
            .ok_or_else(|| NetworkError::NotConnected(peer.to_string()))?;
        conn.close(DisconnectReason::Requested);
        Ok(())
    }

    /// Snapshot of every registered connection.
    pub fn peers(&self) -> Vec<PeerSnapshot> {
        self.inner.table.values().iter().map(|c| c.snapshot()).collect()
    }

    pub fn peer_count(&self) -> usize {
        self.inner.table.len()
    }

    pub fn counts(&self) -> PeerCounts {
        self.inner.table.counts()
    }

    pub fn is_connected(&self, peer: &PeerId) -> bool {
        self.inner.table.contains(&peer.wire_form())
    }

    pub fn stats(&self) -> ManagerStats {
        let inner = &self.inner;
        let counts = inner.table.counts();
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        ManagerStats {
            inbound: counts.inbound,
            outbound: counts.outbound,
            connections: load(&inner.counters.connections),
            disconnections: load(&inner.counters.disconnections),
            dial_successes: load(&inner.counters.dial_successes),
            dial_failures: load(&inner.counters.dial_failures),
            inbound_rejected: load(&inner.counters.inbound_rejected),
            handshake_failures: load(&inner.counters.handshake_failures),
            reputation_disconnects: load(&inner.counters.reputation_disconnects),
            pending_dials: inner.dials.pending(),
            known_candidates: inner.pool.len(),
        }
    }

    /// The discovery candidate pool.
    pub fn pool(&self) -> &Arc<DiscoveryPool> {
        &self.inner.pool
    }

    /// Add a candidate by hand.
    pub fn add_candidate(&self, address: PeerAddress) {
        if *address.id() != self.inner.local_id {
            self.inner.pool.insert(PeerInfo::new(address, PeerSource::Manual));
        }
    }

    pub fn local_id(&self) -> &PeerId {
        &self.inner.local_id
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.inner.config
    }
}

impl Inner {
    fn is_banned(&self, peer: &PeerId) -> bool {
        self.reputation.is_banned(&peer.wire_form())
    }

    fn is_local(&self, peer: &PeerId) -> bool {
        peer.wire_form() == self.local_id.wire_form()
    }

    async fn emit(&self, event: NetworkEvent) {
        if self.cancel.is_cancelled() {
            let _ = self.events.try_send(event);
            return;
        }
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = self.events.send(event) => {}
        }
    }

    /// Ask the collaborator about `peer`; a slow answer counts as a rejection.
    async fn check_reputation(&self, peer: &PeerId, addr: SocketAddr) -> ReputationVerdict {
        match tokio::time::timeout(self.config.handshake_timeout, self.reputation.check(peer, addr)).await {
            Ok(verdict) => verdict,
            Err(_) => {
                warn!(peer = %peer, "Reputation check timed out");
                ReputationVerdict::Reject("reputation check timed out".into())
            }
        }
    }

    async fn record_reputation(&self, event: ReputationEvent) {
        if tokio::time::timeout(self.config.handshake_timeout, self.reputation.record(event))
            .await
            .is_err()
        {
            warn!("Reputation record timed out");
        }
    }

    /// Re-queue `task` once it becomes eligible. The caller holds the claim.
    fn schedule(self: &Arc<Self>, task: DialTask) {
        let inner = self.clone();
        self.tracker.spawn(async move {
            let mut task = task;
            let mut wait = task.delay();
            loop {
                tokio::select! {
                    _ = inner.cancel.cancelled() => {
                        inner.dials.release(task.id());
                        return;
                    }
                    _ = tokio::time::sleep(wait) => {}
                }
                match inner.dials.push_claimed(task) {
                    Ok(()) => return,
                    Err((deferred, NetworkError::DialQueueFull)) => {
                        debug!(peer = %deferred.id(), "Dial queue full, retrying shortly");
                        task = deferred;
                        wait = QUEUE_FULL_RETRY;
                    }
                    Err((dropped, _)) => {
                        inner.dials.release(dropped.id());
                        return;
                    }
                }
            }
        });
    }

    async fn dial_loop(self: Arc<Self>, mut rx: mpsc::Receiver<DialTask>) {
        loop {
            let task = tokio::select! {
                _ = self.cancel.cancelled() => break,
                task = rx.recv() => match task {
                    Some(task) => task,
                    None => break,
                },
            };
            let inner = self.clone();
            self.tracker.spawn(async move { inner.run_dial(task).await });
        }
        debug!("Dial consumer stopped");
    }

    /// One dial attempt. Owns the claim on the task's identifier.
    async fn run_dial(self: Arc<Self>, task: DialTask) {
        let id = task.id().clone();

        let delay = task.delay();
        if !delay.is_zero() {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    self.dials.release(&id);
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }

        if self.table.contains(&id.wire_form()) {
            self.dials.release(&id);
            return;
        }
        if let Err(e) = self.table.has_capacity(Direction::Outbound) {
            debug!(peer = %id, error = %e, "No outbound capacity");
            if task.persistent && !self.cancel.is_cancelled() {
                self.schedule(task.retry());
            } else {
                self.dials.release(&id);
            }
            return;
        }

        let result = tokio::select! {
            _ = self.cancel.cancelled() => Err(NetworkError::Shutdown),
            result = self.connect_outbound(&task) => result,
        };

        match result {
            Ok(()) => {
                Counters::bump(&self.counters.dial_successes);
                self.dials.release(&id);
            }
            Err(NetworkError::Shutdown) => {
                self.dials.release(&id);
            }
            Err(e) => {
                Counters::bump(&self.counters.dial_failures);
                warn!(peer = %id, attempts = task.attempts, error = %e, "Dial failed");
                if let Some(reason) = PenaltyReason::for_error(&e) {
                    self.record_reputation(ReputationEvent::Misbehaved {
                        peer: id.wire_form(),
                        reason,
                    })
                    .await;
                }
                self.emit(NetworkEvent::DialFailed {
                    address: task.address.clone(),
                    error: e.to_string(),
                    attempts: task.attempts,
                })
                .await;

                let persistent = task.persistent || self.persistent.contains_key(&id.wire_form());
                if persistent && !self.cancel.is_cancelled() {
                    let next = task.retry();
                    debug!(peer = %id, delay = ?next.delay(), "Scheduling redial");
                    self.schedule(next);
                } else {
                    // Not retried; it comes back only if rediscovered.
                    self.pool.remove(&id);
                    self.dials.release(&id);
                }
            }
        }
    }

    /// Transport dial, handshake and registration.
    async fn connect_outbound(self: &Arc<Self>, task: &DialTask) -> NetworkResult<()> {
        let mut stream = connection::dial(&task.address, self.config.dial_timeout).await?;
        let outcome = handshake::initiate(
            &mut stream,
            &self.local,
            Some(task.id()),
            self.config.handshake_timeout,
        )
        .await?;

        let persistent = task.persistent || self.persistent.contains_key(&outcome.peer_id);
        let (conn, reader) = Connection::new(
            stream,
            outcome,
            Direction::Outbound,
            Some(task.address.clone()),
            persistent,
            self.conn_config.clone(),
            self.cancel.child_token(),
        )?;
        self.register(conn, reader).await
    }

    async fn handle_inbound(self: Arc<Self>, mut stream: TcpStream, addr: SocketAddr) {
        let outcome = match handshake::respond(&mut stream, &self.local, self.config.handshake_timeout).await {
            Ok(outcome) => outcome,
            Err(e) => {
                Counters::bump(&self.counters.handshake_failures);
                warn!(addr = %addr, error = %e, "Inbound handshake failed");
                return;
            }
        };
        if self.is_local(&outcome.peer_id) {
            warn!(addr = %addr, "Dropping connection to self");
            return;
        }

        let address = self.persistent.get(&outcome.peer_id).map(|e| e.value().clone());
        let persistent = address.is_some();
        let result = Connection::new(
            stream,
            outcome,
            Direction::Inbound,
            address,
            persistent,
            self.conn_config.clone(),
            self.cancel.child_token(),
        );
        let registered = match result {
            Ok((conn, reader)) => self.register(conn, reader).await,
            Err(e) => Err(e),
        };
        if let Err(e) = registered {
            if matches!(e, NetworkError::PeerLimitReached(_)) {
                Counters::bump(&self.counters.inbound_rejected);
            }
            debug!(addr = %addr, error = %e, "Inbound peer not registered");
        }
    }

    /// Admit a handshaken connection into the table and start its tasks.
    async fn register(
        self: &Arc<Self>,
        conn: Arc<Connection>,
        reader: tokio::net::tcp::OwnedReadHalf,
    ) -> NetworkResult<()> {
        let id = conn.id().clone();
        let addr = conn.remote_addr();

        match self.check_reputation(&id, addr).await {
            ReputationVerdict::Admit => {}
            ReputationVerdict::Reject(reason) => {
                info!(peer = %id, reason = %reason, "Peer rejected by reputation");
                conn.close(DisconnectReason::Rejected(reason.clone()));
                return Err(NetworkError::ReputationRejected(reason));
            }
            ReputationVerdict::Banned => {
                info!(peer = %id, "Peer is banned");
                conn.close(DisconnectReason::Rejected("banned".into()));
                return Err(NetworkError::PeerBanned(id.to_string()));
            }
        }
        if self.cancel.is_cancelled() {
            return Err(NetworkError::Shutdown);
        }

        let replaced = self.table.insert(id.clone(), conn.direction(), conn.clone())?;
        if let Some(old) = replaced {
            info!(peer = %id, "Replacing existing connection");
            old.close(DisconnectReason::Replaced);
        }

        Counters::bump(&self.counters.connections);
        info!(
            peer = %id,
            addr = %addr,
            direction = %conn.direction(),
            persistent = conn.is_persistent(),
            "Peer connected"
        );

        let inner = self.clone();
        let inbound = self.inbound_tx.clone();
        let running = conn.clone();
        self.tracker.spawn(async move {
            let reason = running.clone().run(reader, inbound).await;
            inner.on_disconnected(running, reason).await;
        });

        self.record_reputation(ReputationEvent::Connected { peer: id.clone() }).await;
        self.emit(NetworkEvent::PeerConnected {
            peer_id: id,
            addr,
            direction: conn.direction(),
        })
        .await;
        Ok(())
    }

    async fn on_disconnected(self: Arc<Self>, conn: Arc<Connection>, reason: DisconnectReason) {
        let id = conn.id().clone();
        let removed = self
            .table
            .remove_if(&id, |current| Arc::ptr_eq(current, &conn))
            .is_some();
        self.pex_outstanding.remove(&id);

        if removed || reason == DisconnectReason::Replaced {
            Counters::bump(&self.counters.disconnections);
        }
        info!(peer = %id, reason = ?reason, "Peer disconnected");

        self.record_reputation(ReputationEvent::Disconnected {
            peer: id.clone(),
            reason: reason.clone(),
        })
        .await;
        let verdict = if self.cancel.is_cancelled() {
            ReputationVerdict::Admit
        } else {
            self.check_reputation(&id, conn.remote_addr()).await
        };
        if !verdict.is_admit() {
            debug!(peer = %id, verdict = ?verdict, "Dropping candidate after disconnect");
            let candidate = conn.address().map(|a| a.id().clone()).unwrap_or_else(|| id.clone());
            self.pool.remove(&candidate);
        }

        if removed {
            self.emit(NetworkEvent::PeerDisconnected {
                peer_id: id.clone(),
                reason: reason.clone(),
            })
            .await;
        }

        if self.cancel.is_cancelled() || !reason.allows_redial() {
            return;
        }
        let address = match self.persistent.get(&id) {
            Some(entry) => entry.value().clone(),
            None => return,
        };
        if self.dials.claim(&id) {
            debug!(peer = %id, "Scheduling persistent redial");
            self.schedule(DialTask::reconnect(address, true));
        }
    }

    async fn route_inbound(self: Arc<Self>, mut rx: mpsc::Receiver<InboundMessage>) {
        loop {
            let item = tokio::select! {
                _ = self.cancel.cancelled() => break,
                item = rx.recv() => match item {
                    Some(item) => item,
                    None => break,
                },
            };
            let InboundMessage { peer, message } = item;
            match message.msg_type.as_str() {
                MSG_PEX_REQUEST => self.answer_pex(peer),
                MSG_PEX_RESPONSE => self.merge_pex(peer, message.payload).await,
                _ => {
                    self.emit(NetworkEvent::MessageReceived {
                        peer_id: peer,
                        message,
                    })
                    .await
                }
            }
        }
        debug!("Inbound router stopped");
    }

    /// Peers worth sharing with `requester`.
    fn shareable_peers(&self, requester: &PeerId) -> Vec<PeerAddress> {
        let mut peers: Vec<PeerAddress> = self
            .table
            .values()
            .iter()
            .filter(|c| c.direction() == Direction::Outbound)
            .filter_map(|c| c.address().cloned())
            .collect();
        for candidate in self.pool.sample(self.config.pex_max_peers) {
            if !peers.iter().any(|p| p.id() == candidate.id()) {
                peers.push(candidate);
            }
        }
        peers.retain(|p| p.id().wire_form() != *requester && !self.is_banned(p.id()));
        peers.truncate(self.config.pex_max_peers);
        peers
    }

    fn answer_pex(self: &Arc<Self>, peer: PeerId) {
        let Some(conn) = self.table.get(&peer) else {
            return;
        };
        let list = encode_peer_list(&self.shareable_peers(&peer));
        self.tracker.spawn(async move {
            if let Err(e) = conn.send(Message::new(MSG_PEX_RESPONSE, list)).await {
                debug!(peer = %conn.id(), error = %e, "Peer exchange reply failed");
            }
        });
    }

    async fn merge_pex(&self, peer: PeerId, payload: Bytes) {
        if self.pex_outstanding.remove(&peer).is_none() {
            debug!(peer = %peer, "Unsolicited peer exchange response");
            self.record_reputation(ReputationEvent::Misbehaved {
                peer,
                reason: PenaltyReason::UnexpectedMessage,
            })
            .await;
            return;
        }
        match discovery::decode_peer_list(&payload).await {
            Ok(addrs) => {
                let received = addrs.len();
                let banned = |id: &PeerId| self.is_banned(id);
                let added = self.pool.merge(addrs, PeerSource::PeerExchange, &self.local_id, &banned);
                debug!(peer = %peer, received, added, "Merged peer exchange");
                if added > 0 {
                    self.record_reputation(ReputationEvent::UsefulPeerList { peer }).await;
                }
            }
            Err(e) => {
                warn!(peer = %peer, error = %e, "Bad peer exchange response");
                self.record_reputation(ReputationEvent::Misbehaved {
                    peer,
                    reason: PenaltyReason::InvalidPeerList,
                })
                .await;
            }
        }
    }

    /// Ask every connected peer for its peer list.
    async fn request_pex(&self) {
        let request = Message::new(MSG_PEX_REQUEST, Bytes::from_static(&[DISCOVERY_REQUEST]));
        for conn in self.table.values() {
            self.pex_outstanding.insert(conn.id().clone(), Instant::now());
            if let Err(e) = conn.send(request.clone()).await {
                debug!(peer = %conn.id(), error = %e, "Peer exchange request failed");
            }
        }
    }

    /// Queue dials until outbound connections reach the configured floor.
    fn top_up_outbound(&self) {
        let counts = self.table.counts();
        let min = self.config.min_outbound;
        if counts.outbound >= min {
            return;
        }
        let want = min - counts.outbound;
        let candidates = self.pool.candidates(want, &|id| {
            self.is_local(id) || self.table.contains(&id.wire_form()) || self.dials.is_pending(id) || self.is_banned(id)
        });
        if candidates.is_empty() {
            return;
        }
        debug!(outbound = counts.outbound, min, dialing = candidates.len(), "Topping up outbound peers");
        for address in candidates {
            match self.dials.enqueue(DialTask::new(address, false)) {
                Ok(()) => {}
                Err(NetworkError::DialQueueFull) => break,
                Err(e) => {
                    debug!(error = %e, "Could not queue dial");
                    break;
                }
            }
        }
    }

    /// Disconnect every peer the collaborator no longer admits.
    async fn reputation_sweep(&self) {
        for conn in self.table.values() {
            let verdict = self.check_reputation(conn.id(), conn.remote_addr()).await;
            let reason = match verdict {
                ReputationVerdict::Admit => continue,
                ReputationVerdict::Reject(reason) => reason,
                ReputationVerdict::Banned => "banned".to_string(),
            };
            info!(peer = %conn.id(), reason = %reason, "Disconnecting peer on reputation");
            Counters::bump(&self.counters.reputation_disconnects);
            conn.close(DisconnectReason::Rejected(reason));
        }
    }

    async fn maintenance_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.maintenance_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            self.reputation_sweep().await;
            self.top_up_outbound();

            let counts = self.table.counts();
            debug!(
                inbound = counts.inbound,
                outbound = counts.outbound,
                candidates = self.pool.len(),
                pending_dials = self.dials.pending(),
                "Maintenance tick"
            );
        }
        debug!("Maintenance loop stopped");
    }

    async fn discovery_loop(self: Arc<Self>) {
        let banned = |id: &PeerId| self.is_banned(id);
        if self.discovery.has_seeds() {
            let added = tokio::select! {
                _ = self.cancel.cancelled() => return,
                added = self.discovery.crawl_seeds(&banned) => added,
            };
            info!(added, "Initial seed crawl complete");
            self.top_up_outbound();
        }

        let mut ticker = tokio::time::interval(self.config.pex_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            self.request_pex().await;

            let outbound = self.table.counts().outbound;
            let crawled = tokio::select! {
                _ = self.cancel.cancelled() => break,
                crawled = self.discovery.maybe_recrawl(outbound, self.config.min_outbound, &banned) => crawled,
            };
            if crawled {
                self.top_up_outbound();
            }
        }
        debug!("Discovery loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reputation::AllowAll;

    fn config(node: &str) -> NetworkConfig {
        let mut config = NetworkConfig::new("test-chain", node);
        config.dial_timeout = Duration::from_secs(2);
        config.handshake_timeout = Duration::from_secs(2);
        config
    }

    /// Start a manager listening on an ephemeral loopback port.
    async fn listening(config: NetworkConfig) -> (ConnectionManager, mpsc::Receiver<NetworkEvent>, PeerAddress) {
        let node = config.node_id.clone();
        let (manager, events) = ConnectionManager::new(config, Arc::new(AllowAll)).unwrap();
        manager.start().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        manager.spawn_listener(listener);
        (manager, events, PeerAddress::new(node, "127.0.0.1", port).unwrap())
    }

    async fn wait_for(
        events: &mut mpsc::Receiver<NetworkEvent>,
        mut pred: impl FnMut(&NetworkEvent) -> bool,
    ) -> NetworkEvent {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let event = events.recv().await.expect("event channel closed");
                if pred(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("timed out waiting for event")
    }

    #[tokio::test]
    async fn test_new_validates_config() {
        let bad = NetworkConfig::default();
        assert!(ConnectionManager::new(bad, Arc::new(AllowAll)).is_err());

        let mut bad_peer = config("a");
        bad_peer.persistent_peers = vec!["no-at-sign:1".into()];
        assert!(matches!(
            ConnectionManager::new(bad_peer, Arc::new(AllowAll)),
            Err(NetworkError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let (manager, _events) = ConnectionManager::new(config("a"), Arc::new(AllowAll)).unwrap();
        manager.start().unwrap();
        assert!(manager.start().is_err());
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_dial_self_refused() {
        let (manager, _events) = ConnectionManager::new(config("a"), Arc::new(AllowAll)).unwrap();
        let me = PeerAddress::new("a", "127.0.0.1", 1).unwrap();
        assert!(matches!(manager.dial(me, false), Err(NetworkError::InvalidAddress(_))));
    }

    #[tokio::test]
    async fn test_dial_queue_full() {
        let (manager, _events) = ConnectionManager::new(config("a"), Arc::new(AllowAll)).unwrap();
        // Not started, so nothing drains the queue.
        for i in 0..DIAL_QUEUE_CAPACITY {
            let addr = PeerAddress::new(format!("p{}", i), "127.0.0.1", 1).unwrap();
            manager.dial(addr, false).unwrap();
        }
        let overflow = PeerAddress::new("overflow", "127.0.0.1", 1).unwrap();
        assert!(matches!(manager.dial(overflow, false), Err(NetworkError::DialQueueFull)));
        assert_eq!(manager.stats().pending_dials, DIAL_QUEUE_CAPACITY);
    }

    #[tokio::test]
    async fn test_reserved_types_refused() {
        let (manager, _events) = ConnectionManager::new(config("a"), Arc::new(AllowAll)).unwrap();
        assert!(matches!(
            manager.send(&PeerId::from("b"), MSG_PEX_REQUEST, Bytes::new()).await,
            Err(NetworkError::InvalidFormat(_))
        ));
        assert!(matches!(
            manager.send(&PeerId::from("b"), "tx", Bytes::new()).await,
            Err(NetworkError::NotConnected(_))
        ));
        assert_eq!(manager.broadcast("tx", Bytes::new()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_connect_send_disconnect() {
        let (a, mut a_events, _) = listening(config("a")).await;
        let (b, mut b_events, b_addr) = listening(config("b")).await;

        a.dial(b_addr, false).unwrap();
        let event = wait_for(&mut a_events, |e| matches!(e, NetworkEvent::PeerConnected { .. })).await;
        match event {
            NetworkEvent::PeerConnected { peer_id, direction, .. } => {
                assert_eq!(peer_id.as_str(), "b");
                assert_eq!(direction, Direction::Outbound);
            }
            other => panic!("unexpected event {:?}", other),
        }
        wait_for(&mut b_events, |e| matches!(e, NetworkEvent::PeerConnected { .. })).await;
        assert_eq!(b.counts(), PeerCounts { inbound: 1, outbound: 0 });

        a.send(&PeerId::from("b"), "tx", Bytes::from_static(b"hello")).await.unwrap();
        let event = wait_for(&mut b_events, |e| matches!(e, NetworkEvent::MessageReceived { .. })).await;
        match event {
            NetworkEvent::MessageReceived { peer_id, message } => {
                assert_eq!(peer_id.as_str(), "a");
                assert_eq!(message.msg_type, "tx");
                assert_eq!(&message.payload[..], b"hello");
            }
            other => panic!("unexpected event {:?}", other),
        }

        a.disconnect(&PeerId::from("b")).unwrap();
        let event = wait_for(&mut a_events, |e| matches!(e, NetworkEvent::PeerDisconnected { .. })).await;
        assert!(matches!(
            event,
            NetworkEvent::PeerDisconnected {
                reason: DisconnectReason::Requested,
                ..
            }
        ));
        wait_for(&mut b_events, |e| matches!(e, NetworkEvent::PeerDisconnected { .. })).await;
        assert_eq!(a.peer_count(), 0);
        assert_eq!(a.stats().dial_successes, 1);

        a.shutdown().await;
        b.shutdown().await;
    }

    #[tokio::test]
    async fn test_chain_mismatch_fails_dial() {
        let (a, mut a_events, _) = listening(config("a")).await;
        let mut other = config("b");
        other.chain_id = "other-chain".into();
        let (b, _b_events, b_addr) = listening(other).await;

        a.dial(b_addr, false).unwrap();
        let event = wait_for(&mut a_events, |e| matches!(e, NetworkEvent::DialFailed { .. })).await;
        match event {
            NetworkEvent::DialFailed { address, attempts, .. } => {
                assert_eq!(address.id().as_str(), "b");
                assert_eq!(attempts, 0);
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(a.peer_count(), 0);
        assert_eq!(b.peer_count(), 0);
        assert_eq!(a.stats().dial_failures, 1);

        a.shutdown().await;
        b.shutdown().await;
    }

    #[tokio::test]
    async fn test_inbound_limit() {
        let mut limited = config("hub");
        limited.max_inbound = 1;
        let (hub, mut hub_events, hub_addr) = listening(limited).await;
        let (a, mut a_events, _) = listening(config("a")).await;
        let (b, _b_events, _) = listening(config("b")).await;

        a.dial(hub_addr.clone(), false).unwrap();
        wait_for(&mut a_events, |e| matches!(e, NetworkEvent::PeerConnected { .. })).await;
        wait_for(&mut hub_events, |e| matches!(e, NetworkEvent::PeerConnected { .. })).await;

        b.dial(hub_addr, false).unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(hub.counts().inbound, 1);
        assert!(hub.is_connected(&PeerId::from("a")));
        assert!(!hub.is_connected(&PeerId::from("b")));
        assert!(hub.stats().inbound_rejected >= 1);

        for manager in [a, b, hub] {
            manager.shutdown().await;
        }
    }

    #[tokio::test]
    async fn test_peer_exchange_merges_candidates() {
        let mut fast = config("a");
        fast.pex_interval = Duration::from_millis(100);
        fast.min_outbound = 0;
        let (a, mut a_events, _) = listening(fast).await;
        // b must not dial the unreachable candidate, which would drop it from its pool.
        let mut quiet = config("b");
        quiet.min_outbound = 0;
        let (b, mut b_events, b_addr) = listening(quiet).await;
        b.add_candidate(PeerAddress::new("c", "127.0.0.1", 1).unwrap());
        b.add_candidate(PeerAddress::new("a", "127.0.0.1", 2).unwrap());

        a.dial(b_addr, false).unwrap();
        wait_for(&mut a_events, |e| matches!(e, NetworkEvent::PeerConnected { .. })).await;
        wait_for(&mut b_events, |e| matches!(e, NetworkEvent::PeerConnected { .. })).await;

        tokio::time::timeout(Duration::from_secs(5), async {
            while !a.pool().contains(&PeerId::from("c")) {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("candidate never merged");
        // The requester's own id is never handed back to it.
        assert!(!a.pool().contains(&PeerId::from("a")));

        a.shutdown().await;
        b.shutdown().await;
    }

    #[tokio::test]
    async fn test_long_persistent_id_redialled() {
        let long_id = "n".repeat(40);
        let (a, mut a_events, _) = listening(config("a")).await;
        let (b, _b_events, b_addr) = listening(config(&long_id)).await;

        a.dial(b_addr.clone(), true).unwrap();
        wait_for(&mut a_events, |e| matches!(e, NetworkEvent::PeerConnected { .. })).await;
        assert!(a.is_connected(b_addr.id()));
        assert_eq!(a.peers()[0].id, b_addr.id().wire_form());
        assert!(a.peers()[0].persistent);

        // Already connected under the truncated key; dialling again is a no-op.
        a.dial(b_addr.clone(), true).unwrap();
        assert_eq!(a.peer_count(), 1);

        a.disconnect(b_addr.id()).unwrap();
        wait_for(&mut a_events, |e| matches!(e, NetworkEvent::PeerDisconnected { .. })).await;
        wait_for(&mut a_events, |e| matches!(e, NetworkEvent::PeerConnected { .. })).await;
        assert!(a.is_connected(b_addr.id()));
        assert_eq!(a.peer_count(), 1);

        a.shutdown().await;
        b.shutdown().await;
    }

    #[tokio::test]
    async fn test_operations_after_shutdown() {
        let (manager, _events) = ConnectionManager::new(config("a"), Arc::new(AllowAll)).unwrap();
        manager.start().unwrap();
        manager.shutdown().await;
        let addr = PeerAddress::new("b", "127.0.0.1", 1).unwrap();
        assert!(matches!(manager.dial(addr, false), Err(NetworkError::Shutdown)));
    }
}
