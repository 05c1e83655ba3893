//! Connection handling.
//!
//! A [`Connection`] owns one established, handshaken TCP link. Its read loop
//! and keep-alive timer run as two futures under [`Connection::run`]; outbound
//! writes come from any task through [`Connection::send`] and are serialized by
//! an async mutex around the framed write half.

use crate::codec::{MessageCodec, MSG_PING, MSG_PONG};
use crate::handshake::HandshakeOutcome;
use crate::penalties::PenaltyReason;
use crate::peer::{ConnectionState, Direction};
use crate::{ErrorCategory, Message, NetworkConfig, NetworkError, NetworkResult, PeerAddress, PeerId};
use bytes::BytesMut;
use futures::SinkExt;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::{Decoder, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace, warn};

/// Initial read buffer size.
const READ_BUFFER_SIZE: usize = 8 * 1024;

/// Connection configuration.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Deadline for every read. Silence between frames ends the link as
    /// inactive; a frame left half-sent ends it as stalled.
    pub read_timeout: Duration,
    /// Write timeout.
    pub write_timeout: Duration,
    /// Keep-alive cadence.
    pub ping_interval: Duration,
    /// Silence from the remote after which the link is considered dead.
    pub inactivity_timeout: Duration,
    /// Maximum message size.
    pub max_message_size: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self::from(&NetworkConfig::default())
    }
}

impl From<&NetworkConfig> for ConnectionConfig {
    fn from(config: &NetworkConfig) -> Self {
        Self {
            read_timeout: config.read_timeout,
            write_timeout: config.write_timeout,
            ping_interval: config.ping_interval,
            inactivity_timeout: config.inactivity_timeout,
            max_message_size: config.max_message_size,
        }
    }
}

/// Why a connection ended. Reported to the manager exactly once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Closed locally on request.
    Requested,
    /// Node shutdown.
    Shutdown,
    /// A newer connection with the same identifier took its place.
    Replaced,
    /// Remote closed the transport cleanly between frames.
    RemoteClosed,
    /// No traffic from the remote for the inactivity timeout.
    Inactive,
    /// Reputation collaborator rejected or banned the peer.
    Rejected(String),
    /// The remote broke the protocol.
    Violation {
        penalty: PenaltyReason,
        message: String,
    },
    /// Any other failure.
    Error {
        category: ErrorCategory,
        message: String,
    },
}

impl DisconnectReason {
    /// Classify a failure.
    pub fn from_error(error: &NetworkError) -> Self {
        match error {
            NetworkError::ConnectionClosed => Self::RemoteClosed,
            NetworkError::Inactive(_) => Self::Inactive,
            NetworkError::Shutdown => Self::Shutdown,
            NetworkError::ReputationRejected(reason) => Self::Rejected(reason.clone()),
            NetworkError::PeerBanned(id) => Self::Rejected(format!("banned: {}", id)),
            other => match PenaltyReason::for_error(other) {
                Some(penalty) => Self::Violation {
                    penalty,
                    message: other.to_string(),
                },
                None => Self::Error {
                    category: other.category(),
                    message: other.to_string(),
                },
            },
        }
    }

    /// Penalty the remote earned by causing this disconnect.
    pub fn penalty(&self) -> Option<PenaltyReason> {
        match self {
            Self::Violation { penalty, .. } => Some(*penalty),
            Self::Inactive => Some(PenaltyReason::Unresponsive),
            _ => None,
        }
    }

    /// Whether a persistent peer should be redialled after this reason.
    pub fn allows_redial(&self) -> bool {
        !matches!(self, Self::Shutdown | Self::Replaced)
    }

    /// Whether the remote sent something malformed or hostile.
    pub fn is_protocol_violation(&self) -> bool {
        match self {
            Self::Violation { penalty, .. } => !matches!(
                penalty,
                PenaltyReason::StalledFrame | PenaltyReason::Unresponsive
            ),
            _ => false,
        }
    }
}

/// Per-connection traffic counters.
#[derive(Debug)]
pub struct ConnectionStats {
    connected_since: Instant,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    /// Milliseconds after `connected_since`.
    last_sent_ms: AtomicU64,
    /// Milliseconds after `connected_since`.
    last_received_ms: AtomicU64,
}

impl ConnectionStats {
    fn new() -> Self {
        Self {
            connected_since: Instant::now(),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            messages_sent: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            last_sent_ms: AtomicU64::new(0),
            last_received_ms: AtomicU64::new(0),
        }
    }

    fn now_ms(&self) -> u64 {
        self.connected_since.elapsed().as_millis() as u64
    }

    fn record_sent(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.last_sent_ms.store(self.now_ms(), Ordering::Relaxed);
    }

    fn record_bytes_received(&self, bytes: usize) {
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
        self.last_received_ms.store(self.now_ms(), Ordering::Relaxed);
    }

    fn record_message_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Time since we last wrote a frame.
    pub fn since_sent(&self) -> Duration {
        let last = self.last_sent_ms.load(Ordering::Relaxed);
        Duration::from_millis(self.now_ms().saturating_sub(last))
    }

    /// Time since the remote last sent anything.
    pub fn since_received(&self) -> Duration {
        let last = self.last_received_ms.load(Ordering::Relaxed);
        Duration::from_millis(self.now_ms().saturating_sub(last))
    }

    /// Time since traffic in either direction.
    pub fn idle(&self) -> Duration {
        let last = self
            .last_sent_ms
            .load(Ordering::Relaxed)
            .max(self.last_received_ms.load(Ordering::Relaxed));
        Duration::from_millis(self.now_ms().saturating_sub(last))
    }

    /// Copy the counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            connected_for: self.connected_since.elapsed(),
            idle: self.idle(),
        }
    }
}

/// Point-in-time copy of [`ConnectionStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub connected_for: Duration,
    pub idle: Duration,
}

/// Read-only view of a connection for callers outside the manager.
#[derive(Debug, Clone)]
pub struct PeerSnapshot {
    pub id: PeerId,
    pub remote_addr: SocketAddr,
    pub direction: Direction,
    pub state: ConnectionState,
    pub version: u8,
    pub chain_id: String,
    pub persistent: bool,
    pub stats: StatsSnapshot,
}

/// A message read off a connection, tagged with its sender.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub peer: PeerId,
    pub message: Message,
}

/// Dial a peer's transport endpoint.
#[instrument(skip(dial_timeout), fields(peer = %address.id()))]
pub async fn dial(address: &PeerAddress, dial_timeout: Duration) -> NetworkResult<TcpStream> {
    trace!(state = ?ConnectionState::Connecting, "Dialing");
    let stream = tokio::time::timeout(dial_timeout, TcpStream::connect(address.endpoint()))
        .await
        .map_err(|_| NetworkError::DialTimeout)??;
    stream.set_nodelay(true)?;
    debug!(endpoint = %address.endpoint(), "Connected");
    Ok(stream)
}

/// An established peer link.
pub struct Connection {
    id: PeerId,
    remote_addr: SocketAddr,
    direction: Direction,
    version: u8,
    chain_id: String,
    /// Dialable address, known for outbound links.
    address: Option<PeerAddress>,
    persistent: bool,
    state: AtomicU8,
    stats: ConnectionStats,
    writer: tokio::sync::Mutex<FramedWrite<OwnedWriteHalf, MessageCodec>>,
    config: ConnectionConfig,
    cancel: CancellationToken,
    reason: Mutex<Option<DisconnectReason>>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("remote_addr", &self.remote_addr)
            .field("direction", &self.direction)
            .field("state", &self.state())
            .finish()
    }
}

impl Connection {
    /// Wrap a handshaken stream.
    ///
    /// Returns the connection and the read half that [`Connection::run`] consumes.
    pub fn new(
        stream: TcpStream,
        outcome: HandshakeOutcome,
        direction: Direction,
        address: Option<PeerAddress>,
        persistent: bool,
        config: ConnectionConfig,
        cancel: CancellationToken,
    ) -> NetworkResult<(Arc<Self>, OwnedReadHalf)> {
        let remote_addr = stream.peer_addr()?;
        let (reader, writer) = stream.into_split();
        let codec = MessageCodec::with_max_size(config.max_message_size);

        let conn = Arc::new(Self {
            id: outcome.peer_id,
            remote_addr,
            direction,
            version: outcome.version,
            chain_id: outcome.chain_id,
            address,
            persistent,
            state: AtomicU8::new(ConnectionState::Connected as u8),
            stats: ConnectionStats::new(),
            writer: tokio::sync::Mutex::new(FramedWrite::new(writer, codec)),
            config,
            cancel,
            reason: Mutex::new(None),
        });
        Ok((conn, reader))
    }

    pub fn id(&self) -> &PeerId {
        &self.id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn address(&self) -> Option<&PeerAddress> {
        self.address.as_ref()
    }

    pub fn is_persistent(&self) -> bool {
        self.persistent
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn stats(&self) -> &ConnectionStats {
        &self.stats
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Move forward to `next`; earlier states are never re-entered.
    fn advance(&self, next: ConnectionState) {
        let prev = self.state.fetch_max(next as u8, Ordering::AcqRel);
        if prev < next as u8 {
            trace!(peer = %self.id, from = ?ConnectionState::from_u8(prev), to = ?next, "State change");
        }
    }

    pub fn snapshot(&self) -> PeerSnapshot {
        PeerSnapshot {
            id: self.id.clone(),
            remote_addr: self.remote_addr,
            direction: self.direction,
            state: self.state(),
            version: self.version,
            chain_id: self.chain_id.clone(),
            persistent: self.persistent,
            stats: self.stats.snapshot(),
        }
    }

    /// Send a message.
    ///
    /// A failed or timed-out write closes the connection. A message too large
    /// to frame is refused without touching the link.
    pub async fn send(&self, message: Message) -> NetworkResult<()> {
        if !self.is_connected() {
            return Err(NetworkError::NotConnected(self.id.to_string()));
        }
        let size = message.wire_size();
        let body = size - crate::codec::LENGTH_PREFIX_SIZE;
        if body > self.config.max_message_size {
            return Err(NetworkError::MessageTooLarge {
                size: body,
                max: self.config.max_message_size,
            });
        }

        let msg_type = message.msg_type.clone();
        let mut writer = self.writer.lock().await;
        match tokio::time::timeout(self.config.write_timeout, writer.send(message)).await {
            Ok(Ok(())) => {
                self.stats.record_sent(size);
                trace!(peer = %self.id, msg = %msg_type, bytes = size, "Sent message");
                Ok(())
            }
            Ok(Err(e)) => {
                drop(writer);
                warn!(peer = %self.id, error = %e, "Write failed");
                self.close(DisconnectReason::from_error(&e));
                Err(e)
            }
            Err(_) => {
                drop(writer);
                warn!(peer = %self.id, "Write timed out");
                self.close(DisconnectReason::from_error(&NetworkError::WriteTimeout));
                Err(NetworkError::WriteTimeout)
            }
        }
    }

    /// Begin closing. The first recorded reason wins.
    pub fn close(&self, reason: DisconnectReason) {
        {
            let mut slot = self.reason.lock();
            if slot.is_none() {
                debug!(peer = %self.id, reason = ?reason, "Closing connection");
                *slot = Some(reason);
            }
        }
        self.advance(ConnectionState::Disconnecting);
        self.cancel.cancel();
    }

    /// Drive the connection until it closes and return why it closed.
    pub async fn run(self: Arc<Self>, reader: OwnedReadHalf, inbound: mpsc::Sender<InboundMessage>) -> DisconnectReason {
        tokio::join!(
            async {
                let reason = self.read_loop(reader, inbound).await;
                self.close(reason);
            },
            async {
                if let Some(reason) = self.keepalive_loop().await {
                    self.close(reason);
                }
            },
        );

        self.finish().await
    }

    async fn finish(&self) -> DisconnectReason {
        // Best-effort flush and shutdown of the write half.
        let flush = async {
            let mut writer = self.writer.lock().await;
            writer.close().await
        };
        if let Ok(Err(e)) = tokio::time::timeout(self.config.write_timeout, flush).await {
            trace!(peer = %self.id, error = %e, "Flush on close failed");
        }

        self.advance(ConnectionState::Disconnected);
        let reason = self.reason.lock().clone().unwrap_or(DisconnectReason::Shutdown);
        debug!(peer = %self.id, reason = ?reason, "Connection closed");
        reason
    }

    async fn read_loop(&self, mut reader: OwnedReadHalf, inbound: mpsc::Sender<InboundMessage>) -> DisconnectReason {
        let mut codec = MessageCodec::with_max_size(self.config.max_message_size);
        let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);

        loop {
            loop {
                match codec.decode(&mut buf) {
                    Ok(Some(message)) => {
                        self.stats.record_message_received();
                        if let Err(reason) = self.dispatch(message, &inbound).await {
                            return reason;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(peer = %self.id, error = %e, "Dropping peer for bad frame");
                        return DisconnectReason::from_error(&e);
                    }
                }
            }

            let mid_frame = !buf.is_empty();
            let deadline = self.config.read_timeout;
            let read = async {
                match tokio::time::timeout(deadline, reader.read_buf(&mut buf)).await {
                    Ok(read) => read.map_err(NetworkError::Io),
                    Err(_) if mid_frame => Err(NetworkError::ReadTimeout),
                    Err(_) => Err(NetworkError::Inactive(deadline)),
                }
            };

            let result = tokio::select! {
                _ = self.cancel.cancelled() => return DisconnectReason::Shutdown,
                result = read => result,
            };

            match result {
                Ok(0) if mid_frame => {
                    return DisconnectReason::from_error(&NetworkError::InvalidFormat(
                        "connection closed mid-frame".into(),
                    ));
                }
                Ok(0) => return DisconnectReason::RemoteClosed,
                Ok(n) => self.stats.record_bytes_received(n),
                Err(e) => return DisconnectReason::from_error(&e),
            }
        }
    }

    /// Handle keep-alive traffic and pass everything else upward in order.
    async fn dispatch(&self, message: Message, inbound: &mpsc::Sender<InboundMessage>) -> Result<(), DisconnectReason> {
        match message.msg_type.as_str() {
            MSG_PING => {
                trace!(peer = %self.id, "Ping");
                self.send(Message::empty(MSG_PONG))
                    .await
                    .map_err(|e| DisconnectReason::from_error(&e))
            }
            MSG_PONG => Ok(()),
            _ => {
                let item = InboundMessage {
                    peer: self.id.clone(),
                    message,
                };
                tokio::select! {
                    _ = self.cancel.cancelled() => Err(DisconnectReason::Shutdown),
                    sent = inbound.send(item) => sent.map_err(|_| DisconnectReason::Shutdown),
                }
            }
        }
    }

    /// How long we may stay silent before pinging.
    ///
    /// Kept under the read timeout so that a remote running the same
    /// configuration sees our ping before its read deadline expires.
    fn ping_after(&self) -> Duration {
        self.config.ping_interval.min(self.config.read_timeout) / 2
    }

    async fn keepalive_loop(&self) -> Option<DisconnectReason> {
        let ping_after = self.ping_after();
        let period = (ping_after / 4).min(self.config.inactivity_timeout / 2);
        let mut ticker = tokio::time::interval(period.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return None,
                _ = ticker.tick() => {}
            }

            let silent = self.stats.since_received();
            if silent >= self.config.inactivity_timeout {
                warn!(peer = %self.id, silent = ?silent, "Peer inactive");
                return Some(DisconnectReason::Inactive);
            }
            if self.stats.since_sent() >= ping_after {
                if let Err(e) = self.send(Message::empty(MSG_PING)).await {
                    return Some(DisconnectReason::from_error(&e));
                }
            }
        }
    }
}
