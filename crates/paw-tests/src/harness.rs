//! Test harness for integration tests.
//!
//! Provides loopback nodes, fake seed servers, endpoints that accept a
//! transport but never speak, and a reputation oracle tests can steer.

use async_trait::async_trait;
use parking_lot::Mutex;
use paw_p2p::{
    discovery, AllowAll, ConnectionManager, DisconnectReason, DiscoveryPool, NetworkConfig, NetworkEvent,
    PeerAddress, PeerId, PeerInfo, PeerSource, ReputationEvent, ReputationOracle, ReputationVerdict,
};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::debug;

/// Chain identifier shared by harness nodes.
pub const TEST_CHAIN: &str = "paw-test";

/// How long helpers wait for an expected event.
pub const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

/// Configuration with timeouts short enough for tests.
pub fn test_config(node_id: &str) -> NetworkConfig {
    let mut config = NetworkConfig::new(TEST_CHAIN, node_id);
    config.dial_timeout = Duration::from_secs(1);
    config.handshake_timeout = Duration::from_secs(1);
    config.read_timeout = Duration::from_secs(2);
    config.write_timeout = Duration::from_secs(1);
    config.maintenance_interval = Duration::from_millis(100);
    config
}

/// A running manager bound to an ephemeral loopback port.
pub struct TestNode {
    pub manager: ConnectionManager,
    pub events: mpsc::Receiver<NetworkEvent>,
    /// Address other nodes dial to reach this one.
    pub address: PeerAddress,
}

impl TestNode {
    /// Start a node that admits everyone.
    pub async fn spawn(config: NetworkConfig) -> Self {
        Self::spawn_with(config, Arc::new(AllowAll)).await
    }

    /// Start a node with a custom reputation oracle.
    pub async fn spawn_with(config: NetworkConfig, reputation: Arc<dyn ReputationOracle>) -> Self {
        let node_id = config.node_id.clone();
        let (manager, events) = ConnectionManager::new(config, reputation).expect("Failed to create manager");
        manager.start().expect("Failed to start manager");

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind listener");
        let port = listener.local_addr().expect("Listener has no address").port();
        manager.spawn_listener(listener);
        debug!(node = %node_id, port, "Test node started");

        Self {
            manager,
            events,
            address: PeerAddress::new(node_id, "127.0.0.1", port).expect("Invalid test address"),
        }
    }

    pub fn id(&self) -> &PeerId {
        self.address.id()
    }

    /// Wait for the first event matching `pred`, skipping the rest.
    pub async fn wait_for(&mut self, mut pred: impl FnMut(&NetworkEvent) -> bool) -> NetworkEvent {
        tokio::time::timeout(EVENT_TIMEOUT, async {
            loop {
                let event = self.events.recv().await.expect("Event channel closed");
                if pred(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("Timed out waiting for event")
    }

    /// Wait until `peer` is connected.
    pub async fn wait_connected(&mut self, peer: &PeerId) {
        let peer = peer.clone();
        self.wait_for(move |e| matches!(e, NetworkEvent::PeerConnected { peer_id, .. } if *peer_id == peer))
            .await;
    }

    /// Collect every event arriving within `window`.
    pub async fn drain_for(&mut self, window: Duration) -> Vec<NetworkEvent> {
        let mut seen = Vec::new();
        let deadline = tokio::time::Instant::now() + window;
        while let Ok(Some(event)) = tokio::time::timeout_at(deadline, self.events.recv()).await {
            seen.push(event);
        }
        seen
    }

    pub async fn shutdown(self) {
        self.manager.shutdown().await;
    }
}

/// A seed server answering crawls with a fixed peer list.
pub struct FakeSeed {
    /// `host:port` for a node's `seeds` list.
    pub endpoint: String,
    cancel: CancellationToken,
}

impl FakeSeed {
    pub async fn spawn(peers: Vec<PeerAddress>) -> Self {
        let pool = Arc::new(DiscoveryPool::new(peers.len().max(1)));
        for peer in peers {
            pool.insert(PeerInfo::new(peer, PeerSource::Manual));
        }
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind seed listener");
        let endpoint = listener.local_addr().expect("Seed has no address").to_string();
        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();
        tracker.spawn(discovery::serve_seed_requests(
            listener,
            pool,
            cancel.clone(),
            tracker.clone(),
            Duration::from_secs(1),
        ));
        Self { endpoint, cancel }
    }
}

impl Drop for FakeSeed {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// A listener that completes TCP connects but never accepts or answers.
pub struct BlackHole {
    _listener: TcpListener,
    pub address: PeerAddress,
}

impl BlackHole {
    pub async fn spawn(id: &str) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind black hole");
        let port = listener.local_addr().expect("Black hole has no address").port();
        Self {
            _listener: listener,
            address: PeerAddress::new(id, "127.0.0.1", port).expect("Invalid black hole address"),
        }
    }
}

/// Reputation oracle whose verdicts tests flip at runtime.
#[derive(Default)]
pub struct ScriptedOracle {
    rejected: Mutex<HashSet<PeerId>>,
    banned: Mutex<HashSet<PeerId>>,
    /// Every disconnect the manager reported, in order.
    disconnects: Mutex<Vec<(PeerId, DisconnectReason)>>,
}

impl ScriptedOracle {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn reject(&self, peer: &PeerId) {
        self.rejected.lock().insert(peer.clone());
    }

    pub fn ban(&self, peer: &PeerId) {
        self.banned.lock().insert(peer.clone());
    }

    pub fn disconnects(&self) -> Vec<(PeerId, DisconnectReason)> {
        self.disconnects.lock().clone()
    }
}

#[async_trait]
impl ReputationOracle for ScriptedOracle {
    async fn check(&self, peer: &PeerId, _addr: SocketAddr) -> ReputationVerdict {
        if self.banned.lock().contains(peer) {
            return ReputationVerdict::Banned;
        }
        if self.rejected.lock().contains(peer) {
            return ReputationVerdict::Reject("scripted".into());
        }
        ReputationVerdict::Admit
    }

    async fn record(&self, event: ReputationEvent) {
        if let ReputationEvent::Disconnected { peer, reason } = event {
            self.disconnects.lock().push((peer, reason));
        }
    }

    fn is_banned(&self, peer: &PeerId) -> bool {
        self.banned.lock().contains(peer)
    }
}
