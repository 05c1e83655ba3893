//! Peer discovery mechanisms.
//!
//! Candidates come from two places: a seed crawl over a dedicated one-shot TCP
//! exchange, and peer exchange with connected peers over the framed
//! connection. Both use the same peer-list encoding:
//!
//! ```text
//! [u16 count] then count x [u8 id_len][id][u16 port][u8 ip_len][ip]
//! ```
//!
//! Discovery never opens peer connections itself; it fills a pool that the
//! connection manager draws dial candidates from.

use crate::peer::{endpoint, parse_host_port, MAX_HOST_LEN, MAX_PEER_ID_LEN};
use crate::{NetworkError, NetworkResult, PeerAddress, PeerId, PeerInfo, PeerSource};
use bytes::{BufMut, Bytes, BytesMut};
use dashmap::DashMap;
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, instrument, warn};

/// The single-byte seed request.
pub const DISCOVERY_REQUEST: u8 = 0x01;

/// Maximum entries accepted from, or sent in, one peer list.
pub const MAX_DISCOVERY_PEERS: usize = 1000;

/// Encode a peer list. Entries past [`MAX_DISCOVERY_PEERS`] are not sent.
pub fn encode_peer_list(peers: &[PeerAddress]) -> Bytes {
    let peers = &peers[..peers.len().min(MAX_DISCOVERY_PEERS)];
    let size = 2 + peers
        .iter()
        .map(|p| 1 + p.id().as_bytes().len() + 2 + 1 + p.host().len())
        .sum::<usize>();

    let mut buf = BytesMut::with_capacity(size);
    buf.put_u16(peers.len() as u16);
    for peer in peers {
        // PeerAddress construction bounds both lengths well under u8::MAX.
        buf.put_u8(peer.id().as_bytes().len() as u8);
        buf.put_slice(peer.id().as_bytes());
        buf.put_u16(peer.port());
        buf.put_u8(peer.host().len() as u8);
        buf.put_slice(peer.host().as_bytes());
    }
    buf.freeze()
}

async fn read_field<R: AsyncRead + Unpin>(reader: &mut R, len: usize) -> std::io::Result<Vec<u8>> {
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(buf)
}

/// Read one entry. `Ok(None)` means the entry was consumed but dropped.
async fn read_entry<R: AsyncRead + Unpin>(reader: &mut R) -> std::io::Result<Option<PeerAddress>> {
    let id_len = reader.read_u8().await? as usize;
    let id = read_field(reader, id_len).await?;
    let port = reader.read_u16().await?;
    let ip_len = reader.read_u8().await? as usize;
    let ip = read_field(reader, ip_len).await?;

    if id_len == 0 || id_len > MAX_PEER_ID_LEN || ip_len == 0 || ip_len > MAX_HOST_LEN || port == 0 {
        debug!(id_len, ip_len, port, "Dropping out-of-bounds discovery entry");
        return Ok(None);
    }
    let (Ok(id), Ok(ip)) = (String::from_utf8(id), String::from_utf8(ip)) else {
        debug!("Dropping non-UTF-8 discovery entry");
        return Ok(None);
    };
    Ok(PeerAddress::new(id, ip, port).ok())
}

/// Read a peer list from `reader`.
///
/// Invalid entries are skipped individually. A list that ends early keeps the
/// entries read before the cut; only a missing count is an error.
pub async fn read_peer_list<R: AsyncRead + Unpin>(reader: &mut R) -> NetworkResult<Vec<PeerAddress>> {
    let count = reader.read_u16().await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            NetworkError::InvalidFormat("peer list missing count".into())
        } else {
            NetworkError::Io(e)
        }
    })? as usize;

    if count > MAX_DISCOVERY_PEERS {
        warn!(count, max = MAX_DISCOVERY_PEERS, "Peer list too long, reading first entries only");
    }
    let count = count.min(MAX_DISCOVERY_PEERS);

    let mut peers = Vec::with_capacity(count);
    for index in 0..count {
        match read_entry(reader).await {
            Ok(Some(peer)) => peers.push(peer),
            Ok(None) => {}
            Err(e) => {
                debug!(index, count, error = %e, "Peer list truncated");
                break;
            }
        }
    }
    Ok(peers)
}

/// Decode a peer list carried in a message payload.
pub async fn decode_peer_list(payload: &[u8]) -> NetworkResult<Vec<PeerAddress>> {
    let mut reader = payload;
    read_peer_list(&mut reader).await
}

/// Bounded cache of discovered candidates, keyed by identifier.
pub struct DiscoveryPool {
    entries: DashMap<PeerId, PeerInfo>,
    capacity: usize,
}

impl DiscoveryPool {
    /// Create a pool holding at most `capacity` candidates.
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: DashMap::new(),
            capacity,
        }
    }

    /// Insert or refresh a candidate. The most recently seen record wins.
    ///
    /// Returns `true` if the identifier was not known before.
    pub fn insert(&self, info: PeerInfo) -> bool {
        let is_new = match self.entries.get_mut(info.id()) {
            Some(mut existing) => {
                if info.last_seen >= existing.last_seen {
                    *existing = info;
                }
                false
            }
            None => {
                self.entries.insert(info.id().clone(), info);
                true
            }
        };
        self.prune();
        is_new
    }

    /// Merge a batch of addresses, skipping `local` and anything `is_banned` flags.
    ///
    /// Returns the number of previously unknown identifiers added.
    pub fn merge(
        &self,
        addrs: Vec<PeerAddress>,
        source: PeerSource,
        local: &PeerId,
        is_banned: &(dyn Fn(&PeerId) -> bool + Sync),
    ) -> usize {
        let mut added = 0;
        for addr in addrs {
            if addr.id() == local || is_banned(addr.id()) {
                continue;
            }
            if self.insert(PeerInfo::new(addr, source)) {
                added += 1;
            }
        }
        added
    }

    /// Drop the oldest entries until the pool is within capacity.
    fn prune(&self) {
        let excess = self.entries.len().saturating_sub(self.capacity);
        if excess == 0 {
            return;
        }
        let mut by_age: Vec<(PeerId, Instant)> = self
            .entries
            .iter()
            .map(|e| (e.key().clone(), e.value().last_seen))
            .collect();
        by_age.sort_by_key(|(_, seen)| *seen);
        for (id, _) in by_age.into_iter().take(excess) {
            self.entries.remove(&id);
        }
    }

    pub fn remove(&self, id: &PeerId) -> Option<PeerInfo> {
        self.entries.remove(id).map(|(_, info)| info)
    }

    pub fn contains(&self, id: &PeerId) -> bool {
        self.entries.contains_key(id)
    }

    pub fn get(&self, id: &PeerId) -> Option<PeerInfo> {
        self.entries.get(id).map(|e| e.value().clone())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Up to `limit` candidates not rejected by `skip`, most recently seen first.
    pub fn candidates(&self, limit: usize, skip: &dyn Fn(&PeerId) -> bool) -> Vec<PeerAddress> {
        let mut infos: Vec<PeerInfo> = self
            .entries
            .iter()
            .filter(|e| !skip(e.key()))
            .map(|e| e.value().clone())
            .collect();
        infos.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));
        infos.into_iter().take(limit).map(|i| i.address).collect()
    }

    /// The freshest `limit` entries.
    pub fn freshest(&self, limit: usize) -> Vec<PeerAddress> {
        self.candidates(limit, &|_| false)
    }

    /// A random sample of up to `limit` entries.
    pub fn sample(&self, limit: usize) -> Vec<PeerAddress> {
        let mut all: Vec<PeerAddress> = self.entries.iter().map(|e| e.value().address.clone()).collect();
        all.shuffle(&mut rand::thread_rng());
        all.truncate(limit);
        all
    }
}

/// Seed crawler.
pub struct PeerDiscovery {
    /// Parsed seed endpoints.
    seeds: Vec<(String, u16)>,
    /// Shared candidate pool.
    pool: Arc<DiscoveryPool>,
    /// Local identifier, never merged.
    local_id: PeerId,
    /// Transport dial deadline.
    dial_timeout: Duration,
    /// Deadline for the whole request/response exchange.
    read_timeout: Duration,
    /// Minimum spacing between repeated crawls.
    crawl_interval: Duration,
    /// When the seeds were last crawled.
    last_crawl: Mutex<Option<Instant>>,
}

impl PeerDiscovery {
    /// Create a crawler over `seeds` (`host:port`).
    pub fn new(
        seeds: &[String],
        pool: Arc<DiscoveryPool>,
        local_id: PeerId,
        dial_timeout: Duration,
        read_timeout: Duration,
        crawl_interval: Duration,
    ) -> NetworkResult<Self> {
        let seeds = seeds
            .iter()
            .map(|s| parse_host_port(s))
            .collect::<NetworkResult<Vec<_>>>()?;
        Ok(Self {
            seeds,
            pool,
            local_id,
            dial_timeout,
            read_timeout,
            crawl_interval,
            last_crawl: Mutex::new(None),
        })
    }

    pub fn pool(&self) -> &Arc<DiscoveryPool> {
        &self.pool
    }

    pub fn has_seeds(&self) -> bool {
        !self.seeds.is_empty()
    }

    /// Crawl every seed and merge the results. Returns the number of new candidates.
    pub async fn crawl_seeds(&self, is_banned: &(dyn Fn(&PeerId) -> bool + Sync)) -> usize {
        *self.last_crawl.lock() = Some(Instant::now());

        let mut added = 0;
        for (host, port) in &self.seeds {
            let seed = endpoint(host, *port);
            match crawl_seed(&seed, self.dial_timeout, self.read_timeout).await {
                Ok(peers) => {
                    let count = peers.len();
                    let new = self.pool.merge(peers, PeerSource::Seed, &self.local_id, is_banned);
                    info!(seed = %seed, count, new, "Crawled seed");
                    added += new;
                }
                Err(e) => {
                    warn!(seed = %seed, error = %e, "Seed crawl failed");
                }
            }
        }
        added
    }

    /// Re-crawl seeds when the pool is empty and outbound connections are short,
    /// at most once per crawl interval. Returns whether a crawl ran.
    pub async fn maybe_recrawl(
        &self,
        outbound: usize,
        min_outbound: usize,
        is_banned: &(dyn Fn(&PeerId) -> bool + Sync),
    ) -> bool {
        if self.seeds.is_empty() || !self.pool.is_empty() || outbound >= min_outbound {
            return false;
        }
        let due = match *self.last_crawl.lock() {
            Some(last) => last.elapsed() >= self.crawl_interval,
            None => true,
        };
        if !due {
            return false;
        }
        debug!(outbound, min_outbound, "Candidate pool empty, re-crawling seeds");
        self.crawl_seeds(is_banned).await;
        true
    }
}

/// Fetch the peer list from one seed.
#[instrument(skip(dial_timeout, read_timeout))]
pub async fn crawl_seed(
    seed: &str,
    dial_timeout: Duration,
    read_timeout: Duration,
) -> NetworkResult<Vec<PeerAddress>> {
    let mut stream = timeout(dial_timeout, TcpStream::connect(seed))
        .await
        .map_err(|_| NetworkError::DialTimeout)??;

    let exchange = async {
        stream.write_all(&[DISCOVERY_REQUEST]).await?;
        stream.flush().await?;
        read_peer_list(&mut stream).await
    };
    timeout(read_timeout, exchange)
        .await
        .map_err(|_| NetworkError::ReadTimeout)?
}

/// Answer seed requests from `pool` until `cancel` fires.
///
/// Each request runs on `tracker` and is dropped, socket included, when
/// `cancel` fires.
pub async fn serve_seed_requests(
    listener: TcpListener,
    pool: Arc<DiscoveryPool>,
    cancel: CancellationToken,
    tracker: TaskTracker,
    request_timeout: Duration,
) {
    loop {
        let (stream, addr) = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "Seed accept failed");
                    continue;
                }
            },
        };

        let pool = pool.clone();
        let cancel = cancel.clone();
        tracker.spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                result = answer_seed_request(stream, &pool, request_timeout) => {
                    if let Err(e) = result {
                        debug!(addr = %addr, error = %e, "Seed request failed");
                    }
                }
            }
        });
    }
    debug!("Seed responder stopped");
}

async fn answer_seed_request(
    mut stream: TcpStream,
    pool: &DiscoveryPool,
    request_timeout: Duration,
) -> NetworkResult<()> {
    let exchange = async {
        let request = stream.read_u8().await?;
        if request != DISCOVERY_REQUEST {
            return Err(NetworkError::InvalidFormat(format!(
                "unknown discovery request 0x{:02x}",
                request
            )));
        }
        let list = encode_peer_list(&pool.freshest(MAX_DISCOVERY_PEERS));
        stream.write_all(&list).await?;
        stream.shutdown().await?;
        Ok::<(), NetworkError>(())
    };
    timeout(request_timeout, exchange)
        .await
        .map_err(|_| NetworkError::ReadTimeout)?
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(id: &str, port: u16) -> PeerAddress {
        PeerAddress::new(id, "127.0.0.1", port).unwrap()
    }

    fn raw_entry(buf: &mut Vec<u8>, id: &[u8], port: u16, ip: &[u8]) {
        buf.push(id.len() as u8);
        buf.extend_from_slice(id);
        buf.extend_from_slice(&port.to_be_bytes());
        buf.push(ip.len() as u8);
        buf.extend_from_slice(ip);
    }

    #[tokio::test]
    async fn test_peer_list_roundtrip() {
        let peers = vec![addr("a", 1), addr("b", 2)];
        let bytes = encode_peer_list(&peers);
        assert_eq!(&bytes[..2], &[0, 2]);
        assert_eq!(decode_peer_list(&bytes).await.unwrap(), peers);
    }

    #[tokio::test]
    async fn test_invalid_entries_dropped_individually() {
        let mut buf = vec![0, 5];
        raw_entry(&mut buf, b"good-1", 100, b"10.0.0.1");
        raw_entry(&mut buf, &[b'x'; 129], 100, b"10.0.0.2");
        raw_entry(&mut buf, b"zero-port", 0, b"10.0.0.3");
        raw_entry(&mut buf, &[0xff, 0xfe], 100, b"10.0.0.4");
        raw_entry(&mut buf, b"good-2", 200, b"10.0.0.5");

        let peers = decode_peer_list(&buf).await.unwrap();
        let ids: Vec<_> = peers.iter().map(|p| p.id().as_str().to_string()).collect();
        assert_eq!(ids, vec!["good-1", "good-2"]);
    }

    #[tokio::test]
    async fn test_long_host_dropped() {
        let mut buf = vec![0, 2];
        raw_entry(&mut buf, b"a", 1, &[b'h'; 65]);
        raw_entry(&mut buf, b"b", 1, &[b'h'; 64]);
        let peers = decode_peer_list(&buf).await.unwrap();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].id().as_str(), "b");
    }

    #[tokio::test]
    async fn test_count_capped() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&1500u16.to_be_bytes());
        for i in 0..1500 {
            raw_entry(&mut buf, format!("p{}", i).as_bytes(), 1, b"10.0.0.1");
        }
        let peers = decode_peer_list(&buf).await.unwrap();
        assert_eq!(peers.len(), MAX_DISCOVERY_PEERS);
        assert_eq!(peers.last().unwrap().id().as_str(), "p999");
    }

    #[tokio::test]
    async fn test_truncated_keeps_prefix() {
        let mut buf = vec![0, 3];
        raw_entry(&mut buf, b"a", 1, b"10.0.0.1");
        raw_entry(&mut buf, b"b", 2, b"10.0.0.2");
        buf.extend_from_slice(&[5, b'c']);
        let peers = decode_peer_list(&buf).await.unwrap();
        assert_eq!(peers.len(), 2);

        assert!(decode_peer_list(&[0]).await.is_err());
    }

    #[test]
    fn test_pool_most_recent_wins() {
        let pool = DiscoveryPool::new(10);
        let old = PeerInfo::new(addr("a", 1), PeerSource::Seed);
        let mut newer = PeerInfo::new(addr("a", 2), PeerSource::PeerExchange);
        newer.last_seen = old.last_seen + Duration::from_secs(1);

        assert!(pool.insert(newer));
        assert!(!pool.insert(old));
        assert_eq!(pool.get(&PeerId::from("a")).unwrap().address.port(), 2);
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_pool_prunes_oldest() {
        let pool = DiscoveryPool::new(3);
        let base = Instant::now();
        for i in 0..5u64 {
            let mut info = PeerInfo::new(addr(&format!("p{}", i), 1), PeerSource::Seed);
            info.last_seen = base + Duration::from_secs(i);
            pool.insert(info);
        }
        assert_eq!(pool.len(), 3);
        assert!(!pool.contains(&PeerId::from("p0")));
        assert!(!pool.contains(&PeerId::from("p1")));
        let ids: Vec<_> = pool.freshest(10).iter().map(|a| a.id().to_string()).collect();
        assert_eq!(ids, vec!["p4", "p3", "p2"]);
    }

    #[test]
    fn test_merge_skips_local_and_banned() {
        let pool = DiscoveryPool::new(10);
        let local = PeerId::from("me");
        let banned = PeerId::from("bad");
        let added = pool.merge(
            vec![addr("me", 1), addr("bad", 1), addr("ok", 1)],
            PeerSource::PeerExchange,
            &local,
            &|id| *id == banned,
        );
        assert_eq!(added, 1);
        assert!(pool.contains(&PeerId::from("ok")));
        assert!(!pool.contains(&local));
        assert!(!pool.contains(&banned));
    }

    #[tokio::test]
    async fn test_seed_crawl_over_loopback() {
        let pool = Arc::new(DiscoveryPool::new(100));
        for i in 0..3 {
            pool.insert(PeerInfo::new(addr(&format!("s{}", i), 7000 + i), PeerSource::Manual));
        }
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let seed = listener.local_addr().unwrap().to_string();
        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();
        tracker.spawn(serve_seed_requests(
            listener,
            pool.clone(),
            cancel.clone(),
            tracker.clone(),
            Duration::from_secs(1),
        ));

        let target = Arc::new(DiscoveryPool::new(100));
        let discovery = PeerDiscovery::new(
            &[seed],
            target.clone(),
            PeerId::from("s0"),
            Duration::from_secs(1),
            Duration::from_secs(1),
            Duration::from_secs(300),
        )
        .unwrap();
        let added = discovery.crawl_seeds(&|_| false).await;
        assert_eq!(added, 2);
        assert_eq!(target.len(), 2);
        assert_eq!(target.get(&PeerId::from("s1")).unwrap().source, PeerSource::Seed);

        // Pool is non-empty, so no re-crawl.
        assert!(!discovery.maybe_recrawl(0, 10, &|_| false).await);
        cancel.cancel();
        tracker.close();
        tracker.wait().await;
    }

    #[tokio::test]
    async fn test_seed_responder_releases_pending_requests() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let seed = listener.local_addr().unwrap();
        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();
        tracker.spawn(serve_seed_requests(
            listener,
            Arc::new(DiscoveryPool::new(10)),
            cancel.clone(),
            tracker.clone(),
            Duration::from_secs(30),
        ));

        // Connect and never send the request byte.
        let mut client = TcpStream::connect(seed).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        cancel.cancel();
        tracker.close();
        tokio::time::timeout(Duration::from_secs(2), tracker.wait())
            .await
            .expect("request handler outlived cancellation");

        let mut buf = [0u8; 1];
        let read = tokio::time::timeout(Duration::from_secs(2), client.read(&mut buf))
            .await
            .expect("socket still held");
        assert!(matches!(read, Ok(0) | Err(_)));
    }
}
