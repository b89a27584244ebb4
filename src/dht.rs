//! # Kademlia-style Routing
//!
//! A compact Kademlia implementation serving the [`Discovery`] and
//! [`PeerRouting`] seams of the host.
//!
//! ## Key Operations
//!
//! | Operation | Description |
//! |-----------|-------------|
//! | `iterative_find_node(id)` | Peers closest to an identifier |
//! | `provide(key, ttl)` | Register the local peer as a provider of `key` |
//! | `find_providers(key, n)` | Providers of `key`, local store first |
//! | `find_peer(id)` | Addresses of one peer |
//! | `bootstrap(seeds)` | Join the network through known peers |
//!
//! ## Routing Table
//!
//! 256 k-buckets indexed by the XOR distance prefix. A full bucket pings its
//! least recently seen entry before admitting a newcomer; live entries are
//! kept, which favors long-lived peers.
//!
//! ## Provider Records
//!
//! Stored through the [`Datastore`] under `/providers/<hex key>` as a bounded
//! bincode list with wall-clock expiry, so a persistent datastore keeps them
//! across restarts.
//!
//! ## Security
//!
//! - Per-peer insertion rate limiting for peers learned from lookups
//! - A peer can only register itself as a provider
//! - Records whose public key does not derive to their id are ignored

use std::collections::{BinaryHeap, HashSet};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use lru::LruCache;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::config::ConfigError;
use crate::datastore::Datastore;
use crate::identity::{PEER_ID_LEN, PeerId, distance_cmp};
use crate::messages;
use crate::multiaddr::Multiaddr;
use crate::peerstore::PeerRecord;
use crate::protocols::{Discovery, KadRpc, PeerRouting};

pub type Key = [u8; 32];

const KEY_DOMAIN: &[u8] = b"peerweave-kad-key-v1:";

/// Routing key for a human-readable discovery namespace.
pub fn key_for(name: &str) -> Key {
    let mut hasher = blake3::Hasher::new();
    hasher.update(KEY_DOMAIN);
    hasher.update(name.as_bytes());
    *hasher.finalize().as_bytes()
}

// ============================================================================
// Configuration
// ============================================================================

/// Default bucket size and replication factor.
pub const DEFAULT_K: usize = 20;

/// Default lookup concurrency.
pub const DEFAULT_ALPHA: usize = 3;

/// Longest provider TTL granted; longer requests are clamped.
pub const MAX_PROVIDER_TTL: Duration = Duration::from_secs(48 * 60 * 60);

/// Interval between stale-bucket checks.
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(30 * 60);

/// Time allowed for a single routing RPC.
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(3);

/// Overall budget of one iterative lookup.
pub const DEFAULT_LOOKUP_TIMEOUT: Duration = Duration::from_secs(10);

const MAX_LOOKUP_ITERATIONS: usize = 20;

/// Providers kept per key.
/// SECURITY: bounds datastore growth from a single popular key.
const MAX_PROVIDERS_PER_KEY: usize = 64;

/// Maximum routing insertions per peer per rate window.
/// SECURITY: a single peer cannot flood the routing table with (possibly
/// Sybil) peers through lookup responses.
const ROUTING_INSERTION_PER_PEER_LIMIT: usize = 50;

const ROUTING_INSERTION_RATE_WINDOW: Duration = Duration::from_secs(60);

/// Maximum peers tracked by the insertion limiter; LRU evicted.
const MAX_ROUTING_INSERTION_TRACKED_PEERS: usize = 1_000;

#[derive(Clone, Debug)]
pub struct KadConfig {
    pub k: usize,
    pub alpha: usize,
    pub refresh_interval: Duration,
    pub rpc_timeout: Duration,
    pub lookup_timeout: Duration,
}

impl Default for KadConfig {
    fn default() -> Self {
        Self {
            k: DEFAULT_K,
            alpha: DEFAULT_ALPHA,
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
            rpc_timeout: DEFAULT_RPC_TIMEOUT,
            lookup_timeout: DEFAULT_LOOKUP_TIMEOUT,
        }
    }
}

impl KadConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.k == 0 || self.alpha == 0 {
            return Err(ConfigError::Kad("k and alpha must be non-zero".into()));
        }
        if self.alpha > self.k {
            return Err(ConfigError::Kad("alpha must not exceed k".into()));
        }
        if self.refresh_interval.is_zero() {
            return Err(ConfigError::ZeroDuration("kad.refresh_interval"));
        }
        if self.rpc_timeout.is_zero() || self.lookup_timeout.is_zero() {
            return Err(ConfigError::ZeroDuration("kad.rpc_timeout/lookup_timeout"));
        }
        Ok(())
    }
}

// ============================================================================
// Insertion Rate Limiting
// ============================================================================

#[derive(Debug, Clone, Copy)]
struct InsertionBucket {
    tokens: f64,
    last_update: Instant,
}

impl InsertionBucket {
    fn new() -> Self {
        Self {
            tokens: ROUTING_INSERTION_PER_PEER_LIMIT as f64,
            last_update: Instant::now(),
        }
    }

    fn try_consume(&mut self) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_update).as_secs_f64();
        let rate = ROUTING_INSERTION_PER_PEER_LIMIT as f64 / ROUTING_INSERTION_RATE_WINDOW.as_secs_f64();
        self.tokens = (self.tokens + elapsed * rate).min(ROUTING_INSERTION_PER_PEER_LIMIT as f64);
        self.last_update = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

struct InsertionLimiter {
    buckets: LruCache<PeerId, InsertionBucket>,
}

impl InsertionLimiter {
    fn new() -> Self {
        let cap = NonZeroUsize::new(MAX_ROUTING_INSERTION_TRACKED_PEERS).unwrap_or(NonZeroUsize::MIN);
        Self {
            buckets: LruCache::new(cap),
        }
    }

    fn allow(&mut self, from: &PeerId) -> bool {
        self.buckets.get_or_insert_mut(*from, InsertionBucket::new).try_consume()
    }
}

// ============================================================================
// Routing Table (XOR-Metric)
// ============================================================================

#[derive(Debug, Clone)]
struct RoutingBucket {
    /// Least recently seen first.
    peers: Vec<PeerRecord>,
    last_refresh: Instant,
}

enum TouchOutcome {
    Inserted,
    Refreshed,
    Full { newcomer: PeerRecord, oldest: PeerRecord },
}

/// A full bucket waiting on a liveness check of its oldest entry.
#[derive(Clone, Debug)]
struct PendingInsertion {
    bucket: usize,
    oldest: PeerRecord,
    newcomer: PeerRecord,
}

impl RoutingBucket {
    fn new() -> Self {
        Self {
            peers: Vec::new(),
            last_refresh: Instant::now(),
        }
    }

    fn touch(&mut self, record: PeerRecord, k: usize) -> TouchOutcome {
        self.last_refresh = Instant::now();
        if let Some(pos) = self.peers.iter().position(|p| p.peer_id == record.peer_id) {
            let mut existing = self.peers.remove(pos);
            for addr in record.addrs {
                if !existing.addrs.contains(&addr) {
                    existing.addrs.push(addr);
                }
            }
            existing.public_key = existing.public_key.or(record.public_key);
            self.peers.push(existing);
            return TouchOutcome::Refreshed;
        }
        if self.peers.len() < k {
            self.peers.push(record);
            return TouchOutcome::Inserted;
        }
        match self.peers.first() {
            Some(oldest) => TouchOutcome::Full {
                oldest: oldest.clone(),
                newcomer: record,
            },
            None => TouchOutcome::Inserted,
        }
    }

    /// Move an entry to the most-recently-seen end.
    fn refresh(&mut self, id: &PeerId) {
        if let Some(pos) = self.peers.iter().position(|p| &p.peer_id == id) {
            let entry = self.peers.remove(pos);
            self.peers.push(entry);
        }
    }

    fn remove(&mut self, id: &PeerId) -> bool {
        let before = self.peers.len();
        self.peers.retain(|p| &p.peer_id != id);
        self.peers.len() != before
    }
}

fn bucket_index(self_id: &PeerId, other: &PeerId) -> usize {
    let dist = self_id.xor_distance(other);
    for (byte_idx, byte) in dist.iter().enumerate() {
        if *byte != 0 {
            return byte_idx * 8 + byte.leading_zeros() as usize;
        }
    }
    PEER_ID_LEN * 8 - 1
}

/// A random identifier that falls into `bucket_idx` relative to `self_id`.
fn random_id_for_bucket(self_id: &PeerId, bucket_idx: usize) -> PeerId {
    let mut distance = *PeerId::random().as_bytes();
    let byte_idx = bucket_idx / 8;
    let bit_pos = bucket_idx % 8;

    for byte in distance.iter_mut().take(byte_idx) {
        *byte = 0;
    }
    let target_bit = 0x80u8 >> bit_pos;
    distance[byte_idx] = target_bit | (distance[byte_idx] & target_bit.wrapping_sub(1));

    let self_bytes = self_id.as_bytes();
    let mut target = [0u8; PEER_ID_LEN];
    for i in 0..PEER_ID_LEN {
        target[i] = self_bytes[i] ^ distance[i];
    }
    PeerId::from_bytes(target)
}

fn sort_by_distance(records: &mut [PeerRecord], target: &PeerId) {
    records.sort_by(|a, b| distance_cmp(&a.peer_id.xor_distance(target), &b.peer_id.xor_distance(target)));
}

#[derive(Debug)]
pub struct RoutingTable {
    self_id: PeerId,
    k: usize,
    buckets: Vec<RoutingBucket>,
}

impl RoutingTable {
    pub fn new(self_id: PeerId, k: usize) -> Self {
        Self {
            self_id,
            k,
            buckets: (0..PEER_ID_LEN * 8).map(|_| RoutingBucket::new()).collect(),
        }
    }

    #[cfg(test)]
    fn update(&mut self, record: PeerRecord) {
        let _ = self.update_with_pending(record);
    }

    fn update_with_pending(&mut self, record: PeerRecord) -> Option<PendingInsertion> {
        if record.peer_id == self.self_id || !record.key_matches() {
            return None;
        }
        let idx = bucket_index(&self.self_id, &record.peer_id);
        match self.buckets[idx].touch(record, self.k) {
            TouchOutcome::Inserted | TouchOutcome::Refreshed => None,
            TouchOutcome::Full { newcomer, oldest } => Some(PendingInsertion {
                bucket: idx,
                oldest,
                newcomer,
            }),
        }
    }

    pub fn closest(&self, target: &PeerId, k: usize) -> Vec<PeerRecord> {
        if k == 0 {
            return Vec::new();
        }

        struct ByDistance {
            dist: [u8; PEER_ID_LEN],
            record: PeerRecord,
        }

        impl PartialEq for ByDistance {
            fn eq(&self, other: &Self) -> bool {
                self.dist == other.dist
            }
        }
        impl Eq for ByDistance {}
        impl Ord for ByDistance {
            fn cmp(&self, other: &Self) -> std::cmp::Ordering {
                distance_cmp(&self.dist, &other.dist)
            }
        }
        impl PartialOrd for ByDistance {
            fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
                Some(self.cmp(other))
            }
        }

        // Max-heap of the k best so far; the root is the worst of them.
        let mut heap: BinaryHeap<ByDistance> = BinaryHeap::with_capacity(k + 1);
        for record in self.buckets.iter().flat_map(|b| b.peers.iter()) {
            let dist = record.peer_id.xor_distance(target);
            if heap.len() < k {
                heap.push(ByDistance { dist, record: record.clone() });
            } else if let Some(worst) = heap.peek()
                && distance_cmp(&dist, &worst.dist) == std::cmp::Ordering::Less
            {
                heap.push(ByDistance { dist, record: record.clone() });
                heap.pop();
            }
        }
        heap.into_sorted_vec().into_iter().map(|e| e.record).collect()
    }

    fn apply_ping_result(&mut self, pending: PendingInsertion, oldest_alive: bool) {
        let bucket = &mut self.buckets[pending.bucket];
        if oldest_alive {
            bucket.refresh(&pending.oldest.peer_id);
            return;
        }
        bucket.remove(&pending.oldest.peer_id);
        if bucket.peers.iter().any(|p| p.peer_id == pending.newcomer.peer_id) {
            return;
        }
        if bucket.peers.len() < self.k {
            bucket.peers.push(pending.newcomer);
        }
    }

    fn remove(&mut self, id: &PeerId) -> bool {
        if *id == self.self_id {
            return false;
        }
        self.buckets[bucket_index(&self.self_id, id)].remove(id)
    }

    fn stale_bucket_indices(&self, threshold: Duration) -> Vec<usize> {
        self.buckets
            .iter()
            .enumerate()
            .filter(|(_, b)| !b.peers.is_empty() && b.last_refresh.elapsed() > threshold)
            .map(|(idx, _)| idx)
            .collect()
    }

    fn mark_bucket_refreshed(&mut self, idx: usize) {
        if let Some(bucket) = self.buckets.get_mut(idx) {
            bucket.last_refresh = Instant::now();
        }
    }

    pub fn lookup(&self, id: &PeerId) -> Option<PeerRecord> {
        if *id == self.self_id {
            return None;
        }
        self.buckets[bucket_index(&self.self_id, id)]
            .peers
            .iter()
            .find(|p| p.peer_id == *id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.peers.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ============================================================================
// Provider Store
// ============================================================================

#[derive(Clone, Debug, Serialize, Deserialize)]
struct StoredProvider {
    record: PeerRecord,
    /// Milliseconds since the Unix epoch.
    expires_at_ms: u64,
}

fn unix_millis(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Provider records persisted through a [`Datastore`].
pub struct ProviderStore {
    datastore: Arc<dyn Datastore>,
}

impl ProviderStore {
    pub fn new(datastore: Arc<dyn Datastore>) -> Self {
        Self { datastore }
    }

    fn datastore_key(key: &Key) -> Vec<u8> {
        format!("/providers/{}", hex::encode(key)).into_bytes()
    }

    fn load(&self, key: &Key) -> Vec<StoredProvider> {
        match self.datastore.get(&Self::datastore_key(key)) {
            Ok(Some(bytes)) => messages::deserialize_bounded(&bytes).unwrap_or_else(|e| {
                warn!(key = %hex::encode(&key[..8]), error = %e, "discarding corrupt provider record");
                Vec::new()
            }),
            Ok(None) => Vec::new(),
            Err(e) => {
                warn!(error = %e, "provider load failed");
                Vec::new()
            }
        }
    }

    fn save(&self, key: &Key, providers: &[StoredProvider]) -> Result<()> {
        let dkey = Self::datastore_key(key);
        if providers.is_empty() {
            self.datastore.delete(&dkey)?;
        } else {
            self.datastore.put(&dkey, &messages::serialize(&providers)?)?;
        }
        Ok(())
    }

    /// Insert or refresh a provider; returns the TTL granted.
    pub fn add(&self, key: &Key, record: PeerRecord, ttl: Duration) -> Result<Duration> {
        let ttl = ttl.min(MAX_PROVIDER_TTL);
        let now = SystemTime::now();
        let expires_at_ms = unix_millis(now + ttl);
        let now_ms = unix_millis(now);

        let mut providers = self.load(key);
        providers.retain(|p| p.expires_at_ms > now_ms && p.record.peer_id != record.peer_id);
        providers.push(StoredProvider { record, expires_at_ms });
        if providers.len() > MAX_PROVIDERS_PER_KEY {
            providers.sort_by_key(|p| std::cmp::Reverse(p.expires_at_ms));
            providers.truncate(MAX_PROVIDERS_PER_KEY);
        }
        self.save(key, &providers)?;
        Ok(ttl)
    }

    /// Live providers; expired entries are dropped from the datastore.
    pub fn get(&self, key: &Key) -> Vec<PeerRecord> {
        let now_ms = unix_millis(SystemTime::now());
        let providers = self.load(key);
        let total = providers.len();
        let live: Vec<StoredProvider> = providers.into_iter().filter(|p| p.expires_at_ms > now_ms).collect();
        if live.len() != total
            && let Err(e) = self.save(key, &live)
        {
            debug!(error = %e, "failed to prune expired providers");
        }
        live.into_iter().map(|p| p.record).collect()
    }
}

// ============================================================================
// Node Handle & Actor
// ============================================================================

pub struct DhtNode<N: KadRpc> {
    cmd_tx: mpsc::Sender<Command>,
    id: PeerId,
    local_addrs: Arc<RwLock<Vec<Multiaddr>>>,
    network: Arc<N>,
    config: KadConfig,
    cancel: CancellationToken,
}

impl<N: KadRpc> Clone for DhtNode<N> {
    fn clone(&self) -> Self {
        Self {
            cmd_tx: self.cmd_tx.clone(),
            id: self.id,
            local_addrs: self.local_addrs.clone(),
            network: self.network.clone(),
            config: self.config.clone(),
            cancel: self.cancel.clone(),
        }
    }
}

enum Command {
    ObservePeer(PeerRecord),
    ObservePeerFrom(PeerRecord, PeerId, oneshot::Sender<bool>),
    RemovePeer(PeerId),
    Closest(PeerId, usize, oneshot::Sender<Vec<PeerRecord>>),
    Lookup(PeerId, oneshot::Sender<Option<PeerRecord>>),
    TableSize(oneshot::Sender<usize>),

    HandleFindNode(PeerRecord, PeerId, oneshot::Sender<Vec<PeerRecord>>),
    HandleGetProviders(PeerRecord, Key, oneshot::Sender<(Vec<PeerRecord>, Vec<PeerRecord>)>),
    HandleAddProvider(PeerRecord, Key, PeerRecord, Duration, oneshot::Sender<Result<Duration>>),
    LocalProviders(Key, oneshot::Sender<Vec<PeerRecord>>),

    StaleBuckets(Duration, oneshot::Sender<Vec<usize>>),
    MarkBucketRefreshed(usize),
    ApplyPingResult(PendingInsertion, bool),
}

struct DhtActor<N: KadRpc> {
    routing: RoutingTable,
    providers: ProviderStore,
    limiter: InsertionLimiter,
    k: usize,
    cmd_rx: mpsc::Receiver<Command>,
    cmd_tx: mpsc::Sender<Command>,
    network: Arc<N>,
    id: PeerId,
    cancel: CancellationToken,
}

/// What an iterative lookup asks each peer.
#[derive(Clone, Copy)]
enum LookupMode {
    Nodes,
    Providers { key: Key, want: usize },
}

struct LookupResult {
    closest: Vec<PeerRecord>,
    providers: Vec<PeerRecord>,
}

impl<N: KadRpc> DhtNode<N> {
    pub fn new(
        id: PeerId,
        network: Arc<N>,
        datastore: Arc<dyn Datastore>,
        config: KadConfig,
        cancel: CancellationToken,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(256);

        let actor = DhtActor {
            routing: RoutingTable::new(id, config.k),
            providers: ProviderStore::new(datastore),
            limiter: InsertionLimiter::new(),
            k: config.k,
            cmd_rx,
            cmd_tx: cmd_tx.clone(),
            network: network.clone(),
            id,
            cancel: cancel.clone(),
        };
        tokio::spawn(actor.run());

        let node = Self {
            cmd_tx,
            id,
            local_addrs: Arc::new(RwLock::new(Vec::new())),
            network,
            config,
            cancel,
        };
        node.spawn_periodic_bucket_refresh();
        node
    }

    pub fn peer_id(&self) -> PeerId {
        self.id
    }

    /// Addresses advertised in provider records for the local peer.
    pub fn set_local_addrs(&self, addrs: Vec<Multiaddr>) {
        *self.local_addrs.write() = addrs;
    }

    fn local_record(&self) -> PeerRecord {
        PeerRecord::new(self.id, self.local_addrs.read().clone())
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(build(tx))
            .await
            .map_err(|_| anyhow!("dht actor closed"))?;
        rx.await.map_err(|_| anyhow!("dht actor closed"))
    }

    /// Add a peer whose identity was verified by a direct connection.
    pub async fn observe_peer(&self, record: PeerRecord) {
        let _ = self.cmd_tx.send(Command::ObservePeer(record)).await;
    }

    /// Add a peer learned from `from`, subject to per-source rate limiting.
    pub async fn observe_peer_from(&self, record: PeerRecord, from: PeerId) -> bool {
        self.request(|tx| Command::ObservePeerFrom(record, from, tx))
            .await
            .unwrap_or(false)
    }

    pub async fn remove_peer(&self, peer: PeerId) {
        let _ = self.cmd_tx.send(Command::RemovePeer(peer)).await;
    }

    pub async fn routing_table_size(&self) -> usize {
        self.request(Command::TableSize).await.unwrap_or(0)
    }

    pub async fn handle_find_node(&self, from: PeerRecord, target: PeerId) -> Vec<PeerRecord> {
        self.request(|tx| Command::HandleFindNode(from, target, tx))
            .await
            .unwrap_or_default()
    }

    pub async fn handle_get_providers(&self, from: PeerRecord, key: Key) -> (Vec<PeerRecord>, Vec<PeerRecord>) {
        self.request(|tx| Command::HandleGetProviders(from, key, tx))
            .await
            .unwrap_or_default()
    }

    pub async fn handle_add_provider(&self, from: PeerRecord, key: Key, provider: PeerRecord) -> Result<Duration> {
        self.request(|tx| Command::HandleAddProvider(from, key, provider, MAX_PROVIDER_TTL, tx))
            .await?
    }

    fn spawn_periodic_bucket_refresh(&self) {
        let node = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(node.config.refresh_interval);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = node.cancel.cancelled() => break,
                    _ = interval.tick() => {}
                }
                let Ok(stale) = node
                    .request(|tx| Command::StaleBuckets(node.config.refresh_interval, tx))
                    .await
                else {
                    break;
                };
                if stale.is_empty() {
                    continue;
                }
                debug!(count = stale.len(), "refreshing stale routing buckets");
                for idx in stale {
                    let target = random_id_for_bucket(&node.id, idx);
                    if let Err(e) = node.iterative_find_node(target).await {
                        debug!(bucket = idx, error = %e, "bucket refresh lookup failed");
                    }
                    let _ = node.cmd_tx.send(Command::MarkBucketRefreshed(idx)).await;
                }
            }
        });
    }

    pub async fn iterative_find_node(&self, target: PeerId) -> Result<Vec<PeerRecord>> {
        Ok(self.lookup(target, LookupMode::Nodes, Vec::new()).await?.closest)
    }

    /// Join the network: seed the routing table and look up our own id.
    pub async fn bootstrap(&self, seeds: Vec<PeerRecord>) -> Result<Vec<PeerRecord>> {
        if seeds.is_empty() {
            return Err(anyhow!("bootstrap requires at least one seed"));
        }
        let found = self.lookup(self.id, LookupMode::Nodes, seeds).await?.closest;
        debug!(found = found.len(), "bootstrap lookup complete");
        Ok(found)
    }

    /// Register the local peer as provider of `key` locally and on the `k`
    /// closest peers. Returns the TTL granted.
    pub async fn provide(&self, key: Key, ttl: Duration) -> Result<Duration> {
        let me = self.local_record();
        let granted = self
            .request(|tx| Command::HandleAddProvider(me.clone(), key, me.clone(), ttl, tx))
            .await??;

        let closest = self.iterative_find_node(PeerId::from_bytes(key)).await?;
        let mut join_set = JoinSet::new();
        for peer in closest {
            let net = self.network.clone();
            let me = me.clone();
            let timeout = self.config.rpc_timeout;
            join_set.spawn(async move {
                let result = tokio::time::timeout(timeout, net.add_provider(&peer, key, me)).await;
                (peer.peer_id, matches!(result, Ok(Ok(()))))
            });
        }
        let mut stored = 0;
        while let Some(joined) = join_set.join_next().await {
            if let Ok((peer, ok)) = joined {
                if ok {
                    stored += 1;
                } else {
                    trace!(peer = %peer, "add_provider failed");
                }
            }
        }
        debug!(key = %hex::encode(&key[..8]), remote = stored, "provider record published");
        Ok(granted)
    }

    pub async fn find_providers(&self, key: Key, limit: usize) -> Result<Vec<PeerRecord>> {
        let mut found: Vec<PeerRecord> = self
            .request(|tx| Command::LocalProviders(key, tx))
            .await?
            .into_iter()
            .filter(|p| p.peer_id != self.id)
            .collect();
        if found.len() >= limit {
            found.truncate(limit);
            return Ok(found);
        }

        let result = self
            .lookup(PeerId::from_bytes(key), LookupMode::Providers { key, want: limit }, Vec::new())
            .await?;
        for provider in result.providers {
            if provider.peer_id != self.id && !found.iter().any(|p| p.peer_id == provider.peer_id) {
                found.push(provider);
            }
        }
        found.truncate(limit);
        Ok(found)
    }

    pub async fn find_peer(&self, peer: PeerId) -> Result<Option<PeerRecord>> {
        if let Some(record) = self.request(|tx| Command::Lookup(peer, tx)).await? {
            return Ok(Some(record));
        }
        let closest = self.iterative_find_node(peer).await?;
        Ok(closest.into_iter().find(|r| r.peer_id == peer))
    }

    async fn lookup(&self, target: PeerId, mode: LookupMode, seeds: Vec<PeerRecord>) -> Result<LookupResult> {
        let started = Instant::now();
        let k = self.config.k;
        let alpha = self.config.alpha;

        let mut shortlist = self.request(|tx| Command::Closest(target, k, tx)).await?;
        for seed in seeds {
            if seed.peer_id != self.id && !shortlist.iter().any(|c| c.peer_id == seed.peer_id) {
                shortlist.push(seed);
            }
        }
        sort_by_distance(&mut shortlist, &target);

        let mut seen: HashSet<PeerId> = shortlist.iter().map(|c| c.peer_id).collect();
        let mut queried: HashSet<PeerId> = HashSet::new();
        let mut providers: Vec<PeerRecord> = Vec::new();
        let mut best_distance = shortlist
            .first()
            .map(|c| c.peer_id.xor_distance(&target))
            .unwrap_or([0xff; PEER_ID_LEN]);

        for iteration in 1..=MAX_LOOKUP_ITERATIONS {
            if self.cancel.is_cancelled() {
                return Err(anyhow!("lookup cancelled"));
            }
            if started.elapsed() > self.config.lookup_timeout {
                debug!(target = %target, found = shortlist.len(), "lookup timed out, returning current results");
                break;
            }

            let candidates: Vec<PeerRecord> = shortlist
                .iter()
                .filter(|c| !queried.contains(&c.peer_id))
                .take(alpha)
                .cloned()
                .collect();
            if candidates.is_empty() {
                break;
            }
            queried.extend(candidates.iter().map(|c| c.peer_id));

            let mut join_set = JoinSet::new();
            for peer in candidates {
                let net = self.network.clone();
                let timeout = self.config.rpc_timeout;
                join_set.spawn(async move {
                    let call = async {
                        match mode {
                            LookupMode::Nodes => net.find_node(&peer, target).await.map(|n| (Vec::new(), n)),
                            LookupMode::Providers { key, .. } => net.get_providers(&peer, key).await,
                        }
                    };
                    let result = tokio::time::timeout(timeout, call)
                        .await
                        .unwrap_or_else(|_| Err(anyhow!("query timeout")));
                    (peer, result)
                });
            }

            while let Some(joined) = join_set.join_next().await {
                let Ok((peer, result)) = joined else { continue };
                match result {
                    Ok((found_providers, closer)) => {
                        self.observe_peer(peer.clone()).await;
                        for p in found_providers {
                            if p.key_matches() && !providers.iter().any(|e| e.peer_id == p.peer_id) {
                                providers.push(p);
                            }
                        }
                        for n in closer {
                            if n.peer_id == self.id || !n.key_matches() {
                                continue;
                            }
                            self.observe_peer_from(n.clone(), peer.peer_id).await;
                            if seen.insert(n.peer_id) {
                                shortlist.push(n);
                            }
                        }
                    }
                    Err(e) => {
                        trace!(peer = %peer.peer_id, error = %e, "lookup rpc failed");
                        shortlist.retain(|c| c.peer_id != peer.peer_id);
                        self.remove_peer(peer.peer_id).await;
                    }
                }
            }

            if let LookupMode::Providers { want, .. } = mode
                && providers.len() >= want
            {
                break;
            }

            sort_by_distance(&mut shortlist, &target);
            shortlist.truncate(k);

            let closer = shortlist.first().is_some_and(|first| {
                distance_cmp(&first.peer_id.xor_distance(&target), &best_distance) == std::cmp::Ordering::Less
            });
            if closer {
                if let Some(first) = shortlist.first() {
                    best_distance = first.peer_id.xor_distance(&target);
                }
            } else if shortlist.iter().all(|c| queried.contains(&c.peer_id)) {
                break;
            }

            if iteration == MAX_LOOKUP_ITERATIONS {
                warn!(target = %target, "iterative lookup hit the iteration cap");
            }
        }

        debug!(
            target = %target,
            found = shortlist.len(),
            providers = providers.len(),
            queried = queried.len(),
            "iterative lookup completed"
        );
        Ok(LookupResult {
            closest: shortlist,
            providers,
        })
    }
}

#[async_trait]
impl<N: KadRpc> Discovery for DhtNode<N> {
    async fn advertise(&self, key: &str, ttl: Duration) -> Result<Duration> {
        self.provide(key_for(key), ttl).await
    }

    async fn find_peers(&self, key: &str, limit: usize) -> Result<Vec<PeerRecord>> {
        self.find_providers(key_for(key), limit).await
    }
}

#[async_trait]
impl<N: KadRpc> PeerRouting for DhtNode<N> {
    async fn find_peer(&self, peer: PeerId) -> Result<Option<PeerRecord>> {
        DhtNode::find_peer(self, peer).await
    }
}

impl<N: KadRpc> DhtActor<N> {
    async fn run(mut self) {
        loop {
            let cmd = tokio::select! {
                _ = self.cancel.cancelled() => break,
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(cmd) => cmd,
                    None => break,
                },
            };
            match cmd {
                Command::ObservePeer(record) => self.insert(record),
                Command::ObservePeerFrom(record, from, reply) => {
                    let allowed = record.peer_id == from || self.limiter.allow(&from);
                    if allowed {
                        self.insert(record);
                    }
                    let _ = reply.send(allowed);
                }
                Command::RemovePeer(peer) => {
                    self.routing.remove(&peer);
                }
                Command::Closest(target, k, reply) => {
                    let _ = reply.send(self.routing.closest(&target, k));
                }
                Command::Lookup(peer, reply) => {
                    let _ = reply.send(self.routing.lookup(&peer));
                }
                Command::TableSize(reply) => {
                    let _ = reply.send(self.routing.len());
                }
                Command::HandleFindNode(from, target, reply) => {
                    self.insert(from);
                    let _ = reply.send(self.routing.closest(&target, self.k));
                }
                Command::HandleGetProviders(from, key, reply) => {
                    self.insert(from);
                    let providers = self.providers.get(&key);
                    let closer = self.routing.closest(&PeerId::from_bytes(key), self.k);
                    let _ = reply.send((providers, closer));
                }
                Command::HandleAddProvider(from, key, provider, ttl, reply) => {
                    let result = if provider.peer_id != from.peer_id {
                        Err(anyhow!("peer {} cannot register provider {}", from.peer_id, provider.peer_id))
                    } else {
                        if from.peer_id != self.id {
                            self.insert(from);
                        }
                        self.providers.add(&key, provider, ttl)
                    };
                    let _ = reply.send(result);
                }
                Command::LocalProviders(key, reply) => {
                    let _ = reply.send(self.providers.get(&key));
                }
                Command::StaleBuckets(threshold, reply) => {
                    let _ = reply.send(self.routing.stale_bucket_indices(threshold));
                }
                Command::MarkBucketRefreshed(idx) => self.routing.mark_bucket_refreshed(idx),
                Command::ApplyPingResult(pending, alive) => self.routing.apply_ping_result(pending, alive),
            }
        }
        trace!(peer = %self.id, "dht actor stopped");
    }

    fn insert(&mut self, record: PeerRecord) {
        if let Some(pending) = self.routing.update_with_pending(record) {
            let network = self.network.clone();
            let tx = self.cmd_tx.clone();
            tokio::spawn(async move {
                let alive = tokio::time::timeout(DEFAULT_RPC_TIMEOUT, network.ping(&pending.oldest))
                    .await
                    .is_ok_and(|r| r.is_ok());
                let _ = tx.send(Command::ApplyPingResult(pending, alive)).await;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datastore::MemoryDatastore;
    use std::collections::HashMap;
    use tokio::sync::{Mutex, RwLock as AsyncRwLock};

    #[derive(Default)]
    struct Registry {
        nodes: AsyncRwLock<HashMap<PeerId, DhtNode<TestNetwork>>>,
    }

    struct TestNetwork {
        registry: Arc<Registry>,
        me: PeerRecord,
        failures: Mutex<HashSet<PeerId>>,
        pings: Mutex<Vec<PeerId>>,
    }

    impl TestNetwork {
        async fn target(&self, to: &PeerRecord) -> Result<DhtNode<TestNetwork>> {
            if self.failures.lock().await.contains(&to.peer_id) {
                return Err(anyhow!("injected network failure"));
            }
            self.registry
                .nodes
                .read()
                .await
                .get(&to.peer_id)
                .cloned()
                .ok_or_else(|| anyhow!("peer not reachable"))
        }
    }

    #[async_trait]
    impl KadRpc for TestNetwork {
        async fn ping(&self, to: &PeerRecord) -> Result<()> {
            self.pings.lock().await.push(to.peer_id);
            self.target(to).await.map(|_| ())
        }

        async fn find_node(&self, to: &PeerRecord, target: PeerId) -> Result<Vec<PeerRecord>> {
            Ok(self.target(to).await?.handle_find_node(self.me.clone(), target).await)
        }

        async fn get_providers(&self, to: &PeerRecord, key: Key) -> Result<(Vec<PeerRecord>, Vec<PeerRecord>)> {
            Ok(self.target(to).await?.handle_get_providers(self.me.clone(), key).await)
        }

        async fn add_provider(&self, to: &PeerRecord, key: Key, provider: PeerRecord) -> Result<()> {
            self.target(to).await?.handle_add_provider(self.me.clone(), key, provider).await.map(|_| ())
        }
    }

    fn record(id: PeerId, port: u64) -> PeerRecord {
        PeerRecord::new(id, vec![Multiaddr::memory(port)])
    }

    async fn spawn_node(registry: &Arc<Registry>, port: u64, config: KadConfig) -> (DhtNode<TestNetwork>, Arc<TestNetwork>) {
        let id = PeerId::random();
        let network = Arc::new(TestNetwork {
            registry: registry.clone(),
            me: record(id, port),
            failures: Mutex::new(HashSet::new()),
            pings: Mutex::new(Vec::new()),
        });
        let node = DhtNode::new(
            id,
            network.clone(),
            Arc::new(MemoryDatastore::new()),
            config,
            CancellationToken::new(),
        );
        node.set_local_addrs(vec![Multiaddr::memory(port)]);
        registry.nodes.write().await.insert(id, node.clone());
        (node, network)
    }

    /// A chain where each node only knows its predecessor.
    async fn chain(n: usize) -> Vec<DhtNode<TestNetwork>> {
        let registry = Arc::new(Registry::default());
        let mut nodes: Vec<DhtNode<TestNetwork>> = Vec::new();
        for i in 0..n {
            let (node, _) = spawn_node(&registry, i as u64 + 1, KadConfig::default()).await;
            if let Some(prev) = nodes.last() {
                node.observe_peer(record(prev.peer_id(), i as u64)).await;
            }
            nodes.push(node);
        }
        nodes
    }

    #[test]
    fn bucket_index_finds_first_different_bit() {
        let self_id = PeerId::from_bytes([0u8; 32]);
        let mut other = [0u8; 32];
        other[0] = 0b1000_0000;
        assert_eq!(bucket_index(&self_id, &PeerId::from_bytes(other)), 0);

        let mut other = [0u8; 32];
        other[1] = 0b0001_0000;
        assert_eq!(bucket_index(&self_id, &PeerId::from_bytes(other)), 11);
        assert_eq!(bucket_index(&self_id, &self_id), 255);
    }

    #[test]
    fn random_id_for_bucket_lands_in_correct_bucket() {
        let self_id = PeerId::from_bytes([0x42u8; 32]);
        for idx in [0, 1, 7, 8, 15, 127, 200, 255] {
            for _ in 0..10 {
                let target = random_id_for_bucket(&self_id, idx);
                assert_eq!(bucket_index(&self_id, &target), idx);
            }
        }
    }

    #[tokio::test]
    async fn routing_table_orders_by_distance_and_caps_buckets() {
        let self_id = PeerId::from_bytes([0u8; 32]);
        let mut table = RoutingTable::new(self_id, 2);

        let ids: Vec<PeerId> = (1u8..=3)
            .map(|b| {
                let mut bytes = [0u8; 32];
                bytes[0] = 0x80;
                bytes[31] = b;
                PeerId::from_bytes(bytes)
            })
            .collect();
        for (i, id) in ids.iter().enumerate() {
            table.update(record(*id, i as u64));
        }
        // All three share bucket 0, which holds two.
        assert_eq!(table.len(), 2);

        let closest = table.closest(&ids[1], 10);
        assert_eq!(closest[0].peer_id, ids[1]);
        for pair in closest.windows(2) {
            assert_ne!(
                distance_cmp(&pair[0].peer_id.xor_distance(&ids[1]), &pair[1].peer_id.xor_distance(&ids[1])),
                std::cmp::Ordering::Greater
            );
        }
    }

    #[test]
    fn records_with_foreign_keys_are_ignored() {
        let mut table = RoutingTable::new(PeerId::random(), DEFAULT_K);
        let key = crate::identity::Keypair::generate_ed25519().unwrap().public();
        let mut bogus = record(PeerId::random(), 1);
        bogus.public_key = Some(key);
        table.update(bogus);
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn full_bucket_keeps_live_oldest_and_replaces_dead_one() {
        let registry = Arc::new(Registry::default());
        let config = KadConfig {
            k: 1,
            alpha: 1,
            ..Default::default()
        };
        let (node, network) = spawn_node(&registry, 1, config).await;
        let (alive, _) = spawn_node(&registry, 2, KadConfig::default()).await;

        // Two ids in the same (far) bucket relative to `node`.
        let mut far = *node.peer_id().as_bytes();
        far[0] ^= 0x80;
        let newcomer = PeerId::from_bytes(far);
        let alive_bucket = bucket_index(&node.peer_id(), &alive.peer_id());
        let newcomer_bucket = bucket_index(&node.peer_id(), &newcomer);

        node.observe_peer(record(alive.peer_id(), 2)).await;
        if alive_bucket == newcomer_bucket {
            node.observe_peer(record(newcomer, 3)).await;
            tokio::time::sleep(Duration::from_millis(50)).await;
            assert!(network.pings.lock().await.contains(&alive.peer_id()));
            assert_eq!(node.find_peer(alive.peer_id()).await.unwrap().map(|r| r.peer_id), Some(alive.peer_id()));

            network.failures.lock().await.insert(alive.peer_id());
            node.observe_peer(record(newcomer, 3)).await;
            tokio::time::sleep(Duration::from_millis(50)).await;
            assert_eq!(node.routing_table_size().await, 1);
            let held = node.request(|tx| Command::Lookup(newcomer, tx)).await.unwrap();
            assert_eq!(held.map(|r| r.peer_id), Some(newcomer));
        }
    }

    #[tokio::test]
    async fn iterative_lookup_walks_the_chain() {
        let nodes = chain(12).await;
        let last = nodes.last().unwrap();
        let first = &nodes[0];

        let found = last.find_peer(first.peer_id()).await.unwrap();
        assert_eq!(found.map(|r| r.peer_id), Some(first.peer_id()));
        assert!(last.routing_table_size().await > 1);
    }

    #[tokio::test]
    async fn providers_are_found_across_the_network() {
        let nodes = chain(8).await;
        let provider = &nodes[2];
        let seeker = &nodes[7];

        // Make the provider aware of more of the network first.
        provider.iterative_find_node(seeker.peer_id()).await.unwrap();

        let granted = provider.advertise("room/lobby", Duration::from_secs(600)).await.unwrap();
        assert_eq!(granted, Duration::from_secs(600));

        let found = seeker.find_peers("room/lobby", 5).await.unwrap();
        assert!(found.iter().any(|r| r.peer_id == provider.peer_id()));
        assert!(found.iter().all(|r| r.peer_id != seeker.peer_id()));
    }

    #[tokio::test]
    async fn add_provider_rejects_spoofed_provider() {
        let registry = Arc::new(Registry::default());
        let (node, _) = spawn_node(&registry, 1, KadConfig::default()).await;
        let from = record(PeerId::random(), 2);
        let victim = record(PeerId::random(), 3);
        assert!(node.handle_add_provider(from, [7u8; 32], victim).await.is_err());
    }

    #[tokio::test]
    async fn provider_store_persists_and_expires() {
        let datastore: Arc<dyn Datastore> = Arc::new(MemoryDatastore::new());
        let store = ProviderStore::new(datastore.clone());
        let key = key_for("k");
        let a = record(PeerId::random(), 1);
        let b = record(PeerId::random(), 2);

        assert_eq!(store.add(&key, a.clone(), Duration::from_secs(3600)).unwrap(), Duration::from_secs(3600));
        store.add(&key, b.clone(), Duration::from_millis(1)).unwrap();
        assert_eq!(
            store.add(&key, a.clone(), Duration::from_secs(1_000_000)).unwrap(),
            MAX_PROVIDER_TTL
        );

        // A second store over the same datastore sees the same records.
        let reopened = ProviderStore::new(datastore.clone());
        std::thread::sleep(std::time::Duration::from_millis(5));
        let live = reopened.get(&key);
        assert_eq!(live, vec![a]);
        assert!(datastore.has(&ProviderStore::datastore_key(&key)).unwrap());
    }

    #[test]
    fn config_validation() {
        assert!(KadConfig::default().validate().is_ok());
        let bad = KadConfig {
            alpha: 30,
            ..Default::default()
        };
        assert!(matches!(bad.validate(), Err(ConfigError::Kad(_))));
    }
}
