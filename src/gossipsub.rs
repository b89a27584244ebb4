//! # Gossip PubSub
//!
//! Topic-based publish/subscribe over a per-topic mesh with gossip repair.
//!
//! ## Peer Sets
//!
//! | Set | Purpose | Traffic |
//! |-----|---------|---------|
//! | Mesh | Joined topics, `D_lo..=D_hi` peers | Full messages |
//! | Fanout | Topics published to but not joined | Full messages |
//! | Gossip | `D_lazy` non-mesh topic peers per heartbeat | IHAVE ids |
//!
//! ## Message Flow
//!
//! 1. **Publish**: sequence-numbered, optionally signed, delivered to local
//!    subscribers, then pushed to every topic peer (flood) or to the mesh/fanout.
//! 2. **Receive**: duplicates are dropped against the seen cache; under strict
//!    verification, unsigned or badly signed messages are dropped and counted.
//! 3. **Forward**: accepted messages go to the mesh, minus the sender.
//! 4. **Repair**: IHAVE advertises recent ids from the message cache; IWANT
//!    fetches them.
//!
//! ## Security Measures
//!
//! - Signatures verified before a message is marked seen, so a forgery
//!   cannot shadow the genuine message
//! - Per-peer inbound message rate limit
//! - Bounded seen cache, message cache, backoff table and subscription sets

use std::collections::{HashMap, HashSet, VecDeque};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Result, anyhow};
use lru::LruCache;
use rand::seq::SliceRandom;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::config::ConfigError;
use crate::crypto::{PUBSUB_SIGNATURE_DOMAIN, sign_with_domain, verify_with_domain};
use crate::identity::{Keypair, PeerId};
use crate::messages::{
    ControlGraft, ControlIHave, ControlIWant, ControlMessage, ControlPrune, MAX_VALUE_SIZE, MessageId, PubSubMessage,
    PubSubRpc, SubscriptionOpt,
};
use crate::metrics::Metrics;
use crate::peerstore::Peerstore;
use crate::protocols::PubSubTransport;

// ============================================================================
// Configuration
// ============================================================================

/// Target mesh degree (`D`).
pub const DEFAULT_MESH_N: usize = 6;

/// Lower bound before the heartbeat grafts (`D_lo`).
pub const DEFAULT_MESH_N_LOW: usize = 5;

/// Upper bound before the heartbeat prunes (`D_hi`).
pub const DEFAULT_MESH_N_HIGH: usize = 12;

/// Peers receiving IHAVE gossip per topic per heartbeat (`D_lazy`).
pub const DEFAULT_GOSSIP_LAZY: usize = 6;

pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

/// Fanout state for a topic is dropped after this long without a publish.
pub const DEFAULT_FANOUT_TTL: Duration = Duration::from_secs(60);

/// Heartbeat windows kept in the message cache.
pub const DEFAULT_HISTORY_LENGTH: usize = 5;

/// Most recent windows advertised through IHAVE.
pub const DEFAULT_HISTORY_GOSSIP: usize = 3;

/// How long a message id stays in the seen cache.
pub const DEFAULT_SEEN_TTL: Duration = Duration::from_secs(120);

/// SECURITY: bounds the seen cache regardless of traffic.
pub const DEFAULT_SEEN_CAPACITY: usize = 10_000;

pub const DEFAULT_PRUNE_BACKOFF: Duration = Duration::from_secs(60);

pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Maximum ids per IHAVE, and messages per IWANT reply.
pub const DEFAULT_MAX_IHAVE_LENGTH: usize = 100;

/// Inbound messages accepted per peer per [`RATE_LIMIT_WINDOW`].
pub const DEFAULT_PER_PEER_RATE_LIMIT: usize = 50;

pub const RATE_LIMIT_WINDOW: Duration = Duration::from_secs(1);

/// Buffered messages per local subscriber before deliveries are dropped.
pub const DEFAULT_SUBSCRIPTION_BUFFER: usize = 256;

pub const MAX_TOPIC_LENGTH: usize = 256;

/// SECURITY: caps the topics a single remote peer can claim.
pub const MAX_SUBSCRIPTIONS_PER_PEER: usize = 100;

/// SECURITY: bounds PRUNE backoff tracking.
const MAX_BACKOFF_ENTRIES: usize = 10_000;

/// SECURITY: bounds per-peer rate limiter state.
const MAX_RATE_LIMIT_ENTRIES: usize = 10_000;

pub fn is_valid_topic(topic: &str) -> bool {
    !topic.is_empty() && topic.len() <= MAX_TOPIC_LENGTH && topic.chars().all(|c| !c.is_control())
}

#[derive(Clone, Debug)]
pub struct GossipSubConfig {
    pub mesh_n: usize,
    pub mesh_n_low: usize,
    pub mesh_n_high: usize,
    pub gossip_lazy: usize,
    pub heartbeat_interval: Duration,
    pub fanout_ttl: Duration,
    pub history_length: usize,
    pub history_gossip: usize,
    pub seen_ttl: Duration,
    pub seen_capacity: usize,
    pub prune_backoff: Duration,
    pub max_message_size: usize,
    pub max_ihave_length: usize,
    pub per_peer_rate_limit: usize,
    pub subscription_buffer: usize,
    /// Sign published messages with the host key.
    pub sign_messages: bool,
    /// Drop inbound messages without a valid signature.
    pub strict_signature_verification: bool,
    /// Publish to every known topic peer instead of only the mesh.
    pub flood_publish: bool,
}

impl Default for GossipSubConfig {
    fn default() -> Self {
        Self {
            mesh_n: DEFAULT_MESH_N,
            mesh_n_low: DEFAULT_MESH_N_LOW,
            mesh_n_high: DEFAULT_MESH_N_HIGH,
            gossip_lazy: DEFAULT_GOSSIP_LAZY,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            fanout_ttl: DEFAULT_FANOUT_TTL,
            history_length: DEFAULT_HISTORY_LENGTH,
            history_gossip: DEFAULT_HISTORY_GOSSIP,
            seen_ttl: DEFAULT_SEEN_TTL,
            seen_capacity: DEFAULT_SEEN_CAPACITY,
            prune_backoff: DEFAULT_PRUNE_BACKOFF,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            max_ihave_length: DEFAULT_MAX_IHAVE_LENGTH,
            per_peer_rate_limit: DEFAULT_PER_PEER_RATE_LIMIT,
            subscription_buffer: DEFAULT_SUBSCRIPTION_BUFFER,
            sign_messages: true,
            strict_signature_verification: true,
            flood_publish: true,
        }
    }
}

impl GossipSubConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let fail = |msg: &str| Err::<(), _>(ConfigError::GossipSub(msg.to_string()));
        if self.mesh_n == 0 {
            return fail("mesh_n must be non-zero");
        }
        if !(self.mesh_n_low <= self.mesh_n && self.mesh_n <= self.mesh_n_high) {
            return fail("mesh degrees must satisfy mesh_n_low <= mesh_n <= mesh_n_high");
        }
        if self.history_length == 0 || self.history_gossip > self.history_length {
            return fail("history_gossip must not exceed a non-zero history_length");
        }
        if self.seen_capacity == 0 || self.subscription_buffer == 0 || self.per_peer_rate_limit == 0 {
            return fail("seen_capacity, subscription_buffer and per_peer_rate_limit must be non-zero");
        }
        if self.max_message_size == 0 || self.max_message_size > MAX_VALUE_SIZE {
            return fail("max_message_size out of range");
        }
        if self.heartbeat_interval.is_zero() {
            return Err(ConfigError::ZeroDuration("gossipsub.heartbeat_interval"));
        }
        if self.seen_ttl.is_zero() {
            return Err(ConfigError::ZeroDuration("gossipsub.seen_ttl"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MessageRejection {
    #[error("message size exceeds maximum allowed")]
    MessageTooLarge,
    #[error("topic name is empty, too long or contains control characters")]
    InvalidTopic,
}

// ============================================================================
// Subscriptions
// ============================================================================

/// A message accepted by the local node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub id: MessageId,
    /// Original publisher.
    pub source: PeerId,
    /// Peer the message arrived from; the local peer for own publishes.
    pub propagated_by: PeerId,
    pub seqno: u64,
    pub topic: String,
    pub data: Vec<u8>,
}

/// Receives every message on one topic. Dropping it unsubscribes; the topic
/// is left once its last subscription is gone.
pub struct Subscription {
    topic: String,
    id: u64,
    rx: mpsc::Receiver<ReceivedMessage>,
    cmd_tx: mpsc::Sender<Command>,
}

impl Subscription {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// `None` once the pubsub service has shut down.
    pub async fn next(&mut self) -> Option<ReceivedMessage> {
        self.rx.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        // If the queue is full the heartbeat sweeps the closed sender instead.
        let _ = self.cmd_tx.try_send(Command::Unsubscribe {
            topic: std::mem::take(&mut self.topic),
            id: self.id,
        });
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("topic", &self.topic)
            .field("id", &self.id)
            .finish()
    }
}

// ============================================================================
// Caches
// ============================================================================

/// Time-windowed, capacity-bounded record of message ids already handled.
struct SeenCache {
    entries: LruCache<MessageId, Instant>,
    ttl: Duration,
}

impl SeenCache {
    fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            entries: LruCache::new(NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN)),
            ttl,
        }
    }

    fn contains(&self, id: &MessageId) -> bool {
        self.entries.peek(id).is_some_and(|at| at.elapsed() < self.ttl)
    }

    fn insert(&mut self, id: MessageId) {
        self.entries.put(id, Instant::now());
    }
}

/// Recent messages by heartbeat window, serving IHAVE and IWANT.
struct MessageCache {
    msgs: HashMap<MessageId, PubSubMessage>,
    /// Newest window first.
    history: VecDeque<Vec<(MessageId, String)>>,
    gossip: usize,
}

impl MessageCache {
    fn new(history_length: usize, history_gossip: usize) -> Self {
        Self {
            msgs: HashMap::new(),
            history: (0..history_length).map(|_| Vec::new()).collect(),
            gossip: history_gossip,
        }
    }

    fn put(&mut self, id: MessageId, msg: &PubSubMessage) {
        if self.msgs.insert(id, msg.clone()).is_none()
            && let Some(window) = self.history.front_mut()
        {
            window.push((id, msg.topic.clone()));
        }
    }

    fn get(&self, id: &MessageId) -> Option<&PubSubMessage> {
        self.msgs.get(id)
    }

    fn gossip_ids(&self, topic: &str) -> Vec<MessageId> {
        self.history
            .iter()
            .take(self.gossip)
            .flat_map(|w| w.iter().filter(|(_, t)| t == topic).map(|(id, _)| *id))
            .collect()
    }

    fn shift(&mut self) {
        if let Some(oldest) = self.history.pop_back() {
            for (id, _) in oldest {
                self.msgs.remove(&id);
            }
        }
        self.history.push_front(Vec::new());
    }
}

struct PeerRateLimit {
    times: VecDeque<Instant>,
}

impl PeerRateLimit {
    fn new() -> Self {
        Self { times: VecDeque::new() }
    }

    /// Returns true if the message must be dropped.
    fn check_and_record(&mut self, max_rate: usize) -> bool {
        let now = Instant::now();
        while let Some(front) = self.times.front() {
            if now.duration_since(*front) >= RATE_LIMIT_WINDOW {
                self.times.pop_front();
            } else {
                break;
            }
        }
        if self.times.len() >= max_rate {
            return true;
        }
        self.times.push_back(now);
        false
    }
}

/// Bytes covered by a pubsub signature.
fn signing_bytes(msg: &PubSubMessage) -> Vec<u8> {
    let mut out = Vec::with_capacity(32 + 8 + 4 + msg.topic.len() + msg.data.len());
    out.extend_from_slice(msg.from.as_bytes());
    out.extend_from_slice(&msg.seqno.to_be_bytes());
    out.extend_from_slice(&(msg.topic.len() as u32).to_be_bytes());
    out.extend_from_slice(msg.topic.as_bytes());
    out.extend_from_slice(&msg.data);
    out
}

// ============================================================================
// Handle
// ============================================================================

enum Command {
    Subscribe(String, oneshot::Sender<Result<(u64, mpsc::Receiver<ReceivedMessage>)>>),
    Unsubscribe { topic: String, id: u64 },
    Publish(String, Vec<u8>, oneshot::Sender<Result<MessageId>>),
    HandleRpc(PeerId, PubSubRpc),
    PeerConnected(PeerId),
    PeerDisconnected(PeerId),
    Topics(oneshot::Sender<Vec<String>>),
    MeshPeers(String, oneshot::Sender<Vec<PeerId>>),
    MeshSizes(oneshot::Sender<HashMap<String, usize>>),
}

#[derive(Clone)]
pub struct GossipSub {
    cmd_tx: mpsc::Sender<Command>,
    local: PeerId,
}

impl GossipSub {
    pub fn spawn<T: PubSubTransport>(
        keypair: Keypair,
        config: GossipSubConfig,
        transport: Arc<T>,
        peerstore: Arc<Peerstore>,
        metrics: Arc<Metrics>,
        cancel: CancellationToken,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(1024);
        let local = keypair.peer_id();
        let actor = GossipSubActor::new(keypair, config, transport, peerstore, metrics);
        tokio::spawn(actor.run(cmd_rx, cancel));
        Self { cmd_tx, local }
    }

    pub fn local_peer(&self) -> PeerId {
        self.local
    }

    async fn request<R>(&self, build: impl FnOnce(oneshot::Sender<R>) -> Command) -> Result<R> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(build(tx))
            .await
            .map_err(|_| anyhow!("GossipSub actor closed"))?;
        rx.await.map_err(|_| anyhow!("GossipSub actor closed"))
    }

    /// Join `topic` (if not already joined) and return a new subscription.
    pub async fn subscribe(&self, topic: &str) -> Result<Subscription> {
        let (id, rx) = self.request(|tx| Command::Subscribe(topic.to_string(), tx)).await??;
        Ok(Subscription {
            topic: topic.to_string(),
            id,
            rx,
            cmd_tx: self.cmd_tx.clone(),
        })
    }

    pub async fn publish(&self, topic: &str, data: Vec<u8>) -> Result<MessageId> {
        self.request(|tx| Command::Publish(topic.to_string(), data, tx)).await?
    }

    /// Feed an RPC received from `from` into the router.
    pub async fn handle_rpc(&self, from: PeerId, rpc: PubSubRpc) {
        let _ = self.cmd_tx.send(Command::HandleRpc(from, rpc)).await;
    }

    /// A pubsub-capable peer is connected and reachable through the transport.
    pub async fn add_peer(&self, peer: PeerId) {
        let _ = self.cmd_tx.send(Command::PeerConnected(peer)).await;
    }

    pub async fn remove_peer(&self, peer: PeerId) {
        let _ = self.cmd_tx.send(Command::PeerDisconnected(peer)).await;
    }

    /// Topics joined locally.
    pub async fn topics(&self) -> Vec<String> {
        self.request(Command::Topics).await.unwrap_or_default()
    }

    pub async fn mesh_peers(&self, topic: &str) -> Vec<PeerId> {
        self.request(|tx| Command::MeshPeers(topic.to_string(), tx))
            .await
            .unwrap_or_default()
    }

    pub async fn mesh_sizes(&self) -> HashMap<String, usize> {
        self.request(Command::MeshSizes).await.unwrap_or_default()
    }
}

// ============================================================================
// Actor
// ============================================================================

struct GossipSubActor<T: PubSubTransport> {
    keypair: Keypair,
    local: PeerId,
    config: GossipSubConfig,
    transport: Arc<T>,
    peerstore: Arc<Peerstore>,
    metrics: Arc<Metrics>,

    seqno: u64,
    next_subscription_id: u64,
    subscribers: HashMap<String, Vec<(u64, mpsc::Sender<ReceivedMessage>)>>,
    mesh: HashMap<String, HashSet<PeerId>>,
    fanout: HashMap<String, HashSet<PeerId>>,
    fanout_last_pub: HashMap<String, Instant>,
    connected: HashSet<PeerId>,
    peer_topics: HashMap<PeerId, HashSet<String>>,
    backoff: LruCache<(PeerId, String), Instant>,
    rate_limits: LruCache<PeerId, PeerRateLimit>,
    seen: SeenCache,
    mcache: MessageCache,
    /// Control messages accumulated while handling one event.
    pending_control: HashMap<PeerId, ControlMessage>,
}

impl<T: PubSubTransport> GossipSubActor<T> {
    fn new(
        keypair: Keypair,
        config: GossipSubConfig,
        transport: Arc<T>,
        peerstore: Arc<Peerstore>,
        metrics: Arc<Metrics>,
    ) -> Self {
        // Starting from wall-clock nanoseconds keeps seqnos fresh across restarts.
        let seqno = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        let backoff_cap = NonZeroUsize::new(MAX_BACKOFF_ENTRIES).unwrap_or(NonZeroUsize::MIN);
        let rate_cap = NonZeroUsize::new(MAX_RATE_LIMIT_ENTRIES).unwrap_or(NonZeroUsize::MIN);

        Self {
            local: keypair.peer_id(),
            seen: SeenCache::new(config.seen_capacity, config.seen_ttl),
            mcache: MessageCache::new(config.history_length, config.history_gossip),
            keypair,
            config,
            transport,
            peerstore,
            metrics,
            seqno,
            next_subscription_id: 1,
            subscribers: HashMap::new(),
            mesh: HashMap::new(),
            fanout: HashMap::new(),
            fanout_last_pub: HashMap::new(),
            connected: HashSet::new(),
            peer_topics: HashMap::new(),
            backoff: LruCache::new(backoff_cap),
            rate_limits: LruCache::new(rate_cap),
            pending_control: HashMap::new(),
        }
    }

    async fn run(mut self, mut cmd_rx: mpsc::Receiver<Command>, cancel: CancellationToken) {
        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("GossipSub actor cancelled");
                    break;
                }
                cmd = cmd_rx.recv() => {
                    let Some(cmd) = cmd else {
                        debug!("GossipSub handles dropped, actor quitting");
                        break;
                    };
                    self.handle_command(cmd);
                }
                _ = heartbeat.tick() => self.heartbeat(),
            }
            self.flush_control();
        }
    }

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Subscribe(topic, reply) => {
                let _ = reply.send(self.subscribe(topic));
            }
            Command::Unsubscribe { topic, id } => self.unsubscribe(&topic, id),
            Command::Publish(topic, data, reply) => {
                let _ = reply.send(self.publish(topic, data));
            }
            Command::HandleRpc(from, rpc) => self.handle_rpc(from, rpc),
            Command::PeerConnected(peer) => self.peer_connected(peer),
            Command::PeerDisconnected(peer) => self.peer_disconnected(&peer),
            Command::Topics(reply) => {
                let mut topics: Vec<String> = self.mesh.keys().cloned().collect();
                topics.sort();
                let _ = reply.send(topics);
            }
            Command::MeshPeers(topic, reply) => {
                let peers = self
                    .mesh
                    .get(&topic)
                    .map(|m| m.iter().copied().collect())
                    .unwrap_or_default();
                let _ = reply.send(peers);
            }
            Command::MeshSizes(reply) => {
                let _ = reply.send(self.mesh.iter().map(|(t, m)| (t.clone(), m.len())).collect());
            }
        }
    }

    // ------------------------------------------------------------------------
    // Local API
    // ------------------------------------------------------------------------

    fn subscribe(&mut self, topic: String) -> Result<(u64, mpsc::Receiver<ReceivedMessage>)> {
        if !is_valid_topic(&topic) {
            return Err(MessageRejection::InvalidTopic.into());
        }
        let id = self.next_subscription_id;
        self.next_subscription_id += 1;
        let (tx, rx) = mpsc::channel(self.config.subscription_buffer);
        self.subscribers.entry(topic.clone()).or_default().push((id, tx));

        if !self.mesh.contains_key(&topic) {
            self.join(&topic);
        }
        Ok((id, rx))
    }

    fn unsubscribe(&mut self, topic: &str, id: u64) {
        let now_empty = match self.subscribers.get_mut(topic) {
            Some(subs) => {
                subs.retain(|(sid, tx)| *sid != id && !tx.is_closed());
                subs.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.subscribers.remove(topic);
            self.leave(topic);
        }
    }

    fn join(&mut self, topic: &str) {
        let mut peers = self.fanout.remove(topic).unwrap_or_default();
        self.fanout_last_pub.remove(topic);
        peers.retain(|p| self.is_topic_peer(p, topic));

        if peers.len() < self.config.mesh_n {
            let mut extra = self.graft_candidates(topic, &peers);
            extra.truncate(self.config.mesh_n - peers.len());
            peers.extend(extra);
        }
        for peer in &peers {
            self.control(*peer).graft.push(ControlGraft { topic: topic.to_string() });
        }
        debug!(topic = %topic, mesh = peers.len(), "joined topic");
        self.mesh.insert(topic.to_string(), peers);
        self.announce(topic, true);
    }

    fn leave(&mut self, topic: &str) {
        let Some(peers) = self.mesh.remove(topic) else {
            return;
        };
        let backoff_secs = self.config.prune_backoff.as_secs();
        for peer in peers {
            self.control(peer).prune.push(ControlPrune {
                topic: topic.to_string(),
                backoff_secs: Some(backoff_secs),
            });
        }
        debug!(topic = %topic, "left topic");
        self.announce(topic, false);
    }

    fn announce(&self, topic: &str, subscribe: bool) {
        let rpc = PubSubRpc {
            subscriptions: vec![SubscriptionOpt {
                subscribe,
                topic: topic.to_string(),
            }],
            ..Default::default()
        };
        for peer in &self.connected {
            self.transport.send(peer, rpc.clone());
        }
    }

    fn publish(&mut self, topic: String, data: Vec<u8>) -> Result<MessageId> {
        if !is_valid_topic(&topic) {
            return Err(MessageRejection::InvalidTopic.into());
        }
        if data.len() > self.config.max_message_size {
            return Err(MessageRejection::MessageTooLarge.into());
        }

        self.seqno = self.seqno.wrapping_add(1);
        let mut msg = PubSubMessage {
            from: self.local,
            seqno: self.seqno,
            topic,
            data,
            signature: None,
            key: None,
        };
        if self.config.sign_messages {
            msg.signature = Some(sign_with_domain(&self.keypair, PUBSUB_SIGNATURE_DOMAIN, &signing_bytes(&msg)));
            msg.key = Some(self.keypair.public());
        }
        let id = msg.id();
        self.seen.insert(id);
        self.mcache.put(id, &msg);
        self.deliver_local(id, self.local, &msg);

        let targets = self.publish_targets(&msg.topic);
        trace!(topic = %msg.topic, seqno = msg.seqno, peers = targets.len(), "publishing message");
        let rpc = PubSubRpc {
            messages: vec![msg],
            ..Default::default()
        };
        for peer in targets {
            if !self.transport.send(&peer, rpc.clone()) {
                trace!(peer = %peer, "publish dropped by transport");
            }
        }
        Ok(id)
    }

    fn publish_targets(&mut self, topic: &str) -> HashSet<PeerId> {
        if self.config.flood_publish {
            return self
                .connected
                .iter()
                .filter(|p| self.is_topic_peer(p, topic))
                .copied()
                .collect();
        }
        if let Some(mesh) = self.mesh.get(topic) {
            return mesh.clone();
        }

        self.fanout_last_pub.insert(topic.to_string(), Instant::now());
        let mut fanout = self.fanout.remove(topic).unwrap_or_default();
        fanout.retain(|p| self.is_topic_peer(p, topic));
        if fanout.len() < self.config.mesh_n {
            let mut extra = self.topic_peers(topic, &fanout);
            extra.truncate(self.config.mesh_n - fanout.len());
            fanout.extend(extra);
        }
        self.fanout.insert(topic.to_string(), fanout.clone());
        fanout
    }

    // ------------------------------------------------------------------------
    // Peer events
    // ------------------------------------------------------------------------

    fn peer_connected(&mut self, peer: PeerId) {
        if peer == self.local || !self.connected.insert(peer) {
            return;
        }
        if self.mesh.is_empty() {
            return;
        }
        let hello = PubSubRpc {
            subscriptions: self
                .mesh
                .keys()
                .map(|topic| SubscriptionOpt {
                    subscribe: true,
                    topic: topic.clone(),
                })
                .collect(),
            ..Default::default()
        };
        self.transport.send(&peer, hello);
    }

    fn peer_disconnected(&mut self, peer: &PeerId) {
        self.connected.remove(peer);
        self.peer_topics.remove(peer);
        self.rate_limits.pop(peer);
        self.pending_control.remove(peer);
        for mesh in self.mesh.values_mut() {
            mesh.remove(peer);
        }
        for fanout in self.fanout.values_mut() {
            fanout.remove(peer);
        }
        trace!(peer = %peer, "pubsub peer removed");
    }

    // ------------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------------

    fn handle_rpc(&mut self, from: PeerId, rpc: PubSubRpc) {
        if !self.connected.contains(&from) {
            trace!(peer = %from, "ignoring pubsub rpc from unknown peer");
            return;
        }
        for sub in rpc.subscriptions {
            self.handle_subscription(from, sub);
        }
        for msg in rpc.messages {
            self.handle_message(from, msg);
        }
        if let Some(control) = rpc.control {
            self.handle_control(from, control);
        }
    }

    fn handle_subscription(&mut self, from: PeerId, sub: SubscriptionOpt) {
        if !is_valid_topic(&sub.topic) {
            return;
        }
        if sub.subscribe {
            let topics = self.peer_topics.entry(from).or_default();
            if topics.len() >= MAX_SUBSCRIPTIONS_PER_PEER && !topics.contains(&sub.topic) {
                warn!(peer = %from, "peer exceeded subscription limit");
                return;
            }
            topics.insert(sub.topic);
        } else {
            if let Some(topics) = self.peer_topics.get_mut(&from) {
                topics.remove(&sub.topic);
            }
            if let Some(mesh) = self.mesh.get_mut(&sub.topic) {
                mesh.remove(&from);
            }
            if let Some(fanout) = self.fanout.get_mut(&sub.topic) {
                fanout.remove(&from);
            }
        }
    }

    fn handle_message(&mut self, from: PeerId, msg: PubSubMessage) {
        let limiter = self.rate_limits.get_or_insert_mut(from, PeerRateLimit::new);
        if limiter.check_and_record(self.config.per_peer_rate_limit) {
            trace!(peer = %from, "peer rate limited, dropping message");
            return;
        }
        if !is_valid_topic(&msg.topic) || msg.data.len() > self.config.max_message_size {
            trace!(peer = %from, "dropping malformed message");
            return;
        }

        let id = msg.id();
        if self.seen.contains(&id) {
            Metrics::incr(&self.metrics.pubsub_duplicates);
            return;
        }
        if self.config.strict_signature_verification && !self.signature_valid(&msg) {
            Metrics::incr(&self.metrics.pubsub_invalid_signatures);
            debug!(peer = %from, source = %msg.from, topic = %msg.topic, "dropping message with invalid signature");
            return;
        }
        self.seen.insert(id);

        if !self.mesh.contains_key(&msg.topic) {
            return;
        }
        self.mcache.put(id, &msg);
        self.deliver_local(id, from, &msg);
        self.forward(id, from, msg);
    }

    fn signature_valid(&self, msg: &PubSubMessage) -> bool {
        let Some(signature) = &msg.signature else {
            return false;
        };
        let key = self
            .peerstore
            .public_key_for(&msg.from)
            .or_else(|| msg.key.filter(|k| k.to_peer_id() == msg.from));
        match key {
            Some(key) => verify_with_domain(&key, PUBSUB_SIGNATURE_DOMAIN, &signing_bytes(msg), signature).is_ok(),
            None => false,
        }
    }

    fn deliver_local(&mut self, id: MessageId, propagated_by: PeerId, msg: &PubSubMessage) {
        let Some(subs) = self.subscribers.get_mut(&msg.topic) else {
            return;
        };
        let received = ReceivedMessage {
            id,
            source: msg.from,
            propagated_by,
            seqno: msg.seqno,
            topic: msg.topic.clone(),
            data: msg.data.clone(),
        };
        subs.retain(|(sub_id, tx)| match tx.try_send(received.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(topic = %received.topic, subscription = sub_id, "subscriber lagging, message dropped");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
        Metrics::incr(&self.metrics.pubsub_delivered);
    }

    fn forward(&mut self, id: MessageId, from: PeerId, msg: PubSubMessage) {
        let Some(mesh) = self.mesh.get(&msg.topic) else {
            return;
        };
        let targets: Vec<PeerId> = mesh.iter().filter(|p| **p != from && **p != msg.from).copied().collect();
        if targets.is_empty() {
            return;
        }
        trace!(id = %hex::encode(&id[..8]), peers = targets.len(), "forwarding message");
        let rpc = PubSubRpc {
            messages: vec![msg],
            ..Default::default()
        };
        for peer in targets {
            self.transport.send(&peer, rpc.clone());
        }
    }

    fn handle_control(&mut self, from: PeerId, control: ControlMessage) {
        for ihave in control.ihave {
            self.handle_ihave(from, ihave);
        }
        for iwant in control.iwant {
            self.handle_iwant(from, iwant);
        }
        for graft in control.graft {
            self.handle_graft(from, graft.topic);
        }
        for prune in control.prune {
            self.handle_prune(from, prune);
        }
    }

    fn handle_ihave(&mut self, from: PeerId, ihave: ControlIHave) {
        if !self.mesh.contains_key(&ihave.topic) {
            return;
        }
        let wanted: Vec<MessageId> = ihave
            .message_ids
            .into_iter()
            .take(self.config.max_ihave_length)
            .filter(|id| !self.seen.contains(id))
            .collect();
        if !wanted.is_empty() {
            trace!(peer = %from, count = wanted.len(), "requesting advertised messages");
            self.control(from).iwant.push(ControlIWant { message_ids: wanted });
        }
    }

    fn handle_iwant(&mut self, from: PeerId, iwant: ControlIWant) {
        let messages: Vec<PubSubMessage> = iwant
            .message_ids
            .iter()
            .take(self.config.max_ihave_length)
            .filter_map(|id| self.mcache.get(id).cloned())
            .collect();
        if messages.is_empty() {
            return;
        }
        self.transport.send(
            &from,
            PubSubRpc {
                messages,
                ..Default::default()
            },
        );
    }

    fn handle_graft(&mut self, from: PeerId, topic: String) {
        if !self.mesh.contains_key(&topic) || self.in_backoff(&from, &topic) {
            trace!(peer = %from, topic = %topic, "refusing graft");
            let backoff_secs = Some(self.config.prune_backoff.as_secs());
            self.control(from).prune.push(ControlPrune { topic, backoff_secs });
            return;
        }
        // A graft is a claim of interest in the topic.
        let topics = self.peer_topics.entry(from).or_default();
        if topics.len() < MAX_SUBSCRIPTIONS_PER_PEER || topics.contains(&topic) {
            topics.insert(topic.clone());
        } else {
            return;
        }
        if let Some(mesh) = self.mesh.get_mut(&topic)
            && mesh.insert(from)
        {
            debug!(peer = %from, topic = %topic, size = mesh.len(), "peer grafted");
        }
    }

    fn handle_prune(&mut self, from: PeerId, prune: ControlPrune) {
        if let Some(mesh) = self.mesh.get_mut(&prune.topic) {
            mesh.remove(&from);
        }
        let backoff = prune
            .backoff_secs
            .map(Duration::from_secs)
            .unwrap_or(self.config.prune_backoff)
            .max(self.config.prune_backoff);
        self.backoff.put((from, prune.topic), Instant::now() + backoff);
    }

    // ------------------------------------------------------------------------
    // Heartbeat
    // ------------------------------------------------------------------------

    fn heartbeat(&mut self) {
        self.sweep_subscribers();

        let topics: Vec<String> = self.mesh.keys().cloned().collect();
        for topic in &topics {
            self.maintain_mesh(topic);
        }
        self.maintain_fanout();
        self.emit_gossip();
        self.mcache.shift();
    }

    fn sweep_subscribers(&mut self) {
        let emptied: Vec<String> = self
            .subscribers
            .iter_mut()
            .filter_map(|(topic, subs)| {
                subs.retain(|(_, tx)| !tx.is_closed());
                subs.is_empty().then(|| topic.clone())
            })
            .collect();
        for topic in emptied {
            self.subscribers.remove(&topic);
            self.leave(&topic);
        }
    }

    fn maintain_mesh(&mut self, topic: &str) {
        let Some(mut mesh) = self.mesh.remove(topic) else {
            return;
        };
        mesh.retain(|p| self.is_topic_peer(p, topic));

        if mesh.len() < self.config.mesh_n_low {
            let mut candidates = self.graft_candidates(topic, &mesh);
            candidates.truncate(self.config.mesh_n - mesh.len());
            for peer in candidates {
                trace!(peer = %peer, topic = %topic, "grafting peer");
                self.control(peer).graft.push(ControlGraft { topic: topic.to_string() });
                mesh.insert(peer);
            }
        }

        if mesh.len() > self.config.mesh_n_high {
            let mut members: Vec<PeerId> = mesh.iter().copied().collect();
            members.shuffle(&mut rand::thread_rng());
            let until = Instant::now() + self.config.prune_backoff;
            let backoff_secs = Some(self.config.prune_backoff.as_secs());
            for peer in members.into_iter().skip(self.config.mesh_n) {
                mesh.remove(&peer);
                self.backoff.put((peer, topic.to_string()), until);
                self.control(peer).prune.push(ControlPrune {
                    topic: topic.to_string(),
                    backoff_secs,
                });
            }
        }
        self.mesh.insert(topic.to_string(), mesh);
    }

    fn maintain_fanout(&mut self) {
        let ttl = self.config.fanout_ttl;
        let expired: Vec<String> = self
            .fanout_last_pub
            .iter()
            .filter(|(_, at)| at.elapsed() > ttl)
            .map(|(t, _)| t.clone())
            .collect();
        for topic in expired {
            self.fanout_last_pub.remove(&topic);
            self.fanout.remove(&topic);
        }

        let topics: Vec<String> = self.fanout.keys().cloned().collect();
        for topic in topics {
            let Some(mut peers) = self.fanout.remove(&topic) else {
                continue;
            };
            peers.retain(|p| self.is_topic_peer(p, &topic));
            if peers.len() < self.config.mesh_n {
                let mut extra = self.topic_peers(&topic, &peers);
                extra.truncate(self.config.mesh_n - peers.len());
                peers.extend(extra);
            }
            self.fanout.insert(topic, peers);
        }
    }

    fn emit_gossip(&mut self) {
        let topics: Vec<String> = self.mesh.keys().chain(self.fanout.keys()).cloned().collect();
        for topic in topics {
            let mut ids = self.mcache.gossip_ids(&topic);
            if ids.is_empty() {
                continue;
            }
            ids.truncate(self.config.max_ihave_length);

            let exclude: HashSet<PeerId> = self
                .mesh
                .get(&topic)
                .into_iter()
                .chain(self.fanout.get(&topic))
                .flatten()
                .copied()
                .collect();
            let mut targets = self.topic_peers(&topic, &exclude);
            targets.truncate(self.config.gossip_lazy);
            for peer in targets {
                self.control(peer).ihave.push(ControlIHave {
                    topic: topic.clone(),
                    message_ids: ids.clone(),
                });
            }
        }
    }

    // ------------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------------

    fn is_topic_peer(&self, peer: &PeerId, topic: &str) -> bool {
        self.connected.contains(peer) && self.peer_topics.get(peer).is_some_and(|t| t.contains(topic))
    }

    /// Connected peers interested in `topic` and not in `exclude`, shuffled.
    fn topic_peers(&self, topic: &str, exclude: &HashSet<PeerId>) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self
            .connected
            .iter()
            .filter(|p| !exclude.contains(*p) && self.is_topic_peer(p, topic))
            .copied()
            .collect();
        peers.shuffle(&mut rand::thread_rng());
        peers
    }

    fn graft_candidates(&mut self, topic: &str, exclude: &HashSet<PeerId>) -> Vec<PeerId> {
        let peers = self.topic_peers(topic, exclude);
        peers.into_iter().filter(|p| !self.in_backoff(p, topic)).collect()
    }

    fn in_backoff(&mut self, peer: &PeerId, topic: &str) -> bool {
        let key = (*peer, topic.to_string());
        match self.backoff.peek(&key) {
            Some(until) if *until > Instant::now() => true,
            Some(_) => {
                self.backoff.pop(&key);
                false
            }
            None => false,
        }
    }

    fn control(&mut self, peer: PeerId) -> &mut ControlMessage {
        self.pending_control.entry(peer).or_default()
    }

    fn flush_control(&mut self) {
        for (peer, control) in self.pending_control.drain() {
            if control.is_empty() || !self.connected.contains(&peer) {
                continue;
            }
            self.transport.send(&peer, PubSubRpc::with_control(control));
        }
    }
}
