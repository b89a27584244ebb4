//! # Connection Manager
//!
//! Keeps the number of live connections between two watermarks.
//!
//! Nothing is closed while the count is at or below `low_water`. Once it
//! exceeds `high_water`, the background task trims back down to `low_water`.
//! Victims are picked from connections older than `grace_period` whose peer is
//! not protected, lowest tag score first and oldest first among equal scores.
//!
//! Selection happens under a short `parking_lot` lock; the chosen connections
//! are closed only after it is released, so dial and accept paths that call
//! `notify_connected` never wait on a close.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::ConfigError;
use crate::identity::PeerId;
use crate::metrics::Metrics;
use crate::upgrader::{Connection, ConnectionId};

pub const DEFAULT_LOW_WATER: usize = 100;
pub const DEFAULT_HIGH_WATER: usize = 400;

/// New connections are never trimmed before this age.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(20);

/// Interval of the background watermark check.
pub const DEFAULT_SILENCE_PERIOD: Duration = Duration::from_secs(10);

#[derive(Clone, Debug)]
pub struct ConnManagerConfig {
    pub low_water: usize,
    pub high_water: usize,
    pub grace_period: Duration,
    pub silence_period: Duration,
}

impl Default for ConnManagerConfig {
    fn default() -> Self {
        Self {
            low_water: DEFAULT_LOW_WATER,
            high_water: DEFAULT_HIGH_WATER,
            grace_period: DEFAULT_GRACE_PERIOD,
            silence_period: DEFAULT_SILENCE_PERIOD,
        }
    }
}

impl ConnManagerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.low_water >= self.high_water {
            return Err(ConfigError::Watermarks {
                low: self.low_water,
                high: self.high_water,
            });
        }
        if self.silence_period.is_zero() {
            return Err(ConfigError::ZeroDuration("conn_manager.silence_period"));
        }
        Ok(())
    }
}

/// What the manager needs to know about a live connection.
pub trait ManagedConnection: Send + Sync + 'static {
    fn id(&self) -> ConnectionId;
    fn remote_peer(&self) -> PeerId;
    fn opened_at(&self) -> Instant;
    fn close(&self);
}

impl ManagedConnection for Connection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn remote_peer(&self) -> PeerId {
        self.remote_peer
    }

    fn opened_at(&self) -> Instant {
        self.opened_at
    }

    fn close(&self) {
        Connection::close(self)
    }
}

#[derive(Default)]
struct PeerTags {
    tags: HashMap<String, i64>,
    protections: HashSet<String>,
}

impl PeerTags {
    fn score(&self) -> i64 {
        self.tags.values().sum()
    }

    fn is_empty(&self) -> bool {
        self.tags.is_empty() && self.protections.is_empty()
    }
}

#[derive(Default)]
struct State {
    conns: HashMap<ConnectionId, Arc<dyn ManagedConnection>>,
    peers: HashMap<PeerId, PeerTags>,
}

impl State {
    fn prune_peer(&mut self, peer: &PeerId) {
        if self.peers.get(peer).is_some_and(PeerTags::is_empty) {
            self.peers.remove(peer);
        }
    }
}

pub struct ConnManager {
    config: ConnManagerConfig,
    state: Mutex<State>,
    over_high: Notify,
    metrics: Arc<Metrics>,
}

impl ConnManager {
    pub fn new(config: ConnManagerConfig, metrics: Arc<Metrics>) -> Self {
        Self {
            config,
            state: Mutex::new(State::default()),
            over_high: Notify::new(),
            metrics,
        }
    }

    pub fn config(&self) -> &ConnManagerConfig {
        &self.config
    }

    // ------------------------------------------------------------------------
    // Tags and protection
    // ------------------------------------------------------------------------

    pub fn tag_peer(&self, peer: PeerId, tag: &str, value: i64) {
        self.state
            .lock()
            .peers
            .entry(peer)
            .or_default()
            .tags
            .insert(tag.to_string(), value);
    }

    pub fn untag_peer(&self, peer: PeerId, tag: &str) {
        let mut state = self.state.lock();
        if let Some(info) = state.peers.get_mut(&peer) {
            info.tags.remove(tag);
        }
        state.prune_peer(&peer);
    }

    /// Apply `f` to the current value of `tag` (0 when absent).
    pub fn upsert_tag(&self, peer: PeerId, tag: &str, f: impl FnOnce(i64) -> i64) {
        let mut state = self.state.lock();
        let tags = &mut state.peers.entry(peer).or_default().tags;
        let current = tags.get(tag).copied().unwrap_or(0);
        tags.insert(tag.to_string(), f(current));
    }

    pub fn peer_score(&self, peer: &PeerId) -> i64 {
        self.state.lock().peers.get(peer).map(PeerTags::score).unwrap_or(0)
    }

    pub fn protect(&self, peer: PeerId, tag: &str) {
        self.state
            .lock()
            .peers
            .entry(peer)
            .or_default()
            .protections
            .insert(tag.to_string());
    }

    /// Returns whether the peer is still protected under another tag.
    pub fn unprotect(&self, peer: PeerId, tag: &str) -> bool {
        let mut state = self.state.lock();
        let still = match state.peers.get_mut(&peer) {
            Some(info) => {
                info.protections.remove(tag);
                !info.protections.is_empty()
            }
            None => false,
        };
        state.prune_peer(&peer);
        still
    }

    /// With `tag`, checks that specific protection; without, any protection.
    pub fn is_protected(&self, peer: &PeerId, tag: Option<&str>) -> bool {
        let state = self.state.lock();
        match (state.peers.get(peer), tag) {
            (Some(info), Some(tag)) => info.protections.contains(tag),
            (Some(info), None) => !info.protections.is_empty(),
            (None, _) => false,
        }
    }

    // ------------------------------------------------------------------------
    // Connection tracking
    // ------------------------------------------------------------------------

    pub fn notify_connected(&self, conn: Arc<dyn ManagedConnection>) {
        let count = {
            let mut state = self.state.lock();
            state.conns.insert(conn.id(), conn);
            state.conns.len()
        };
        if count > self.config.high_water {
            self.over_high.notify_one();
        }
    }

    pub fn notify_disconnected(&self, id: ConnectionId) {
        self.state.lock().conns.remove(&id);
    }

    pub fn connection_count(&self) -> usize {
        self.state.lock().conns.len()
    }

    /// Close connections until the count is back at `low_water`, as far as
    /// grace periods and protections allow. Returns how many were closed.
    pub fn trim_open_conns(&self) -> usize {
        let victims = self.select_victims(Instant::now());
        for conn in &victims {
            debug!(peer = %conn.remote_peer(), conn = %conn.id(), "trimming connection");
            conn.close();
        }
        if !victims.is_empty() {
            self.metrics
                .connections_trimmed
                .fetch_add(victims.len() as u64, std::sync::atomic::Ordering::Relaxed);
            info!(closed = victims.len(), remaining = self.connection_count(), "connection trim complete");
        }
        victims.len()
    }

    fn select_victims(&self, now: Instant) -> Vec<Arc<dyn ManagedConnection>> {
        let mut state = self.state.lock();
        let count = state.conns.len();
        if count <= self.config.low_water {
            return Vec::new();
        }
        let excess = count - self.config.low_water;

        let mut candidates: Vec<(i64, Instant, ConnectionId)> = state
            .conns
            .values()
            .filter(|c| now.saturating_duration_since(c.opened_at()) >= self.config.grace_period)
            .filter_map(|c| {
                let info = state.peers.get(&c.remote_peer());
                if info.is_some_and(|i| !i.protections.is_empty()) {
                    return None;
                }
                Some((info.map(PeerTags::score).unwrap_or(0), c.opened_at(), c.id()))
            })
            .collect();
        candidates.sort();

        candidates
            .into_iter()
            .take(excess)
            .filter_map(|(_, _, id)| state.conns.remove(&id))
            .collect()
    }

    /// Watermark enforcement until `cancel` fires: every `silence_period`,
    /// and immediately when a new connection pushes the count past
    /// `high_water`.
    pub fn spawn_background(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(manager.config.silence_period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                    _ = manager.over_high.notified() => {}
                }
                if manager.connection_count() > manager.config.high_water {
                    manager.trim_open_conns();
                }
            }
            debug!("connection manager stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct MockConn {
        id: ConnectionId,
        peer: PeerId,
        opened_at: Instant,
        closed: AtomicBool,
    }

    impl MockConn {
        fn new(peer: PeerId) -> Arc<Self> {
            Arc::new(Self {
                id: ConnectionId::next(),
                peer,
                opened_at: Instant::now(),
                closed: AtomicBool::new(false),
            })
        }

        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }
    }

    impl ManagedConnection for MockConn {
        fn id(&self) -> ConnectionId {
            self.id
        }
        fn remote_peer(&self) -> PeerId {
            self.peer
        }
        fn opened_at(&self) -> Instant {
            self.opened_at
        }
        fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    fn manager(low: usize, high: usize) -> Arc<ConnManager> {
        Arc::new(ConnManager::new(
            ConnManagerConfig {
                low_water: low,
                high_water: high,
                ..Default::default()
            },
            Arc::new(Metrics::default()),
        ))
    }

    #[test]
    fn low_not_below_high_is_rejected() {
        let config = ConnManagerConfig {
            low_water: 400,
            high_water: 100,
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::Watermarks { low: 400, high: 100 }));
    }

    #[tokio::test(start_paused = true)]
    async fn trims_to_low_water_and_spares_young_connections() {
        let cm = manager(100, 400);

        let old: Vec<_> = (0..350).map(|_| MockConn::new(PeerId::random())).collect();
        tokio::time::advance(DEFAULT_GRACE_PERIOD + Duration::from_secs(1)).await;
        let young: Vec<_> = (0..51).map(|_| MockConn::new(PeerId::random())).collect();

        for c in old.iter().chain(young.iter()) {
            cm.notify_connected(c.clone());
        }
        assert_eq!(cm.connection_count(), 401);

        let closed = cm.trim_open_conns();
        assert_eq!(closed, 301);
        assert!(cm.connection_count() <= 100);
        assert!(young.iter().all(|c| !c.is_closed()));
        assert_eq!(old.iter().filter(|c| c.is_closed()).count(), 301);
    }

    #[tokio::test(start_paused = true)]
    async fn background_task_trims_past_high_water() {
        let cm = manager(100, 400);
        let cancel = CancellationToken::new();
        let task = cm.spawn_background(cancel.clone());

        let conns: Vec<_> = (0..401).map(|_| MockConn::new(PeerId::random())).collect();
        tokio::time::advance(DEFAULT_GRACE_PERIOD + Duration::from_secs(1)).await;
        for c in &conns {
            cm.notify_connected(c.clone());
        }

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(cm.connection_count() <= 100);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn unprotected_peer_becomes_trimmable() {
        let cm = manager(1, 2);
        let relay = PeerId::random();
        let relayed = MockConn::new(relay);
        tokio::time::advance(Duration::from_secs(1)).await;
        let others: Vec<_> = (0..2).map(|_| MockConn::new(PeerId::random())).collect();
        tokio::time::advance(DEFAULT_GRACE_PERIOD + Duration::from_secs(1)).await;

        cm.protect(relay, "relay-reservation");
        cm.protect(relay, "relay-client");
        cm.notify_connected(relayed.clone());
        for c in &others {
            cm.notify_connected(c.clone());
        }
        assert_eq!(cm.trim_open_conns(), 2);
        assert!(!relayed.is_closed());

        let more = MockConn::new(PeerId::random());
        tokio::time::advance(DEFAULT_GRACE_PERIOD + Duration::from_secs(1)).await;
        cm.notify_connected(more.clone());

        assert!(cm.unprotect(relay, "relay-reservation"));
        assert_eq!(cm.trim_open_conns(), 1);
        assert!(!relayed.is_closed());
        assert!(more.is_closed());

        let last = MockConn::new(PeerId::random());
        tokio::time::advance(DEFAULT_GRACE_PERIOD + Duration::from_secs(1)).await;
        cm.notify_connected(last.clone());

        assert!(!cm.unprotect(relay, "relay-client"));
        assert!(!cm.is_protected(&relay, None));
        assert_eq!(cm.trim_open_conns(), 1);
        assert!(relayed.is_closed());
        assert!(!last.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn nothing_closed_at_or_below_low_water() {
        let cm = manager(10, 20);
        let conns: Vec<_> = (0..10).map(|_| MockConn::new(PeerId::random())).collect();
        tokio::time::advance(Duration::from_secs(60)).await;
        for c in &conns {
            cm.notify_connected(c.clone());
        }
        assert_eq!(cm.trim_open_conns(), 0);
        assert!(conns.iter().all(|c| !c.is_closed()));
    }

    #[tokio::test(start_paused = true)]
    async fn victims_ordered_by_score_then_age_and_protection_respected() {
        let cm = manager(2, 3);
        let valued = PeerId::random();
        let protected = PeerId::random();

        let oldest = MockConn::new(valued);
        tokio::time::advance(Duration::from_secs(1)).await;
        let guarded = MockConn::new(protected);
        tokio::time::advance(Duration::from_secs(1)).await;
        let plain_a = MockConn::new(PeerId::random());
        tokio::time::advance(Duration::from_secs(1)).await;
        let plain_b = MockConn::new(PeerId::random());
        tokio::time::advance(Duration::from_secs(60)).await;

        cm.tag_peer(valued, "app", 50);
        cm.protect(protected, "relay");
        for c in [&oldest, &guarded, &plain_a, &plain_b] {
            cm.notify_connected(c.clone());
        }

        assert_eq!(cm.trim_open_conns(), 2);
        assert!(plain_a.is_closed());
        assert!(plain_b.is_closed());
        assert!(!oldest.is_closed());
        assert!(!guarded.is_closed());
    }

    #[test]
    fn tag_and_protection_bookkeeping() {
        let cm = manager(1, 2);
        let peer = PeerId::random();

        cm.tag_peer(peer, "a", 5);
        cm.upsert_tag(peer, "a", |v| v + 10);
        cm.upsert_tag(peer, "b", |v| v - 3);
        assert_eq!(cm.peer_score(&peer), 12);
        cm.untag_peer(peer, "a");
        assert_eq!(cm.peer_score(&peer), -3);

        cm.protect(peer, "x");
        cm.protect(peer, "y");
        assert!(cm.is_protected(&peer, None));
        assert!(cm.is_protected(&peer, Some("x")));
        assert!(cm.unprotect(peer, "x"));
        assert!(!cm.is_protected(&peer, Some("x")));
        assert!(!cm.unprotect(peer, "y"));
        assert!(!cm.is_protected(&peer, None));
    }
}
