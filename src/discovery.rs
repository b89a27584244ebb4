//! # Discovery with Backoff
//!
//! [`BackoffDiscovery`] wraps any [`Discovery`] implementation and suppresses
//! repeated queries for the same key.
//!
//! Per key it remembers the last result set, the instant before which no new
//! query is issued, and the current backoff window:
//!
//! - A call inside the window returns the cached result (a cache hit).
//! - A call after the window issues one query; concurrent callers for the same
//!   key wait for that query instead of starting their own.
//! - A non-empty result resets the window to `min_backoff`. An empty result,
//!   an error or a timeout multiplies it by `multiplier`, capped at
//!   `max_backoff`. Every window gets additive jitter in
//!   `[0, window * jitter]`.
//! - Errors never reach the caller: they see the last cached set, which may be
//!   empty.
//!
//! Queries run on their own task, so a caller that gives up does not strand
//! the callers coalesced behind it. Waiters are tracked apart from the
//! bounded per-key state: evicting a key never drops a query in flight.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use lru::LruCache;
use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::config::ConfigError;
use crate::metrics::Metrics;
use crate::peerstore::PeerRecord;
use crate::protocols::Discovery;

pub const DEFAULT_MIN_BACKOFF: Duration = Duration::from_secs(10);
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(60 * 60);
pub const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;
pub const DEFAULT_BACKOFF_JITTER: f64 = 0.1;
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(30);

/// Results requested from the wrapped discovery per query; callers asking for
/// fewer get a prefix of the cached set.
pub const DEFAULT_QUERY_LIMIT: usize = 100;

/// Keys with backoff state kept at once.
/// SECURITY: bounds memory when callers query many distinct keys.
pub const DEFAULT_MAX_TRACKED_KEYS: usize = 1024;

#[derive(Clone, Debug)]
pub struct BackoffConfig {
    pub min_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
    /// Fraction of the window added as random jitter.
    pub jitter: f64,
    pub query_timeout: Duration,
    pub query_limit: usize,
    pub max_tracked_keys: usize,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            min_backoff: DEFAULT_MIN_BACKOFF,
            max_backoff: DEFAULT_MAX_BACKOFF,
            multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            jitter: DEFAULT_BACKOFF_JITTER,
            query_timeout: DEFAULT_QUERY_TIMEOUT,
            query_limit: DEFAULT_QUERY_LIMIT,
            max_tracked_keys: DEFAULT_MAX_TRACKED_KEYS,
        }
    }
}

impl BackoffConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_backoff.is_zero() {
            return Err(ConfigError::ZeroDuration("discovery_backoff.min_backoff"));
        }
        if self.query_timeout.is_zero() {
            return Err(ConfigError::ZeroDuration("discovery_backoff.query_timeout"));
        }
        if self.max_backoff < self.min_backoff {
            return Err(ConfigError::Backoff("max_backoff below min_backoff".into()));
        }
        if !(self.multiplier >= 1.0 && self.multiplier.is_finite()) {
            return Err(ConfigError::Backoff("multiplier must be a finite value >= 1".into()));
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(ConfigError::Backoff("jitter must be within [0, 1]".into()));
        }
        if self.query_limit == 0 || self.max_tracked_keys == 0 {
            return Err(ConfigError::Backoff("query_limit and max_tracked_keys must be non-zero".into()));
        }
        Ok(())
    }

    fn jittered(&self, window: Duration) -> Duration {
        let max_extra = window.as_secs_f64() * self.jitter;
        let extra = if max_extra > 0.0 {
            rand::thread_rng().gen_range(0.0..=max_extra)
        } else {
            0.0
        };
        window + Duration::from_secs_f64(extra)
    }

    fn grow(&self, window: Duration) -> Duration {
        window.mul_f64(self.multiplier).min(self.max_backoff)
    }
}

type Waiters = Vec<oneshot::Sender<Vec<PeerRecord>>>;

struct KeyState {
    cached: Vec<PeerRecord>,
    /// No query is issued before this instant.
    next_allowed: Option<Instant>,
    backoff: Duration,
}

impl KeyState {
    fn new(min_backoff: Duration) -> Self {
        Self {
            cached: Vec::new(),
            next_allowed: None,
            backoff: min_backoff,
        }
    }
}

struct Tracker {
    keys: LruCache<String, KeyState>,
    /// Callers waiting on each key's running query.
    in_flight: HashMap<String, Waiters>,
}

enum Plan {
    Cached(Vec<PeerRecord>),
    Wait(oneshot::Receiver<Vec<PeerRecord>>),
    Query(oneshot::Receiver<Vec<PeerRecord>>),
}

pub struct BackoffDiscovery<D: Discovery> {
    inner: Arc<D>,
    config: BackoffConfig,
    states: Arc<Mutex<Tracker>>,
    metrics: Arc<Metrics>,
    cancel: CancellationToken,
}

impl<D: Discovery> BackoffDiscovery<D> {
    pub fn new(inner: Arc<D>, config: BackoffConfig, metrics: Arc<Metrics>, cancel: CancellationToken) -> Self {
        let cap = NonZeroUsize::new(config.max_tracked_keys).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner,
            config,
            states: Arc::new(Mutex::new(Tracker {
                keys: LruCache::new(cap),
                in_flight: HashMap::new(),
            })),
            metrics,
            cancel,
        }
    }

    pub fn inner(&self) -> &Arc<D> {
        &self.inner
    }

    fn plan(&self, key: &str) -> Plan {
        let mut guard = self.states.lock();
        let tracker = &mut *guard;
        if let Some(waiters) = tracker.in_flight.get_mut(key) {
            let (tx, rx) = oneshot::channel();
            waiters.push(tx);
            Metrics::incr(&self.metrics.discovery_cache_hits);
            return Plan::Wait(rx);
        }

        let min = self.config.min_backoff;
        let state = tracker.keys.get_or_insert_mut(key.to_string(), || KeyState::new(min));
        if state.next_allowed.is_some_and(|t| Instant::now() < t) {
            Metrics::incr(&self.metrics.discovery_cache_hits);
            return Plan::Cached(state.cached.clone());
        }

        let (tx, rx) = oneshot::channel();
        tracker.in_flight.insert(key.to_string(), vec![tx]);
        Metrics::incr(&self.metrics.discovery_cache_misses);
        Plan::Query(rx)
    }

    fn spawn_query(&self, key: String) {
        let inner = self.inner.clone();
        let states = self.states.clone();
        let config = self.config.clone();
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            let outcome = tokio::select! {
                _ = cancel.cancelled() => Err(anyhow!("discovery cancelled")),
                r = tokio::time::timeout(config.query_timeout, inner.find_peers(&key, config.query_limit)) => {
                    r.unwrap_or_else(|_| Err(anyhow!("discovery query timed out")))
                }
            };

            let (result, waiters) = {
                let mut guard = states.lock();
                let tracker = &mut *guard;
                let state = tracker
                    .keys
                    .get_or_insert_mut(key.clone(), || KeyState::new(config.min_backoff));
                let now = Instant::now();
                match outcome {
                    Ok(peers) if !peers.is_empty() => {
                        state.backoff = config.min_backoff;
                        state.next_allowed = Some(now + config.jittered(state.backoff));
                        state.cached = peers;
                        debug!(key = %key, found = state.cached.len(), "discovery query succeeded");
                    }
                    other => {
                        if let Err(e) = &other {
                            debug!(key = %key, error = %e, "discovery query failed, serving cached result");
                        }
                        if let Ok(empty) = other {
                            state.cached = empty;
                        }
                        state.next_allowed = Some(now + config.jittered(state.backoff));
                        state.backoff = config.grow(state.backoff);
                        trace!(key = %key, next_window = ?state.backoff, "discovery backing off");
                    }
                }
                (state.cached.clone(), tracker.in_flight.remove(&key).unwrap_or_default())
            };
            for waiter in waiters {
                let _ = waiter.send(result.clone());
            }
        });
    }
}

#[async_trait]
impl<D: Discovery> Discovery for BackoffDiscovery<D> {
    async fn advertise(&self, key: &str, ttl: Duration) -> Result<Duration> {
        self.inner.advertise(key, ttl).await
    }

    async fn find_peers(&self, key: &str, limit: usize) -> Result<Vec<PeerRecord>> {
        let rx = match self.plan(key) {
            Plan::Cached(mut peers) => {
                peers.truncate(limit);
                return Ok(peers);
            }
            Plan::Wait(rx) => rx,
            Plan::Query(rx) => {
                self.spawn_query(key.to_string());
                rx
            }
        };
        let mut peers = rx.await.unwrap_or_default();
        peers.truncate(limit);
        Ok(peers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::PeerId;
    use crate::multiaddr::Multiaddr;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingDiscovery {
        queries: AtomicUsize,
        fail: AtomicBool,
        empty: AtomicBool,
        delay: Mutex<Duration>,
        peers: Mutex<Vec<PeerRecord>>,
    }

    impl CountingDiscovery {
        fn with_peers(n: usize) -> Arc<Self> {
            let d = Self::default();
            *d.peers.lock() = (0..n)
                .map(|i| PeerRecord::new(PeerId::random(), vec![Multiaddr::memory(i as u64 + 1)]))
                .collect();
            Arc::new(d)
        }

        fn queries(&self) -> usize {
            self.queries.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Discovery for CountingDiscovery {
        async fn advertise(&self, _key: &str, ttl: Duration) -> Result<Duration> {
            Ok(ttl)
        }

        async fn find_peers(&self, _key: &str, limit: usize) -> Result<Vec<PeerRecord>> {
            self.queries.fetch_add(1, Ordering::SeqCst);
            let delay = *self.delay.lock();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if self.fail.load(Ordering::SeqCst) {
                return Err(anyhow!("routing unavailable"));
            }
            if self.empty.load(Ordering::SeqCst) {
                return Ok(Vec::new());
            }
            Ok(self.peers.lock().iter().take(limit).cloned().collect())
        }
    }

    fn wrap(inner: Arc<CountingDiscovery>, config: BackoffConfig) -> (BackoffDiscovery<CountingDiscovery>, Arc<Metrics>) {
        let metrics = Arc::new(Metrics::default());
        (
            BackoffDiscovery::new(inner, config, metrics.clone(), CancellationToken::new()),
            metrics,
        )
    }

    fn no_jitter() -> BackoffConfig {
        BackoffConfig {
            jitter: 0.0,
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn second_call_in_window_is_served_from_cache() {
        let inner = CountingDiscovery::with_peers(3);
        let (disc, metrics) = wrap(inner.clone(), BackoffConfig::default());

        let first = disc.find_peers("topic", 10).await.unwrap();
        let second = disc.find_peers("topic", 10).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(inner.queries(), 1);

        let worst_case_window = DEFAULT_MIN_BACKOFF.mul_f64(1.0 + DEFAULT_BACKOFF_JITTER);
        tokio::time::advance(worst_case_window + Duration::from_secs(1)).await;
        disc.find_peers("topic", 10).await.unwrap();
        assert_eq!(inner.queries(), 2);

        let snap = metrics.snapshot();
        assert_eq!(snap.discovery_cache_hits, 1);
        assert_eq!(snap.discovery_cache_misses, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn keys_back_off_independently_and_limit_truncates() {
        let inner = CountingDiscovery::with_peers(5);
        let (disc, _) = wrap(inner.clone(), no_jitter());

        assert_eq!(disc.find_peers("a", 2).await.unwrap().len(), 2);
        assert_eq!(disc.find_peers("a", 4).await.unwrap().len(), 4);
        disc.find_peers("b", 10).await.unwrap();
        assert_eq!(inner.queries(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_share_one_query() {
        let inner = CountingDiscovery::with_peers(2);
        *inner.delay.lock() = Duration::from_millis(500);
        let (disc, _) = wrap(inner.clone(), BackoffConfig::default());
        let disc = Arc::new(disc);

        let calls: Vec<_> = (0..5)
            .map(|_| {
                let disc = disc.clone();
                tokio::spawn(async move { disc.find_peers("shared", 10).await.unwrap() })
            })
            .collect();
        let mut results = Vec::new();
        for c in calls {
            results.push(c.await.unwrap());
        }
        assert_eq!(inner.queries(), 1);
        assert!(results.iter().all(|r| r.len() == 2 && *r == results[0]));
    }

    #[tokio::test(start_paused = true)]
    async fn evicting_a_key_keeps_its_waiters() {
        let inner = CountingDiscovery::with_peers(2);
        *inner.delay.lock() = Duration::from_millis(500);
        let config = BackoffConfig {
            max_tracked_keys: 1,
            ..Default::default()
        };
        let (disc, _) = wrap(inner.clone(), config);
        let disc = Arc::new(disc);

        let first: Vec<_> = (0..3)
            .map(|_| {
                let disc = disc.clone();
                tokio::spawn(async move { disc.find_peers("a", 10).await.unwrap() })
            })
            .collect();
        tokio::task::yield_now().await;
        let other = {
            let disc = disc.clone();
            tokio::spawn(async move { disc.find_peers("b", 10).await.unwrap() })
        };

        for call in first {
            assert_eq!(call.await.unwrap().len(), 2);
        }
        assert_eq!(other.await.unwrap().len(), 2);
        assert_eq!(inner.queries(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failures_return_cached_result_and_grow_window() {
        let inner = CountingDiscovery::with_peers(1);
        let (disc, _) = wrap(inner.clone(), no_jitter());

        let good = disc.find_peers("k", 10).await.unwrap();
        assert_eq!(good.len(), 1);

        inner.fail.store(true, Ordering::SeqCst);
        tokio::time::advance(DEFAULT_MIN_BACKOFF + Duration::from_secs(1)).await;
        assert_eq!(disc.find_peers("k", 10).await.unwrap(), good);
        assert_eq!(inner.queries(), 2);

        // Failure at the minimum window: the next window is 2x.
        tokio::time::advance(DEFAULT_MIN_BACKOFF + Duration::from_secs(1)).await;
        disc.find_peers("k", 10).await.unwrap();
        assert_eq!(inner.queries(), 3);

        tokio::time::advance(DEFAULT_MIN_BACKOFF + Duration::from_secs(1)).await;
        disc.find_peers("k", 10).await.unwrap();
        assert_eq!(inner.queries(), 3, "window should have grown to 2x");

        tokio::time::advance(DEFAULT_MIN_BACKOFF * 2).await;
        inner.fail.store(false, Ordering::SeqCst);
        disc.find_peers("k", 10).await.unwrap();
        assert_eq!(inner.queries(), 4);

        // Success resets to the minimum window.
        tokio::time::advance(DEFAULT_MIN_BACKOFF + Duration::from_secs(1)).await;
        disc.find_peers("k", 10).await.unwrap();
        assert_eq!(inner.queries(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn window_is_capped_at_max_backoff() {
        let inner = CountingDiscovery::with_peers(0);
        inner.empty.store(true, Ordering::SeqCst);
        let config = BackoffConfig {
            jitter: 0.0,
            min_backoff: Duration::from_secs(10),
            max_backoff: Duration::from_secs(25),
            ..Default::default()
        };
        let (disc, _) = wrap(inner.clone(), config);

        // Windows: 10, 20, 25, 25.
        for step in [10u64, 20, 25, 25] {
            disc.find_peers("k", 10).await.unwrap();
            tokio::time::advance(Duration::from_secs(step)).await;
        }
        assert_eq!(inner.queries(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_query_times_out_to_empty_result() {
        let inner = CountingDiscovery::with_peers(3);
        *inner.delay.lock() = Duration::from_secs(600);
        let config = BackoffConfig {
            query_timeout: Duration::from_secs(2),
            ..Default::default()
        };
        let (disc, _) = wrap(inner.clone(), config);

        let started = Instant::now();
        assert!(disc.find_peers("k", 10).await.unwrap().is_empty());
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[test]
    fn config_validation() {
        assert!(BackoffConfig::default().validate().is_ok());
        let bad = BackoffConfig {
            multiplier: 0.5,
            ..Default::default()
        };
        assert!(matches!(bad.validate(), Err(ConfigError::Backoff(_))));
        let bad = BackoffConfig {
            max_backoff: Duration::from_secs(1),
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }
}
