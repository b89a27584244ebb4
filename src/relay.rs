//! # Circuit Relay
//!
//! Relay support for peers that cannot be dialed directly.
//!
//! ## Relay Side
//! - [`RelayService`]: bounded reservation table with TTL plus a cap on
//!   concurrent circuits. A `Connect` is only honored for a target holding a
//!   live reservation; the two streams are then joined by [`splice`].
//!
//! ## Client Side
//! - [`AutoRelay`]: periodic task that, while the host is privately
//!   reachable, keeps `desired_relays` reservations, renews them before expiry,
//!   and publishes the resulting circuit addresses through a `watch` channel.
//!
//! Circuit addresses have the form
//! `<relay addr>/p2p/<relay>/p2p-circuit/p2p/<self>`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, anyhow};
use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::autonat::Reachability;
use crate::config::ConfigError;
use crate::identity::PeerId;
use crate::metrics::Metrics;
use crate::multiaddr::{Multiaddr, Protocol};
use crate::muxer::Stream;
use crate::protocols::{ReachabilityProbe, RelayRpc};

// ============================================================================
// Constants
// ============================================================================

/// Reservations held by one relay at a time.
/// SECURITY: prevents memory exhaustion from reservation spam.
pub const DEFAULT_MAX_RESERVATIONS: usize = 128;

pub const DEFAULT_RESERVATION_TTL: Duration = Duration::from_secs(60 * 60);

/// Concurrently spliced circuits per relay.
pub const DEFAULT_MAX_CIRCUITS: usize = 16;

pub const DEFAULT_DESIRED_RELAYS: usize = 2;

/// Renew a reservation once it is this close to expiry.
pub const DEFAULT_RENEW_MARGIN: Duration = Duration::from_secs(5 * 60);

/// A relay that refused or failed is not retried before this elapses.
pub const DEFAULT_CANDIDATE_BACKOFF: Duration = Duration::from_secs(60);

pub const DEFAULT_AUTORELAY_INTERVAL: Duration = Duration::from_secs(30);

/// Time allowed for a single reservation request.
pub const DEFAULT_RESERVATION_TIMEOUT: Duration = Duration::from_secs(10);

// ============================================================================
// Configuration
// ============================================================================

#[derive(Clone, Debug)]
pub struct RelayServiceConfig {
    /// Serve the hop protocol for other peers.
    pub enabled: bool,
    pub max_reservations: usize,
    pub reservation_ttl: Duration,
    pub max_circuits: usize,
}

impl Default for RelayServiceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_reservations: DEFAULT_MAX_RESERVATIONS,
            reservation_ttl: DEFAULT_RESERVATION_TTL,
            max_circuits: DEFAULT_MAX_CIRCUITS,
        }
    }
}

impl RelayServiceConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_reservations == 0 || self.max_circuits == 0 {
            return Err(ConfigError::Relay(
                "max_reservations and max_circuits must be non-zero".into(),
            ));
        }
        if self.reservation_ttl.is_zero() {
            return Err(ConfigError::ZeroDuration("relay_service.reservation_ttl"));
        }
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct AutoRelayConfig {
    pub enabled: bool,
    /// Relays tried before any discovered through the peerstore, as
    /// `<addr>/p2p/<relay>`.
    pub static_relays: Vec<Multiaddr>,
    pub desired_relays: usize,
    pub renew_margin: Duration,
    pub candidate_backoff: Duration,
    pub interval: Duration,
    pub reservation_timeout: Duration,
}

impl Default for AutoRelayConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            static_relays: Vec::new(),
            desired_relays: DEFAULT_DESIRED_RELAYS,
            renew_margin: DEFAULT_RENEW_MARGIN,
            candidate_backoff: DEFAULT_CANDIDATE_BACKOFF,
            interval: DEFAULT_AUTORELAY_INTERVAL,
            reservation_timeout: DEFAULT_RESERVATION_TIMEOUT,
        }
    }
}

impl AutoRelayConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.desired_relays == 0 {
            return Err(ConfigError::Relay("desired_relays must be non-zero".into()));
        }
        for addr in &self.static_relays {
            if addr.peer_id().is_none() {
                return Err(ConfigError::MissingPeerId(addr.clone()));
            }
        }
        if self.interval.is_zero() {
            return Err(ConfigError::ZeroDuration("auto_relay.interval"));
        }
        if self.reservation_timeout.is_zero() {
            return Err(ConfigError::ZeroDuration("auto_relay.reservation_timeout"));
        }
        // A renewal is only attempted on a tick, so the margin must span one.
        if self.renew_margin < self.interval {
            return Err(ConfigError::Relay(format!(
                "renew_margin ({:?}) must be at least one interval ({:?})",
                self.renew_margin, self.interval
            )));
        }
        if self.renew_margin >= DEFAULT_RESERVATION_TTL {
            return Err(ConfigError::Relay(format!(
                "renew_margin ({:?}) must be below the reservation ttl ({:?})",
                self.renew_margin, DEFAULT_RESERVATION_TTL
            )));
        }
        Ok(())
    }
}

// ============================================================================
// Reservation
// ============================================================================

/// A slot held on a relay, granting circuits toward the local peer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Reservation {
    pub relay: PeerId,
    pub expires_at: Instant,
    /// Circuit addresses through this relay, ending in `/p2p/<self>`.
    pub addrs: Vec<Multiaddr>,
}

impl Reservation {
    /// Build from a relay's grant. `relay_addrs` must end in `/p2p/<relay>`;
    /// others are ignored.
    pub fn from_grant(relay: PeerId, local: PeerId, ttl: Duration, relay_addrs: &[Multiaddr]) -> Self {
        let addrs = relay_addrs
            .iter()
            .filter(|a| a.peer_id() == Some(relay) && !a.is_circuit())
            .map(|a| circuit_addr(a, local))
            .collect();
        Self {
            relay,
            expires_at: Instant::now() + ttl,
            addrs,
        }
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }

    fn needs_renewal(&self, margin: Duration) -> bool {
        self.expires_at.saturating_duration_since(Instant::now()) <= margin
    }
}

/// `<relay addr>/p2p-circuit/p2p/<target>`.
pub fn circuit_addr(relay_addr: &Multiaddr, target: PeerId) -> Multiaddr {
    relay_addr.clone().with(Protocol::P2pCircuit).with(Protocol::P2p(target))
}

// ============================================================================
// Relay Service
// ============================================================================

/// Relay-side state: who holds a reservation and how many circuits run.
pub struct RelayService {
    config: RelayServiceConfig,
    reservations: Mutex<HashMap<PeerId, Instant>>,
    circuits: Arc<Semaphore>,
}

impl RelayService {
    pub fn new(config: RelayServiceConfig) -> Self {
        let circuits = Arc::new(Semaphore::new(config.max_circuits));
        Self {
            config,
            reservations: Mutex::new(HashMap::new()),
            circuits,
        }
    }

    /// Grant or refresh a reservation. Returns the TTL granted.
    ///
    /// Expired entries stay in the table until [`RelayService::sweep_expired`]
    /// reports them, but do not count against the limit.
    pub fn reserve(&self, peer: PeerId) -> Result<Duration, String> {
        let now = Instant::now();
        let mut table = self.reservations.lock();
        let live = table.values().filter(|e| **e > now).count();
        let holds = table.get(&peer).is_some_and(|e| *e > now);
        if !holds && live >= self.config.max_reservations {
            return Err("reservation table full".into());
        }
        table.insert(peer, now + self.config.reservation_ttl);
        debug!(peer = %peer, held = live + usize::from(!holds), "relay reservation granted");
        Ok(self.config.reservation_ttl)
    }

    /// Drop expired reservations and return their holders.
    pub fn sweep_expired(&self) -> Vec<PeerId> {
        let now = Instant::now();
        let mut expired = Vec::new();
        self.reservations.lock().retain(|peer, expires| {
            let live = *expires > now;
            if !live {
                expired.push(*peer);
            }
            live
        });
        expired
    }

    pub fn has_reservation(&self, peer: &PeerId) -> bool {
        self.reservations
            .lock()
            .get(peer)
            .is_some_and(|expires| *expires > Instant::now())
    }

    pub fn reservation_count(&self) -> usize {
        let now = Instant::now();
        self.reservations.lock().values().filter(|e| **e > now).count()
    }

    /// Admission for a new circuit; `None` when the relay is at capacity.
    pub fn circuit_permit(&self) -> Option<OwnedSemaphorePermit> {
        self.circuits.clone().try_acquire_owned().ok()
    }
}

/// Pump bytes both ways between two streams until both directions finish.
/// Returns the bytes moved from `a` to `b` and from `b` to `a`.
pub async fn splice(a: Stream, b: Stream) -> (u64, u64) {
    let (mut a_rd, mut a_wr) = a.split();
    let (mut b_rd, mut b_wr) = b.split();

    let forward = async move {
        let mut moved = 0u64;
        while let Ok(Some(chunk)) = a_rd.read().await {
            moved += chunk.len() as u64;
            if b_wr.write(&chunk).await.is_err() {
                b_wr.reset();
                return moved;
            }
        }
        let _ = b_wr.close().await;
        moved
    };
    let backward = async move {
        let mut moved = 0u64;
        while let Ok(Some(chunk)) = b_rd.read().await {
            moved += chunk.len() as u64;
            if a_wr.write(&chunk).await.is_err() {
                a_wr.reset();
                return moved;
            }
        }
        let _ = a_wr.close().await;
        moved
    };
    tokio::join!(forward, backward)
}

// ============================================================================
// AutoRelay
// ============================================================================

struct AutoRelayState {
    reservations: HashMap<PeerId, Reservation>,
    /// Candidate -> earliest retry.
    backoff: HashMap<PeerId, Instant>,
    degraded_logged: bool,
}

/// Handle to the AutoRelay task. The task stops when the handle is dropped
/// or the host token is cancelled.
pub struct AutoRelay {
    addrs: watch::Receiver<Vec<Multiaddr>>,
    reservations: Arc<Mutex<Vec<Reservation>>>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl AutoRelay {
    pub fn spawn<R: RelayRpc, P: ReachabilityProbe>(
        rpc: Arc<R>,
        probe: Arc<P>,
        config: AutoRelayConfig,
        metrics: Arc<Metrics>,
        cancel: CancellationToken,
    ) -> Self {
        let cancel = cancel.child_token();
        let (addrs_tx, addrs) = watch::channel(Vec::new());
        let reservations = Arc::new(Mutex::new(Vec::new()));

        let worker = AutoRelayWorker {
            rpc,
            probe,
            config,
            metrics,
            addrs_tx,
            published: reservations.clone(),
            state: AutoRelayState {
                reservations: HashMap::new(),
                backoff: HashMap::new(),
                degraded_logged: false,
            },
        };
        let task = tokio::spawn(worker.run(cancel.clone()));
        Self {
            addrs,
            reservations,
            cancel,
            task,
        }
    }

    /// Circuit addresses currently advertised.
    pub fn addrs(&self) -> Vec<Multiaddr> {
        self.addrs.borrow().clone()
    }

    /// Receiver notified whenever the advertised circuit addresses change.
    pub fn watch_addrs(&self) -> watch::Receiver<Vec<Multiaddr>> {
        self.addrs.clone()
    }

    pub fn reservations(&self) -> Vec<Reservation> {
        self.reservations.lock().clone()
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for AutoRelay {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct AutoRelayWorker<R: RelayRpc, P: ReachabilityProbe> {
    rpc: Arc<R>,
    probe: Arc<P>,
    config: AutoRelayConfig,
    metrics: Arc<Metrics>,
    addrs_tx: watch::Sender<Vec<Multiaddr>>,
    published: Arc<Mutex<Vec<Reservation>>>,
    state: AutoRelayState,
}

impl<R: RelayRpc, P: ReachabilityProbe> AutoRelayWorker<R, P> {
    async fn run(mut self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.tick() => {}
            }
        }
        self.release_all();
        self.publish();
        debug!("autorelay stopped");
    }

    async fn tick(&mut self) {
        match self.probe.probe().await {
            Reachability::Public => {
                if !self.state.reservations.is_empty() {
                    info!(count = self.state.reservations.len(), "publicly reachable, dropping relay reservations");
                    self.release_all();
                    self.publish();
                }
            }
            Reachability::Unknown => trace!("reachability unknown, keeping relay state"),
            Reachability::Private => self.maintain().await,
        }
    }

    async fn maintain(&mut self) {
        let expired: Vec<PeerId> = self
            .state
            .reservations
            .values()
            .filter(|r| r.is_expired())
            .map(|r| r.relay)
            .collect();
        for relay in expired {
            debug!(relay = %relay, "relay reservation expired");
            self.release(relay);
        }

        let renewals: Vec<PeerId> = self
            .state
            .reservations
            .values()
            .filter(|r| r.needs_renewal(self.config.renew_margin))
            .map(|r| r.relay)
            .collect();
        for relay in renewals {
            match self.reserve(relay).await {
                Ok(r) => {
                    trace!(relay = %relay, "relay reservation renewed");
                    self.state.reservations.insert(relay, r);
                }
                Err(e) => {
                    debug!(relay = %relay, error = %e, "relay renewal failed");
                    self.release(relay);
                    self.back_off(relay);
                }
            }
        }

        let now = Instant::now();
        self.state.backoff.retain(|_, until| *until > now);
        if self.state.reservations.len() < self.config.desired_relays {
            let candidates: Vec<PeerId> = self
                .rpc
                .relay_candidates()
                .into_iter()
                .filter(|c| !self.state.reservations.contains_key(c) && !self.state.backoff.contains_key(c))
                .collect();
            for relay in candidates {
                if self.state.reservations.len() >= self.config.desired_relays {
                    break;
                }
                match self.reserve(relay).await {
                    Ok(r) => {
                        info!(relay = %relay, addrs = r.addrs.len(), "relay reservation acquired");
                        self.state.reservations.insert(relay, r);
                    }
                    Err(e) => {
                        debug!(relay = %relay, error = %e, "relay reservation failed");
                        self.back_off(relay);
                    }
                }
            }
        }

        if self.state.reservations.is_empty() {
            if !self.state.degraded_logged {
                warn!("no relay reservation available, reachability reduced to direct dials");
                self.state.degraded_logged = true;
            }
        } else {
            self.state.degraded_logged = false;
        }
        self.publish();
    }

    async fn reserve(&self, relay: PeerId) -> Result<Reservation> {
        tokio::time::timeout(self.config.reservation_timeout, self.rpc.reserve(relay))
            .await
            .map_err(|_| anyhow!("reservation with {relay} timed out"))?
    }

    fn release(&mut self, relay: PeerId) {
        if self.state.reservations.remove(&relay).is_some() {
            self.rpc.release(relay);
        }
    }

    fn release_all(&mut self) {
        let held: Vec<PeerId> = self.state.reservations.keys().copied().collect();
        for relay in held {
            self.release(relay);
        }
    }

    fn back_off(&mut self, relay: PeerId) {
        self.state
            .backoff
            .insert(relay, Instant::now() + self.config.candidate_backoff);
    }

    fn publish(&self) {
        let mut reservations: Vec<Reservation> = self.state.reservations.values().cloned().collect();
        reservations.sort_by_key(|r| r.relay);
        let addrs: Vec<Multiaddr> = reservations.iter().flat_map(|r| r.addrs.iter().cloned()).collect();
        Metrics::set(&self.metrics.relay_reservations, reservations.len() as u64);
        *self.published.lock() = reservations;
        self.addrs_tx.send_if_modified(|current| {
            if *current == addrs {
                false
            } else {
                *current = addrs;
                true
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn relay_addr(port: u64, relay: PeerId) -> Multiaddr {
        Multiaddr::memory(port).with_peer_id(relay)
    }

    struct MockRelays {
        local: PeerId,
        candidates: Vec<PeerId>,
        refusing: Mutex<HashSet<PeerId>>,
        ttl: Duration,
        calls: AtomicUsize,
        released: Mutex<Vec<PeerId>>,
    }

    impl MockRelays {
        fn new(candidates: Vec<PeerId>, ttl: Duration) -> Arc<Self> {
            Arc::new(Self {
                local: PeerId::random(),
                candidates,
                refusing: Mutex::new(HashSet::new()),
                ttl,
                calls: AtomicUsize::new(0),
                released: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl RelayRpc for MockRelays {
        fn relay_candidates(&self) -> Vec<PeerId> {
            self.candidates.clone()
        }

        async fn reserve(&self, relay: PeerId) -> Result<Reservation> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.refusing.lock().contains(&relay) {
                return Err(anyhow!("refused"));
            }
            let port = self.candidates.iter().position(|c| *c == relay).unwrap_or(0) as u64 + 100;
            Ok(Reservation::from_grant(relay, self.local, self.ttl, &[relay_addr(port, relay)]))
        }

        fn release(&self, relay: PeerId) {
            self.released.lock().push(relay);
        }
    }

    struct FixedReachability(Mutex<Reachability>);

    #[async_trait]
    impl ReachabilityProbe for FixedReachability {
        async fn probe(&self) -> Reachability {
            *self.0.lock()
        }
    }

    fn config() -> AutoRelayConfig {
        AutoRelayConfig {
            interval: Duration::from_secs(1),
            ..Default::default()
        }
    }

    #[test]
    fn grant_builds_circuit_addrs() {
        let relay = PeerId::random();
        let local = PeerId::random();
        let r = Reservation::from_grant(
            relay,
            local,
            Duration::from_secs(10),
            &[relay_addr(5, relay), Multiaddr::memory(6), relay_addr(7, PeerId::random())],
        );
        assert_eq!(r.addrs.len(), 1);
        let (via, relay_id, target) = r.addrs[0].split_circuit().unwrap();
        assert_eq!(via, relay_addr(5, relay));
        assert_eq!(relay_id, relay);
        assert_eq!(target, Some(local));
    }

    #[tokio::test(start_paused = true)]
    async fn service_reservations_expire_and_are_bounded() {
        let service = RelayService::new(RelayServiceConfig {
            enabled: true,
            max_reservations: 2,
            reservation_ttl: Duration::from_secs(60),
            max_circuits: 1,
        });
        let (a, b, c) = (PeerId::random(), PeerId::random(), PeerId::random());
        assert_eq!(service.reserve(a), Ok(Duration::from_secs(60)));
        service.reserve(b).unwrap();
        assert!(service.reserve(c).is_err());
        // Refreshing an existing holder is always allowed.
        assert!(service.reserve(a).is_ok());
        assert!(service.has_reservation(&a));

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(!service.has_reservation(&a));
        assert_eq!(service.reservation_count(), 0);
        assert!(service.reserve(c).is_ok());

        let mut expired = service.sweep_expired();
        expired.sort();
        let mut expected = vec![a, b];
        expected.sort();
        assert_eq!(expired, expected);
        assert!(service.sweep_expired().is_empty());
        assert!(service.has_reservation(&c));

        let permit = service.circuit_permit();
        assert!(permit.is_some());
        assert!(service.circuit_permit().is_none());
        drop(permit);
        assert!(service.circuit_permit().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn private_host_acquires_desired_relays() {
        let candidates: Vec<PeerId> = (0..4).map(|_| PeerId::random()).collect();
        let rpc = MockRelays::new(candidates.clone(), Duration::from_secs(3600));
        rpc.refusing.lock().insert(candidates[0]);
        let probe = Arc::new(FixedReachability(Mutex::new(Reachability::Private)));
        let metrics = Arc::new(Metrics::default());
        let auto = AutoRelay::spawn(rpc.clone(), probe, config(), metrics.clone(), CancellationToken::new());

        let mut watch = auto.watch_addrs();
        watch.changed().await.unwrap();
        let held: HashSet<PeerId> = auto.reservations().iter().map(|r| r.relay).collect();
        assert_eq!(held, HashSet::from([candidates[1], candidates[2]]));
        assert_eq!(auto.addrs().len(), 2);
        assert!(auto.addrs().iter().all(|a| a.is_circuit()));
        assert_eq!(metrics.snapshot().relay_reservations, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn reservations_renewed_before_expiry() {
        let candidates = vec![PeerId::random()];
        let rpc = MockRelays::new(candidates, Duration::from_secs(600));
        let probe = Arc::new(FixedReachability(Mutex::new(Reachability::Private)));
        let auto = AutoRelay::spawn(
            rpc.clone(),
            probe,
            AutoRelayConfig {
                interval: Duration::from_secs(60),
                desired_relays: 1,
                ..Default::default()
            },
            Arc::new(Metrics::default()),
            CancellationToken::new(),
        );
        tokio::time::sleep(Duration::from_secs(1)).await;
        let first = auto.reservations()[0].expires_at;
        assert_eq!(rpc.calls.load(Ordering::SeqCst), 1);

        // TTL 600s, margin 300s: the tick at 300s renews.
        tokio::time::sleep(Duration::from_secs(301)).await;
        let renewed = auto.reservations()[0].expires_at;
        assert!(renewed > first);
        assert!(rpc.calls.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn public_host_drops_reservations() {
        let rpc = MockRelays::new(vec![PeerId::random()], Duration::from_secs(3600));
        let probe = Arc::new(FixedReachability(Mutex::new(Reachability::Private)));
        let auto = AutoRelay::spawn(rpc.clone(), probe.clone(), config(), Arc::new(Metrics::default()), CancellationToken::new());
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(auto.reservations().len(), 1);

        let relay = auto.reservations()[0].relay;
        assert!(rpc.released.lock().is_empty());

        *probe.0.lock() = Reachability::Public;
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(auto.reservations().is_empty());
        assert!(auto.addrs().is_empty());
        assert_eq!(*rpc.released.lock(), vec![relay]);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_renewal_releases_relay() {
        let relay = PeerId::random();
        let rpc = MockRelays::new(vec![relay], Duration::from_secs(600));
        let probe = Arc::new(FixedReachability(Mutex::new(Reachability::Private)));
        let auto = AutoRelay::spawn(
            rpc.clone(),
            probe,
            AutoRelayConfig {
                interval: Duration::from_secs(60),
                desired_relays: 1,
                ..Default::default()
            },
            Arc::new(Metrics::default()),
            CancellationToken::new(),
        );
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(auto.reservations().len(), 1);

        rpc.refusing.lock().insert(relay);
        tokio::time::sleep(Duration::from_secs(301)).await;
        assert!(auto.reservations().is_empty());
        assert_eq!(*rpc.released.lock(), vec![relay]);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_candidates_degrade_and_back_off() {
        let candidates = vec![PeerId::random(), PeerId::random()];
        let rpc = MockRelays::new(candidates.clone(), Duration::from_secs(3600));
        rpc.refusing.lock().extend(candidates.iter().copied());
        let probe = Arc::new(FixedReachability(Mutex::new(Reachability::Private)));
        let auto = AutoRelay::spawn(rpc.clone(), probe, config(), Arc::new(Metrics::default()), CancellationToken::new());

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(auto.reservations().is_empty());
        // Each refusing relay was tried once and is now backing off.
        assert_eq!(rpc.calls.load(Ordering::SeqCst), 2);
        assert!(!auto.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_ends_task_and_withdraws_addrs() {
        let rpc = MockRelays::new(vec![PeerId::random()], Duration::from_secs(3600));
        let probe = Arc::new(FixedReachability(Mutex::new(Reachability::Private)));
        let auto = AutoRelay::spawn(rpc, probe, config(), Arc::new(Metrics::default()), CancellationToken::new());
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(auto.addrs().len(), 1);

        auto.stop();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(auto.is_finished());
        assert!(auto.addrs().is_empty());
    }

    #[test]
    fn config_validation() {
        assert!(AutoRelayConfig::default().validate().is_ok());
        let bad = AutoRelayConfig {
            static_relays: vec![Multiaddr::memory(1)],
            ..Default::default()
        };
        assert!(matches!(bad.validate(), Err(ConfigError::MissingPeerId(_))));
        let bad = AutoRelayConfig {
            interval: Duration::from_secs(60),
            renew_margin: Duration::from_secs(30),
            ..Default::default()
        };
        assert!(matches!(bad.validate(), Err(ConfigError::Relay(_))));
        let bad = AutoRelayConfig {
            renew_margin: DEFAULT_RESERVATION_TTL,
            ..Default::default()
        };
        assert!(matches!(bad.validate(), Err(ConfigError::Relay(_))));
        assert!(RelayServiceConfig::default().validate().is_ok());
        let bad = RelayServiceConfig {
            max_circuits: 0,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }
}
