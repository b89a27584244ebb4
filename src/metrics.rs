//! Counters shared by every component of a host.
//!
//! Components bump [`Metrics`] with relaxed atomics; [`MetricsSnapshot`] is the
//! read-only view handed to callers, completed by the host with gauges it
//! owns (connection count, mesh sizes).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct Metrics {
    pub handshakes_succeeded: AtomicU64,
    pub handshakes_failed: AtomicU64,
    pub discovery_cache_hits: AtomicU64,
    pub discovery_cache_misses: AtomicU64,
    pub pubsub_invalid_signatures: AtomicU64,
    pub pubsub_duplicates: AtomicU64,
    pub pubsub_delivered: AtomicU64,
    pub relay_reservations: AtomicU64,
    pub connections_trimmed: AtomicU64,
}

impl Metrics {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set(gauge: &AtomicU64, value: u64) {
        gauge.store(value, Ordering::Relaxed);
    }

    /// Counter-only snapshot; gauges are left at their defaults.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            connections: 0,
            mesh_sizes: HashMap::new(),
            discovery_cache_hits: load(&self.discovery_cache_hits),
            discovery_cache_misses: load(&self.discovery_cache_misses),
            handshakes_succeeded: load(&self.handshakes_succeeded),
            handshakes_failed: load(&self.handshakes_failed),
            pubsub_invalid_signatures: load(&self.pubsub_invalid_signatures),
            pubsub_duplicates: load(&self.pubsub_duplicates),
            pubsub_delivered: load(&self.pubsub_delivered),
            relay_reservations: load(&self.relay_reservations),
            connections_trimmed: load(&self.connections_trimmed),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub connections: usize,
    /// Mesh size per joined topic.
    pub mesh_sizes: HashMap<String, usize>,
    pub discovery_cache_hits: u64,
    pub discovery_cache_misses: u64,
    pub handshakes_succeeded: u64,
    pub handshakes_failed: u64,
    pub pubsub_invalid_signatures: u64,
    pub pubsub_duplicates: u64,
    pub pubsub_delivered: u64,
    /// Relay reservations currently held.
    pub relay_reservations: u64,
    pub connections_trimmed: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_counters() {
        let m = Metrics::default();
        Metrics::incr(&m.handshakes_succeeded);
        Metrics::incr(&m.handshakes_succeeded);
        Metrics::incr(&m.pubsub_duplicates);
        Metrics::set(&m.relay_reservations, 2);

        let snap = m.snapshot();
        assert_eq!(snap.handshakes_succeeded, 2);
        assert_eq!(snap.pubsub_duplicates, 1);
        assert_eq!(snap.relay_reservations, 2);
        assert_eq!(snap.handshakes_failed, 0);
    }
}
