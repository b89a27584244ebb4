//! # Peerstore
//!
//! In-memory record of known peers: their addresses (each with its own
//! expiry), public keys, and the stream protocols they advertise.
//!
//! ## Concurrency
//!
//! Records live in a sharded [`DashMap`]. Mutations of one peer are
//! serialized by the shard lock for that key; reads of different peers run
//! concurrently. No lock is ever held across I/O: every method is synchronous.
//!
//! ## Expiry
//!
//! Expired addresses are filtered out of every read, so [`Peerstore::addrs_for`]
//! never returns an address past its TTL. [`Peerstore::gc`] sweeps them eagerly
//! and forgets peers left without a live address; the host runs it every
//! [`DEFAULT_GC_INTERVAL`] through [`Peerstore::spawn_gc`].

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::identity::{PeerId, PrivateKey, PublicKey};
use crate::multiaddr::Multiaddr;

// ============================================================================
// Address TTLs
// ============================================================================

/// Addresses that never expire (the local listen addresses, static relays).
pub const PERMANENT_ADDR_TTL: Duration = Duration::MAX;

/// Address of a peer we currently hold a connection to.
pub const CONNECTED_ADDR_TTL: Duration = Duration::from_secs(60 * 60 * 24 * 365);

/// Kept for a while after disconnecting so a redial can succeed.
pub const RECENTLY_CONNECTED_ADDR_TTL: Duration = Duration::from_secs(10 * 60);

/// Addresses learned from routing queries.
pub const PROVIDER_ADDR_TTL: Duration = Duration::from_secs(30 * 60);

/// Short-lived addresses (observed addresses, unverified hints).
pub const TEMP_ADDR_TTL: Duration = Duration::from_secs(2 * 60);

/// Per-peer address cap; the oldest-expiring entry is dropped first.
pub const MAX_ADDRS_PER_PEER: usize = 32;

/// Per-peer advertised protocol cap.
pub const MAX_PROTOCOLS_PER_PEER: usize = 64;

/// How often the host sweeps expired addresses.
pub const DEFAULT_GC_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PeerstoreError {
    #[error("public key does not derive to peer {0}")]
    KeyMismatch(PeerId),
    #[error("private key does not match the public key of {0}")]
    PrivateKeyMismatch(PeerId),
}

// ============================================================================
// Records
// ============================================================================

/// Point-in-time view of a peer, safe to send over the wire.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRecord {
    pub peer_id: PeerId,
    pub addrs: Vec<Multiaddr>,
    pub public_key: Option<PublicKey>,
}

impl PeerRecord {
    pub fn new(peer_id: PeerId, addrs: Vec<Multiaddr>) -> Self {
        Self {
            peer_id,
            addrs,
            public_key: None,
        }
    }

    /// A record is only trusted with a key that actually derives to its id.
    pub fn key_matches(&self) -> bool {
        self.public_key
            .map(|k| k.to_peer_id() == self.peer_id)
            .unwrap_or(true)
    }
}

struct AddrEntry {
    addr: Multiaddr,
    /// TTL class the current deadline was derived from.
    ttl: Duration,
    /// `None` means permanent.
    expires_at: Option<Instant>,
}

impl AddrEntry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|t| t > now)
    }
}

#[derive(Default)]
struct PeerEntry {
    addrs: Vec<AddrEntry>,
    public_key: Option<PublicKey>,
    private_key: Option<PrivateKey>,
    protocols: HashSet<String>,
}

fn expiry_for(now: Instant, ttl: Duration) -> Option<Instant> {
    if ttl == PERMANENT_ADDR_TTL {
        None
    } else {
        now.checked_add(ttl)
    }
}

// ============================================================================
// Peerstore
// ============================================================================

#[derive(Default)]
pub struct Peerstore {
    peers: DashMap<PeerId, PeerEntry>,
}

impl Peerstore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Union `addrs` into the peer's address set.
    ///
    /// Re-adding a known address keeps its position and extends its expiry to
    /// the later of the old and new deadlines.
    pub fn add_addrs(&self, peer: &PeerId, addrs: &[Multiaddr], ttl: Duration) {
        if addrs.is_empty() || ttl.is_zero() {
            return;
        }
        let now = Instant::now();
        let new_expiry = expiry_for(now, ttl);
        let mut entry = self.peers.entry(*peer).or_default();

        for addr in addrs {
            let addr = addr.without_peer_id();
            if let Some(existing) = entry.addrs.iter_mut().find(|e| e.addr == addr) {
                let extends = match (existing.expires_at, new_expiry) {
                    (None, _) => false,
                    (Some(_), None) => true,
                    (Some(a), Some(b)) => b > a,
                };
                if extends {
                    existing.expires_at = new_expiry;
                    existing.ttl = ttl;
                }
                continue;
            }
            entry.addrs.push(AddrEntry {
                addr,
                ttl,
                expires_at: new_expiry,
            });
        }

        entry.addrs.retain(|e| e.is_live(now));
        while entry.addrs.len() > MAX_ADDRS_PER_PEER {
            // Permanent entries sort last, so the soonest-expiring one goes first.
            let Some(victim) = entry
                .addrs
                .iter()
                .enumerate()
                .min_by_key(|(_, e)| e.expires_at.map(|t| (0, Some(t))).unwrap_or((1, None)))
                .map(|(i, _)| i)
            else {
                break;
            };
            entry.addrs.remove(victim);
        }
        trace!(peer = %peer, count = entry.addrs.len(), "peerstore addrs updated");
    }

    /// Move every address of `peer` whose TTL equals `from` to `to`. Used to
    /// demote connected addresses when the last connection closes.
    pub fn update_addr_ttl(&self, peer: &PeerId, from: Duration, to: Duration) {
        let now = Instant::now();
        if let Some(mut entry) = self.peers.get_mut(peer) {
            for e in entry.addrs.iter_mut().filter(|e| e.ttl == from) {
                e.ttl = to;
                e.expires_at = expiry_for(now, to);
            }
        }
    }

    /// Record the keys of `peer`. The public key must derive to `peer`; a
    /// private key, when given, must belong to that public key.
    pub fn add_keys(
        &self,
        peer: &PeerId,
        public_key: PublicKey,
        private_key: Option<PrivateKey>,
    ) -> Result<(), PeerstoreError> {
        if public_key.to_peer_id() != *peer {
            return Err(PeerstoreError::KeyMismatch(*peer));
        }
        if let Some(private) = &private_key
            && private.public() != public_key
        {
            return Err(PeerstoreError::PrivateKeyMismatch(*peer));
        }

        let mut entry = self.peers.entry(*peer).or_default();
        entry.public_key = Some(public_key);
        if private_key.is_some() {
            entry.private_key = private_key;
        }
        Ok(())
    }

    pub fn add_protocols(&self, peer: &PeerId, protocols: &[String]) {
        let mut entry = self.peers.entry(*peer).or_default();
        for p in protocols {
            if entry.protocols.len() >= MAX_PROTOCOLS_PER_PEER {
                break;
            }
            entry.protocols.insert(p.clone());
        }
    }

    pub fn set_protocols(&self, peer: &PeerId, protocols: &[String]) {
        let mut entry = self.peers.entry(*peer).or_default();
        entry.protocols.clear();
        entry
            .protocols
            .extend(protocols.iter().take(MAX_PROTOCOLS_PER_PEER).cloned());
    }

    pub fn supports_protocol(&self, peer: &PeerId, protocol: &str) -> bool {
        self.peers
            .get(peer)
            .map(|e| e.protocols.contains(protocol))
            .unwrap_or(false)
    }

    pub fn peers_supporting(&self, protocol: &str) -> Vec<PeerId> {
        self.peers
            .iter()
            .filter(|e| e.protocols.contains(protocol))
            .map(|e| *e.key())
            .collect()
    }

    pub fn peers(&self) -> HashSet<PeerId> {
        self.peers.iter().map(|e| *e.key()).collect()
    }

    /// Live addresses of `peer` in insertion order; empty if unknown.
    pub fn addrs_for(&self, peer: &PeerId) -> Vec<Multiaddr> {
        let now = Instant::now();
        self.peers
            .get(peer)
            .map(|e| {
                e.addrs
                    .iter()
                    .filter(|a| a.is_live(now))
                    .map(|a| a.addr.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn public_key_for(&self, peer: &PeerId) -> Option<PublicKey> {
        self.peers.get(peer).and_then(|e| e.public_key)
    }

    /// `None` for every peer except the local identity.
    pub fn private_key_for(&self, peer: &PeerId) -> Option<PrivateKey> {
        self.peers.get(peer).and_then(|e| e.private_key.clone())
    }

    pub fn peer_record(&self, peer: &PeerId) -> Option<PeerRecord> {
        let now = Instant::now();
        self.peers.get(peer).map(|e| PeerRecord {
            peer_id: *peer,
            addrs: e
                .addrs
                .iter()
                .filter(|a| a.is_live(now))
                .map(|a| a.addr.clone())
                .collect(),
            public_key: e.public_key,
        })
    }

    pub fn remove_peer(&self, peer: &PeerId) {
        self.peers.remove(peer);
    }

    /// Drop expired addresses, then every peer without a live address (its
    /// keys and protocols go with it). Entries holding a private key are the
    /// local identity and are kept. Returns the number of addresses removed.
    pub fn gc(&self) -> usize {
        let now = Instant::now();
        let mut removed = 0;
        self.peers.retain(|_, entry| {
            let before = entry.addrs.len();
            entry.addrs.retain(|a| a.is_live(now));
            removed += before - entry.addrs.len();
            !entry.addrs.is_empty() || entry.private_key.is_some()
        });
        removed
    }

    /// Run [`Peerstore::gc`] every `interval` until `cancel` fires.
    pub fn spawn_gc(self: &Arc<Self>, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let removed = store.gc();
                if removed > 0 {
                    debug!(removed, peers = store.len(), "peerstore swept");
                }
            }
        })
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;

    fn addr(port: u64) -> Multiaddr {
        Multiaddr::memory(port)
    }

    #[tokio::test(start_paused = true)]
    async fn add_addrs_is_idempotent_union() {
        let store = Peerstore::new();
        let peer = PeerId::from_bytes([1; 32]);

        store.add_addrs(&peer, &[addr(1), addr(2)], Duration::from_secs(60));
        store.add_addrs(&peer, &[addr(2), addr(3)], Duration::from_secs(60));
        store.add_addrs(&peer, &[addr(1)], Duration::from_secs(60));

        assert_eq!(store.addrs_for(&peer), vec![addr(1), addr(2), addr(3)]);
        assert!(store.peers().contains(&peer));
    }

    #[tokio::test(start_paused = true)]
    async fn expired_addresses_are_never_returned() {
        let store = Peerstore::new();
        let peer = PeerId::from_bytes([2; 32]);

        store.add_addrs(&peer, &[addr(1)], Duration::from_secs(10));
        store.add_addrs(&peer, &[addr(2)], Duration::from_secs(100));

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(store.addrs_for(&peer), vec![addr(2)]);

        tokio::time::advance(Duration::from_secs(100)).await;
        assert!(store.addrs_for(&peer).is_empty());
        assert_eq!(store.gc(), 2);
        assert!(!store.peers().contains(&peer));
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_refreshes_ttl() {
        let store = Peerstore::new();
        let peer = PeerId::from_bytes([3; 32]);

        store.add_addrs(&peer, &[addr(1)], Duration::from_secs(10));
        tokio::time::advance(Duration::from_secs(8)).await;
        store.add_addrs(&peer, &[addr(1)], Duration::from_secs(10));
        tokio::time::advance(Duration::from_secs(8)).await;

        assert_eq!(store.addrs_for(&peer), vec![addr(1)]);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_addresses_survive() {
        let store = Peerstore::new();
        let peer = PeerId::from_bytes([4; 32]);

        store.add_addrs(&peer, &[addr(9)], PERMANENT_ADDR_TTL);
        tokio::time::advance(Duration::from_secs(60 * 60 * 24 * 400)).await;
        assert_eq!(store.addrs_for(&peer), vec![addr(9)]);
    }

    #[tokio::test(start_paused = true)]
    async fn connected_ttl_demotes_on_disconnect() {
        let store = Peerstore::new();
        let peer = PeerId::from_bytes([5; 32]);

        store.add_addrs(&peer, &[addr(1)], CONNECTED_ADDR_TTL);
        store.update_addr_ttl(&peer, CONNECTED_ADDR_TTL, RECENTLY_CONNECTED_ADDR_TTL);

        tokio::time::advance(RECENTLY_CONNECTED_ADDR_TTL + Duration::from_secs(1)).await;
        assert!(store.addrs_for(&peer).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn background_gc_forgets_unreachable_peers() {
        let store = Arc::new(Peerstore::new());
        let local = Keypair::generate_ed25519().unwrap();
        store
            .add_keys(&local.peer_id(), local.public(), Some(local.private().clone()))
            .unwrap();

        let remote = Keypair::generate_ed25519().unwrap();
        let peer = remote.peer_id();
        store.add_keys(&peer, remote.public(), None).unwrap();
        store.add_protocols(&peer, &["/chat/1.0.0".to_string()]);
        store.add_addrs(&peer, &[addr(1)], Duration::from_secs(10));
        let lasting = PeerId::from_bytes([3; 32]);
        store.add_addrs(&lasting, &[addr(2)], PERMANENT_ADDR_TTL);
        assert_eq!(store.len(), 3);

        let cancel = CancellationToken::new();
        let task = store.spawn_gc(Duration::from_secs(60), cancel.clone());
        tokio::time::sleep(Duration::from_secs(61)).await;

        assert!(!store.peers().contains(&peer));
        assert!(store.public_key_for(&peer).is_none());
        assert!(store.peers_supporting("/chat/1.0.0").is_empty());
        assert!(store.peers().contains(&lasting));
        assert!(store.private_key_for(&local.peer_id()).is_some());
        assert_eq!(store.len(), 2);

        cancel.cancel();
        task.await.unwrap();
    }

    #[test]
    fn add_keys_checks_derivation() {
        let store = Peerstore::new();
        let local = Keypair::generate_ed25519().unwrap();
        let other = Keypair::generate_ed25519().unwrap();

        assert_eq!(
            store.add_keys(&other.peer_id(), local.public(), None),
            Err(PeerstoreError::KeyMismatch(other.peer_id()))
        );
        assert_eq!(
            store.add_keys(&local.peer_id(), local.public(), Some(other.private().clone())),
            Err(PeerstoreError::PrivateKeyMismatch(local.peer_id()))
        );

        store
            .add_keys(&local.peer_id(), local.public(), Some(local.private().clone()))
            .unwrap();
        store.add_keys(&other.peer_id(), other.public(), None).unwrap();

        assert!(store.private_key_for(&local.peer_id()).is_some());
        assert!(store.private_key_for(&other.peer_id()).is_none());
        assert_eq!(store.public_key_for(&other.peer_id()), Some(other.public()));
    }

    #[test]
    fn unknown_peer_has_no_addresses() {
        let store = Peerstore::new();
        assert!(store.addrs_for(&PeerId::from_bytes([9; 32])).is_empty());
        assert!(store.private_key_for(&PeerId::from_bytes([9; 32])).is_none());
    }

    #[test]
    fn protocol_queries() {
        let store = Peerstore::new();
        let relay = PeerId::from_bytes([6; 32]);
        let plain = PeerId::from_bytes([7; 32]);

        store.add_protocols(&relay, &["/hop".to_string(), "/kad".to_string()]);
        store.add_protocols(&plain, &["/kad".to_string()]);

        assert!(store.supports_protocol(&relay, "/hop"));
        assert!(!store.supports_protocol(&plain, "/hop"));
        assert_eq!(store.peers_supporting("/hop"), vec![relay]);
    }
}
