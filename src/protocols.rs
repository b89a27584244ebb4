//! Protocol identifiers and the trait seams between components.
//!
//! Components depend on these traits rather than on the host, so each can be
//! driven by a mock network in unit tests and the host can implement all of
//! them on one cheap-to-clone handle.
//!
//! | Consumer | Trait | Purpose |
//! |----------|-------|---------|
//! | `dht` | [`KadRpc`] | Routing RPCs to remote peers |
//! | `discovery` | [`Discovery`] | Advertise / find peers for a key |
//! | `host` | [`PeerRouting`] | Locate a peer's addresses |
//! | `gossipsub` | [`PubSubTransport`] | Non-blocking per-peer RPC delivery |
//! | `relay` | [`RelayRpc`] | Relay candidates and reservations |
//! | `relay` | [`ReachabilityProbe`] | Public / private determination |
//! | `autonat` | [`DialBackRpc`] | Ask peers to dial us back |
//! | `autonat` | [`DialBackDialer`] | Serve dial-back requests |

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use crate::autonat::Reachability;
use crate::dht::Key;
use crate::identity::PeerId;
use crate::messages::{DialBackResponse, PubSubRpc};
use crate::multiaddr::Multiaddr;
use crate::peerstore::PeerRecord;
use crate::relay::Reservation;

// ============================================================================
// Stream Protocol Identifiers
// ============================================================================

pub const IDENTIFY_PROTOCOL: &str = "/peerweave/id/1.0.0";
pub const KAD_PROTOCOL: &str = "/peerweave/kad/1.0.0";
pub const GOSSIPSUB_PROTOCOL: &str = "/peerweave/gossipsub/1.1.0";
pub const RELAY_HOP_PROTOCOL: &str = "/peerweave/relay/hop/1.0.0";
pub const RELAY_STOP_PROTOCOL: &str = "/peerweave/relay/stop/1.0.0";
pub const AUTONAT_PROTOCOL: &str = "/peerweave/autonat/1.0.0";

// ============================================================================
// Traits
// ============================================================================

/// Routing RPCs issued by the DHT against remote peers.
#[async_trait]
pub trait KadRpc: Send + Sync + 'static {
    /// Liveness check used before evicting a routing entry.
    async fn ping(&self, to: &PeerRecord) -> Result<()>;

    async fn find_node(&self, to: &PeerRecord, target: PeerId) -> Result<Vec<PeerRecord>>;

    /// Returns (providers, closer peers).
    async fn get_providers(&self, to: &PeerRecord, key: Key) -> Result<(Vec<PeerRecord>, Vec<PeerRecord>)>;

    async fn add_provider(&self, to: &PeerRecord, key: Key, provider: PeerRecord) -> Result<()>;
}

/// Advertise and discover peers interested in a key.
#[async_trait]
pub trait Discovery: Send + Sync + 'static {
    /// Announce the local peer under `key`. Returns the TTL actually granted.
    async fn advertise(&self, key: &str, ttl: Duration) -> Result<Duration>;

    async fn find_peers(&self, key: &str, limit: usize) -> Result<Vec<PeerRecord>>;
}

#[async_trait]
pub trait PeerRouting: Send + Sync + 'static {
    async fn find_peer(&self, peer: PeerId) -> Result<Option<PeerRecord>>;
}

/// Delivery of pubsub RPCs. `send` must not block: implementations queue the
/// RPC for a per-peer writer and report whether it was accepted.
pub trait PubSubTransport: Send + Sync + 'static {
    fn send(&self, to: &PeerId, rpc: PubSubRpc) -> bool;
}

/// What AutoRelay needs from the host.
#[async_trait]
pub trait RelayRpc: Send + Sync + 'static {
    /// Known peers advertising the relay hop protocol.
    fn relay_candidates(&self) -> Vec<PeerId>;

    async fn reserve(&self, relay: PeerId) -> Result<Reservation>;

    /// The reservation with `relay` was dropped or lapsed.
    fn release(&self, relay: PeerId);
}

#[async_trait]
pub trait ReachabilityProbe: Send + Sync + 'static {
    async fn probe(&self) -> Reachability;
}

/// Client side of the reachability probe.
#[async_trait]
pub trait DialBackRpc: Send + Sync + 'static {
    /// Connected peers that speak the probe protocol.
    fn dial_back_peers(&self) -> Vec<PeerId>;

    /// Addresses we want confirmed.
    fn listen_addrs(&self) -> Vec<Multiaddr>;

    async fn request_dial_back(&self, peer: PeerId, addrs: Vec<Multiaddr>) -> Result<DialBackResponse>;
}

/// Server side of the reachability probe: a fresh, fully upgraded dial that is
/// closed straight away.
#[async_trait]
pub trait DialBackDialer: Send + Sync + 'static {
    async fn dial_back(&self, addr: &Multiaddr, expected: PeerId) -> Result<()>;
}
