//! # Host
//!
//! The entry point of the crate. A [`Host`] combines every component behind
//! one API: it owns the identity, listens and dials through the connection
//! layer, routes and discovers through the DHT, publishes through GossipSub,
//! and keeps itself reachable through AutoRelay.
//!
//! ## Quick Start
//!
//! ```ignore
//! let network = MemoryNetwork::new();
//! let config = HostConfig {
//!     listen_addrs: vec![Multiaddr::memory(0)],
//!     ..Default::default()
//! };
//! let host = Host::new(
//!     Keypair::generate_ed25519()?,
//!     config,
//!     Arc::new(MemoryTransport::new(network)),
//!     Arc::new(MemoryDatastore::new()),
//! )
//! .await?;
//!
//! let mut sub = host.subscribe("chat").await?;
//! host.publish("chat", b"hello".to_vec()).await?;
//! while let Some(msg) = sub.next().await {
//!     println!("{}: {:?}", msg.source, msg.data);
//! }
//! ```
//!
//! ## Component Integration
//!
//! - **Network**: connections, stream protocols, identify
//! - **Upgrader**: security negotiation then stream multiplexing
//! - **ConnManager**: watermark trimming with tags and protection
//! - **DhtNode** behind **BackoffDiscovery**: provider records and peer lookup
//! - **GossipSub**: topic mesh with signatures and dedup
//! - **AutoNat** + **AutoRelay**: reachability and relay reservations

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::autonat::{AutoNat, AutoNatServer, Reachability};
use crate::config::HostConfig;
use crate::connmgr::ConnManager;
use crate::datastore::Datastore;
use crate::dht::DhtNode;
use crate::discovery::BackoffDiscovery;
use crate::gossipsub::{GossipSub, Subscription};
use crate::identity::{Keypair, PeerId, PublicKey};
use crate::messages::MessageId;
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::multiaddr::Multiaddr;
use crate::network::{Network, NetworkParts, Services};
use crate::peerstore::{DEFAULT_GC_INTERVAL, PERMANENT_ADDR_TTL, PROVIDER_ADDR_TTL, PeerRecord, Peerstore};
use crate::protocols::{Discovery, ReachabilityProbe};
use crate::relay::{AutoRelay, RelayService, Reservation};
use crate::transport::{Direction, Transport};
use crate::upgrader::{ConnectionGater, ConnectionId, Upgrader};

/// Buffered connection events per subscriber before the oldest are dropped.
const EVENT_BUFFER: usize = 256;

/// Observable changes in the host's connection set.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HostEvent {
    Connected {
        peer: PeerId,
        id: ConnectionId,
        direction: Direction,
        addr: Multiaddr,
    },
    /// Identify finished; the peer's addresses and protocols are in the peerstore.
    PeerIdentified { peer: PeerId, protocols: Vec<String> },
    Disconnected { peer: PeerId, id: ConnectionId },
}

pub struct Host {
    keypair: Keypair,
    config: HostConfig,
    network: Network,
    peerstore: Arc<Peerstore>,
    connmgr: Arc<ConnManager>,
    dht: DhtNode<Network>,
    discovery: BackoffDiscovery<DhtNode<Network>>,
    gossipsub: GossipSub,
    autonat: Arc<AutoNat<Network>>,
    autorelay: Option<AutoRelay>,
    relay_service: Option<Arc<RelayService>>,
    metrics: Arc<Metrics>,
    events: broadcast::Sender<HostEvent>,
    cancel: CancellationToken,
}

impl Host {
    /// Build and start a host. Configuration contradictions and listen
    /// failures are fatal.
    pub async fn new(
        keypair: Keypair,
        config: HostConfig,
        transport: Arc<dyn Transport>,
        datastore: Arc<dyn Datastore>,
    ) -> Result<Self> {
        Self::with_gater(keypair, config, transport, datastore, None).await
    }

    pub async fn with_gater(
        keypair: Keypair,
        config: HostConfig,
        transport: Arc<dyn Transport>,
        datastore: Arc<dyn Datastore>,
        gater: Option<Arc<dyn ConnectionGater>>,
    ) -> Result<Self> {
        config.validate().context("invalid host configuration")?;
        let local = keypair.peer_id();
        let cancel = CancellationToken::new();
        let metrics = Arc::new(Metrics::default());

        let peerstore = Arc::new(Peerstore::new());
        peerstore
            .add_keys(&local, keypair.public(), Some(keypair.private().clone()))
            .context("local identity rejected")?;

        let connmgr = Arc::new(ConnManager::new(config.conn_manager.clone(), metrics.clone()));
        connmgr.spawn_background(cancel.clone());

        let mut upgrader = Upgrader::new(
            keypair.clone(),
            config.security.clone(),
            config.mux.clone(),
            config.upgrade_timeout,
            metrics.clone(),
            cancel.clone(),
        );
        if let Some(gater) = gater {
            upgrader = upgrader.with_gater(gater);
        }

        let mut static_relays = Vec::new();
        for addr in &config.auto_relay.static_relays {
            let relay = addr
                .peer_id()
                .ok_or_else(|| anyhow!("static relay {addr} has no peer id"))?;
            peerstore.add_addrs(&relay, &[addr.without_peer_id()], PERMANENT_ADDR_TTL);
            static_relays.push(relay);
        }
        for addr in &config.bootstrap_peers {
            if let Some(peer) = addr.peer_id() {
                peerstore.add_addrs(&peer, &[addr.without_peer_id()], PERMANENT_ADDR_TTL);
            }
        }

        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let network = Network::new(NetworkParts {
            keypair: keypair.clone(),
            transport,
            upgrader,
            peerstore: peerstore.clone(),
            connmgr: connmgr.clone(),
            static_relays,
            relay_enabled: config.relay_service.enabled,
            events: events.clone(),
            cancel: cancel.clone(),
        });

        let dht = DhtNode::new(
            local,
            Arc::new(network.clone()),
            datastore,
            config.kad.clone(),
            cancel.clone(),
        );
        let discovery = BackoffDiscovery::new(
            Arc::new(dht.clone()),
            config.discovery_backoff.clone(),
            metrics.clone(),
            cancel.clone(),
        );
        let gossipsub = GossipSub::spawn(
            keypair.clone(),
            config.gossipsub.clone(),
            Arc::new(network.clone()),
            peerstore.clone(),
            metrics.clone(),
            cancel.clone(),
        );
        let autonat = Arc::new(AutoNat::new(Arc::new(network.clone()), config.autonat.clone()));
        let relay_service = config
            .relay_service
            .enabled
            .then(|| Arc::new(RelayService::new(config.relay_service.clone())));

        network.set_services(Services {
            dht: dht.clone(),
            gossipsub: gossipsub.clone(),
            relay: relay_service.clone(),
            autonat: AutoNatServer::new(Arc::new(network.clone()), config.autonat.dial_back_timeout),
        });
        peerstore.spawn_gc(DEFAULT_GC_INTERVAL, cancel.clone());
        if relay_service.is_some() {
            let network = network.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(DEFAULT_GC_INTERVAL);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = ticker.tick() => {}
                    }
                    network.sweep_relay_clients();
                }
            });
        }

        for addr in &config.listen_addrs {
            match network.listen(addr).await {
                Ok(bound) => debug!(addr = %bound, "listening"),
                Err(e) => {
                    cancel.cancel();
                    network.clear_services();
                    return Err(e);
                }
            }
        }
        dht.set_local_addrs(network.addrs());

        let autorelay = config.auto_relay.enabled.then(|| {
            AutoRelay::spawn(
                Arc::new(network.clone()),
                autonat.clone(),
                config.auto_relay.clone(),
                metrics.clone(),
                cancel.clone(),
            )
        });
        if let Some(autorelay) = &autorelay {
            let mut addrs = autorelay.watch_addrs();
            let network = network.clone();
            let dht = dht.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        changed = addrs.changed() => {
                            if changed.is_err() {
                                break;
                            }
                        }
                    }
                    let circuits = addrs.borrow_and_update().clone();
                    debug!(count = circuits.len(), "relay addresses updated");
                    network.set_relay_addrs(circuits);
                    dht.set_local_addrs(network.addrs());
                }
            });
        }

        let host = Self {
            keypair,
            config,
            network,
            peerstore,
            connmgr,
            dht,
            discovery,
            gossipsub,
            autonat,
            autorelay,
            relay_service,
            metrics,
            events,
            cancel,
        };

        if !host.config.bootstrap_peers.is_empty() {
            let network = host.network.clone();
            let dht = host.dht.clone();
            let seeds = host.config.bootstrap_peers.clone();
            tokio::spawn(async move {
                if let Err(e) = bootstrap_with(&network, &dht, &seeds).await {
                    warn!(error = %e, "bootstrap failed");
                }
            });
        }

        info!(peer = %local, addrs = ?host.addrs(), "host started");
        Ok(host)
    }

    // ========================================================================
    // Identity & Addresses
    // ========================================================================

    pub fn peer_id(&self) -> PeerId {
        self.network.local_peer()
    }

    pub fn public_key(&self) -> PublicKey {
        self.keypair.public()
    }

    pub fn keypair(&self) -> &Keypair {
        &self.keypair
    }

    /// Listen addresses plus any relay circuit addresses currently held.
    pub fn addrs(&self) -> Vec<Multiaddr> {
        self.network.addrs()
    }

    pub fn listen_addrs(&self) -> Vec<Multiaddr> {
        self.network.listen_addrs()
    }

    pub fn protocols(&self) -> Vec<String> {
        self.network.protocols().to_vec()
    }

    pub fn peerstore(&self) -> &Arc<Peerstore> {
        &self.peerstore
    }

    pub fn conn_manager(&self) -> &Arc<ConnManager> {
        &self.connmgr
    }

    /// Connection events from now on.
    pub fn events(&self) -> broadcast::Receiver<HostEvent> {
        self.events.subscribe()
    }

    // ========================================================================
    // Connections
    // ========================================================================

    /// Connect to `peer`, locating it through the DHT if no address is known.
    pub async fn connect(&self, peer: PeerId) -> Result<()> {
        if self.peerstore.addrs_for(&peer).is_empty() {
            let record = self
                .find_peer(peer)
                .await?
                .ok_or_else(|| anyhow!("peer {peer} not found"))?;
            debug!(peer = %peer, addrs = record.addrs.len(), "resolved peer through routing");
        }
        self.network.connect(peer).await?;
        Ok(())
    }

    /// Dial an address ending in `/p2p/<peer>`, direct or relayed.
    pub async fn dial(&self, addr: &Multiaddr) -> Result<PeerId> {
        let conn = self.network.dial_addr(addr, addr.peer_id()).await?;
        Ok(conn.remote_peer)
    }

    pub fn disconnect(&self, peer: &PeerId) {
        self.network.disconnect(peer);
    }

    pub fn is_connected(&self, peer: &PeerId) -> bool {
        self.network.is_connected(peer)
    }

    pub fn connected_peers(&self) -> Vec<PeerId> {
        self.network.connected_peers()
    }

    /// Remote addresses of the open connections to `peer`.
    pub fn connection_addrs(&self, peer: &PeerId) -> Vec<Multiaddr> {
        self.network
            .connections(peer)
            .iter()
            .filter(|c| !c.is_closed())
            .map(|c| c.remote_addr.clone())
            .collect()
    }

    pub fn connection_count(&self) -> usize {
        self.connmgr.connection_count()
    }

    /// Dial the configured bootstrap peers and seed routing from them.
    /// Returns the number of peers in the routing table afterwards.
    pub async fn bootstrap(&self) -> Result<usize> {
        bootstrap_with(&self.network, &self.dht, &self.config.bootstrap_peers).await?;
        Ok(self.dht.routing_table_size().await)
    }

    // ========================================================================
    // PubSub
    // ========================================================================

    pub async fn subscribe(&self, topic: &str) -> Result<Subscription> {
        self.gossipsub.subscribe(topic).await
    }

    pub async fn publish(&self, topic: &str, data: Vec<u8>) -> Result<MessageId> {
        self.gossipsub.publish(topic, data).await
    }

    pub async fn topics(&self) -> Vec<String> {
        self.gossipsub.topics().await
    }

    pub async fn mesh_peers(&self, topic: &str) -> Vec<PeerId> {
        self.gossipsub.mesh_peers(topic).await
    }

    // ========================================================================
    // Routing & Discovery
    // ========================================================================

    /// Announce the local peer under `key`; returns the TTL granted.
    pub async fn advertise(&self, key: &str, ttl: Duration) -> Result<Duration> {
        self.discovery.advertise(key, ttl).await
    }

    /// Peers advertising `key`, rate limited by the discovery backoff.
    pub async fn find_peers(&self, key: &str, limit: usize) -> Result<Vec<PeerRecord>> {
        let peers = self.discovery.find_peers(key, limit).await?;
        for record in &peers {
            if record.peer_id != self.peer_id() {
                self.peerstore.add_addrs(&record.peer_id, &record.addrs, PROVIDER_ADDR_TTL);
            }
        }
        Ok(peers)
    }

    pub async fn find_peer(&self, peer: PeerId) -> Result<Option<PeerRecord>> {
        let found = self.dht.find_peer(peer).await?;
        if let Some(record) = &found {
            self.peerstore.add_addrs(&peer, &record.addrs, PROVIDER_ADDR_TTL);
        }
        Ok(found)
    }

    pub async fn routing_table_size(&self) -> usize {
        self.dht.routing_table_size().await
    }

    // ========================================================================
    // Reachability & Relay
    // ========================================================================

    pub async fn reachability(&self) -> Reachability {
        self.autonat.probe().await
    }

    pub fn relay_reservations(&self) -> Vec<Reservation> {
        self.autorelay
            .as_ref()
            .map(AutoRelay::reservations)
            .unwrap_or_default()
    }

    /// Reservations this host holds for others, when serving as a relay.
    pub fn hosted_reservations(&self) -> usize {
        self.relay_service
            .as_ref()
            .map(|r| r.reservation_count())
            .unwrap_or(0)
    }

    // ========================================================================
    // Observability & Lifecycle
    // ========================================================================

    pub async fn metrics(&self) -> MetricsSnapshot {
        let mut snapshot = self.metrics.snapshot();
        snapshot.connections = self.connmgr.connection_count();
        snapshot.mesh_sizes = self.gossipsub.mesh_sizes().await;
        snapshot
    }

    /// Stop every background task and close all connections.
    pub fn shutdown(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        info!(peer = %self.peer_id(), "host shutting down");
        if let Some(autorelay) = &self.autorelay {
            autorelay.stop();
        }
        self.cancel.cancel();
        self.network.close_all();
        self.network.clear_services();
    }

    pub fn is_shut_down(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Drop for Host {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn bootstrap_with(network: &Network, dht: &DhtNode<Network>, seeds: &[Multiaddr]) -> Result<()> {
    let mut records = Vec::new();
    for addr in seeds {
        match network.dial_addr(addr, addr.peer_id()).await {
            Ok(conn) => {
                let mut record = PeerRecord::new(conn.remote_peer, vec![addr.without_peer_id()]);
                record.public_key = Some(conn.remote_public_key);
                records.push(record);
            }
            Err(e) => debug!(addr = %addr, error = %e, "bootstrap peer unreachable"),
        }
    }
    if records.is_empty() {
        return Err(anyhow!("no bootstrap peer reachable"));
    }
    let found = dht.bootstrap(records).await?;
    info!(found = found.len(), "bootstrap complete");
    Ok(())
}
