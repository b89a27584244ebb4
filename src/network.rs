//! # Connection Layer
//!
//! [`Network`] owns every live [`Connection`] of a host and speaks the stream
//! protocols on top of them. It is the single type implementing the network
//! seams from [`crate::protocols`], so the DHT, GossipSub, AutoRelay and the
//! reachability probe all talk to peers through it.
//!
//! ## Streams
//!
//! Every stream starts with a `StreamOpen { protocol }` answered by a
//! `StreamAck`. Request/response protocols then exchange one message each way;
//! GossipSub keeps one long-lived outbound stream per peer fed by a bounded
//! writer queue.
//!
//! ## Lifecycle
//!
//! A connection is registered once upgraded (dialed, accepted or relayed), gets
//! a driver task accepting its inbound streams, runs identify, and is
//! unregistered when its session ends. The last connection to a peer going away
//! removes the peer from GossipSub and downgrades its address TTL.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::autonat::{AutoNatServer, DEFAULT_DIAL_BACK_TIMEOUT, MAX_DIAL_BACK_ADDRS};
use crate::connmgr::ConnManager;
use crate::dht::{DhtNode, Key};
use crate::gossipsub::GossipSub;
use crate::host::HostEvent;
use crate::identity::{Keypair, PeerId};
use crate::messages::{
    self, DialBackRequest, DialBackResponse, HopRequest, HopResponse, IdentifyInfo, KadRequest, KadResponse,
    MAX_CONTROL_MESSAGE_SIZE, MAX_VALUE_SIZE, PubSubRpc, StopRequest, StopResponse, StreamAck, StreamOpen,
};
use crate::multiaddr::{Multiaddr, Protocol};
use crate::muxer::Stream;
use crate::peerstore::{
    CONNECTED_ADDR_TTL, MAX_ADDRS_PER_PEER, PeerRecord, Peerstore, RECENTLY_CONNECTED_ADDR_TTL, TEMP_ADDR_TTL,
};
use crate::protocols::{
    AUTONAT_PROTOCOL, DialBackDialer, DialBackRpc, GOSSIPSUB_PROTOCOL, IDENTIFY_PROTOCOL, KAD_PROTOCOL, KadRpc,
    PubSubTransport, RELAY_HOP_PROTOCOL, RELAY_STOP_PROTOCOL, RelayRpc,
};
use crate::relay::{RelayService, Reservation, circuit_addr, splice};
use crate::transport::{Direction, Transport};
use crate::upgrader::{Connection, Upgrader};

/// Deadline for a single request/response exchange on a stream.
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(10);

/// Deadline for establishing a raw transport link.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Outbound pubsub RPCs queued per peer before `send` starts refusing.
/// SECURITY: a slow peer cannot make the router buffer without bound.
pub const PUBSUB_WRITER_QUEUE: usize = 256;

/// Largest pubsub frame accepted: a full payload plus envelope and control.
const MAX_PUBSUB_FRAME: usize = MAX_VALUE_SIZE + MAX_CONTROL_MESSAGE_SIZE;

const RELAY_CLIENT_TAG: &str = "relay-client";
const RELAY_RESERVATION_TAG: &str = "relay-reservation";

/// Components serving inbound streams. Installed once they exist and removed
/// at shutdown.
pub(crate) struct Services {
    pub dht: DhtNode<Network>,
    pub gossipsub: GossipSub,
    pub relay: Option<Arc<RelayService>>,
    pub autonat: AutoNatServer<Network>,
}

pub(crate) struct NetworkParts {
    pub keypair: Keypair,
    pub transport: Arc<dyn Transport>,
    pub upgrader: Upgrader,
    pub peerstore: Arc<Peerstore>,
    pub connmgr: Arc<ConnManager>,
    pub static_relays: Vec<PeerId>,
    pub relay_enabled: bool,
    pub events: broadcast::Sender<HostEvent>,
    pub cancel: CancellationToken,
}

struct PubSubWriter {
    generation: u64,
    tx: mpsc::Sender<PubSubRpc>,
}

struct NetworkInner {
    keypair: Keypair,
    local: PeerId,
    transport: Arc<dyn Transport>,
    upgrader: Upgrader,
    peerstore: Arc<Peerstore>,
    connmgr: Arc<ConnManager>,
    protocols: Vec<String>,
    static_relays: Vec<PeerId>,
    conns: DashMap<PeerId, Vec<Arc<Connection>>>,
    listen_addrs: RwLock<Vec<Multiaddr>>,
    relay_addrs: RwLock<Vec<Multiaddr>>,
    pubsub_writers: DashMap<PeerId, PubSubWriter>,
    writer_generation: AtomicU64,
    services: RwLock<Option<Arc<Services>>>,
    events: broadcast::Sender<HostEvent>,
    cancel: CancellationToken,
}

/// Cheap-to-clone handle to the connection layer.
#[derive(Clone)]
pub struct Network {
    inner: Arc<NetworkInner>,
}

impl Network {
    pub(crate) fn new(parts: NetworkParts) -> Self {
        let mut protocols = vec![
            IDENTIFY_PROTOCOL.to_string(),
            KAD_PROTOCOL.to_string(),
            GOSSIPSUB_PROTOCOL.to_string(),
            RELAY_STOP_PROTOCOL.to_string(),
            AUTONAT_PROTOCOL.to_string(),
        ];
        if parts.relay_enabled {
            protocols.push(RELAY_HOP_PROTOCOL.to_string());
        }
        Self {
            inner: Arc::new(NetworkInner {
                local: parts.keypair.peer_id(),
                keypair: parts.keypair,
                transport: parts.transport,
                upgrader: parts.upgrader,
                peerstore: parts.peerstore,
                connmgr: parts.connmgr,
                protocols,
                static_relays: parts.static_relays,
                conns: DashMap::new(),
                listen_addrs: RwLock::new(Vec::new()),
                relay_addrs: RwLock::new(Vec::new()),
                pubsub_writers: DashMap::new(),
                writer_generation: AtomicU64::new(0),
                services: RwLock::new(None),
                events: parts.events,
                cancel: parts.cancel,
            }),
        }
    }

    pub(crate) fn set_services(&self, services: Services) {
        *self.inner.services.write() = Some(Arc::new(services));
    }

    pub(crate) fn clear_services(&self) {
        self.inner.services.write().take();
    }

    fn services(&self) -> Option<Arc<Services>> {
        self.inner.services.read().clone()
    }

    pub fn local_peer(&self) -> PeerId {
        self.inner.local
    }

    pub fn protocols(&self) -> &[String] {
        &self.inner.protocols
    }

    // ========================================================================
    // Addresses
    // ========================================================================

    pub fn listen_addrs(&self) -> Vec<Multiaddr> {
        self.inner.listen_addrs.read().clone()
    }

    /// Listen addresses followed by relay circuit addresses.
    pub fn addrs(&self) -> Vec<Multiaddr> {
        let mut addrs = self.listen_addrs();
        addrs.extend(self.inner.relay_addrs.read().iter().cloned());
        addrs
    }

    pub(crate) fn set_relay_addrs(&self, addrs: Vec<Multiaddr>) {
        *self.inner.relay_addrs.write() = addrs;
    }

    /// Forget relay clients whose reservations lapsed so their connections
    /// can be trimmed again. Returns how many were released.
    pub(crate) fn sweep_relay_clients(&self) -> usize {
        let Some(relay) = self.services().and_then(|s| s.relay.clone()) else {
            return 0;
        };
        let expired = relay.sweep_expired();
        for peer in &expired {
            self.inner.connmgr.unprotect(*peer, RELAY_CLIENT_TAG);
        }
        if !expired.is_empty() {
            debug!(count = expired.len(), "relay reservations expired");
        }
        expired.len()
    }

    fn holds_reservation_with(&self, relay: &PeerId) -> bool {
        self.inner
            .relay_addrs
            .read()
            .iter()
            .filter_map(Multiaddr::split_circuit)
            .any(|(_, r, _)| r == *relay)
    }

    // ========================================================================
    // Connections
    // ========================================================================

    /// An open connection to `peer`, preferring the oldest.
    pub fn connection(&self, peer: &PeerId) -> Option<Arc<Connection>> {
        self.inner
            .conns
            .get(peer)
            .and_then(|conns| conns.iter().find(|c| !c.is_closed()).cloned())
    }

    pub fn connections(&self, peer: &PeerId) -> Vec<Arc<Connection>> {
        self.inner.conns.get(peer).map(|c| c.value().clone()).unwrap_or_default()
    }

    pub fn is_connected(&self, peer: &PeerId) -> bool {
        self.connection(peer).is_some()
    }

    pub fn connected_peers(&self) -> Vec<PeerId> {
        self.inner
            .conns
            .iter()
            .filter(|e| e.value().iter().any(|c| !c.is_closed()))
            .map(|e| *e.key())
            .collect()
    }

    pub fn disconnect(&self, peer: &PeerId) {
        if let Some(conns) = self.inner.conns.get(peer) {
            for conn in conns.iter() {
                conn.close();
            }
        }
    }

    pub fn close_all(&self) {
        for entry in self.inner.conns.iter() {
            for conn in entry.value() {
                conn.close();
            }
        }
    }

    /// Reuse an open connection or dial the peer's known addresses, direct
    /// ones before relay circuits.
    pub async fn connect(&self, peer: PeerId) -> Result<Arc<Connection>> {
        if peer == self.inner.local {
            bail!("refusing to dial the local peer");
        }
        if let Some(conn) = self.connection(&peer) {
            return Ok(conn);
        }
        let addrs = self.inner.peerstore.addrs_for(&peer);
        if addrs.is_empty() {
            bail!("no known addresses for {peer}");
        }
        let (relayed, direct): (Vec<_>, Vec<_>) = addrs.into_iter().partition(Multiaddr::is_circuit);

        let mut last_err = None;
        for addr in direct.iter().chain(relayed.iter()) {
            match self.dial_addr(addr, Some(peer)).await {
                Ok(conn) => return Ok(conn),
                Err(e) => {
                    debug!(peer = %peer, addr = %addr, error = %e, "dial attempt failed");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow!("no dialable address for {peer}")))
    }

    /// Dial one address. `expected` defaults to the address's `/p2p` suffix.
    pub async fn dial_addr(&self, addr: &Multiaddr, expected: Option<PeerId>) -> Result<Arc<Connection>> {
        if addr.is_circuit() {
            return self.dial_circuit(addr).await;
        }
        let expected = expected.or(addr.peer_id());
        let conn = self.dial_direct(addr, expected).await?;
        Ok(self.register(conn))
    }

    async fn dial_direct(&self, addr: &Multiaddr, expected: Option<PeerId>) -> Result<Connection> {
        let target = addr.without_peer_id();
        if !self.inner.transport.can_dial(&target) {
            bail!("no transport for {target}");
        }
        let raw = tokio::time::timeout(DEFAULT_DIAL_TIMEOUT, self.inner.transport.dial(&target))
            .await
            .map_err(|_| anyhow!("dial to {target} timed out"))??;
        let conn = self
            .inner
            .upgrader
            .upgrade(raw, Direction::Outbound, target, expected)
            .await?;
        Ok(conn)
    }

    /// Reach `target` through the relay named in
    /// `<relay addr>/p2p/<relay>/p2p-circuit/p2p/<target>`, then upgrade the
    /// relayed stream like any raw link.
    async fn dial_circuit(&self, addr: &Multiaddr) -> Result<Arc<Connection>> {
        let (relay_addr, relay, target) = addr
            .split_circuit()
            .ok_or_else(|| anyhow!("malformed circuit address {addr}"))?;
        let target = target.ok_or_else(|| anyhow!("circuit address {addr} names no target"))?;

        let relay_conn = match self.connection(&relay) {
            Some(conn) => conn,
            None => {
                let conn = self.dial_direct(&relay_addr, Some(relay)).await?;
                self.register(conn)
            }
        };

        let mut stream = self.open_stream(&relay_conn, RELAY_HOP_PROTOCOL).await?;
        stream.send(&HopRequest::Connect { target }).await?;
        match self.recv_timeout::<HopResponse>(&mut stream, MAX_CONTROL_MESSAGE_SIZE).await? {
            HopResponse::Connected => {}
            HopResponse::Rejected { reason } => bail!("relay {relay} refused circuit: {reason}"),
            other => bail!("unexpected relay response {other:?}"),
        }

        let conn = self
            .inner
            .upgrader
            .upgrade(Box::new(stream.into_io()), Direction::Outbound, addr.clone(), Some(target))
            .await?;
        debug!(peer = %target, relay = %relay, "relayed connection established");
        Ok(self.register(conn))
    }

    fn register(&self, conn: Connection) -> Arc<Connection> {
        let conn = Arc::new(conn);
        let peer = conn.remote_peer;
        if let Err(e) = self.inner.peerstore.add_keys(&peer, conn.remote_public_key, None) {
            warn!(peer = %peer, error = %e, "authenticated key rejected by peerstore");
        }
        if conn.direction == Direction::Outbound && !conn.remote_addr.is_circuit() {
            self.inner
                .peerstore
                .add_addrs(&peer, &[conn.remote_addr.clone()], CONNECTED_ADDR_TTL);
        }
        self.inner.conns.entry(peer).or_default().push(conn.clone());
        self.inner.connmgr.notify_connected(conn.clone());
        let _ = self.inner.events.send(HostEvent::Connected {
            peer,
            id: conn.id,
            direction: conn.direction,
            addr: conn.remote_addr.clone(),
        });
        info!(peer = %peer, addr = %conn.remote_addr, direction = ?conn.direction, "peer connected");

        let network = self.clone();
        let driven = conn.clone();
        tokio::spawn(async move { network.drive(driven).await });
        conn
    }

    async fn drive(self, conn: Arc<Connection>) {
        let identify = {
            let network = self.clone();
            let conn = conn.clone();
            tokio::spawn(async move {
                if let Err(e) = network.identify(&conn).await {
                    debug!(peer = %conn.remote_peer, error = %e, "identify failed");
                }
            })
        };

        loop {
            let next = tokio::select! {
                _ = self.inner.cancel.cancelled() => break,
                next = conn.session.accept() => next,
            };
            let Ok(stream) = next else { break };
            let network = self.clone();
            let conn = conn.clone();
            tokio::spawn(async move {
                let peer = conn.remote_peer;
                if let Err(e) = network.handle_stream(conn, stream).await {
                    debug!(peer = %peer, error = %e, "inbound stream failed");
                }
            });
        }

        identify.abort();
        conn.close();
        self.unregister(&conn).await;
    }

    async fn unregister(&self, conn: &Arc<Connection>) {
        let peer = conn.remote_peer;
        if let Some(mut conns) = self.inner.conns.get_mut(&peer) {
            conns.retain(|c| c.id != conn.id);
        }
        let gone = self
            .inner
            .conns
            .remove_if(&peer, |_, conns| conns.is_empty())
            .is_some();
        self.inner.connmgr.notify_disconnected(conn.id);

        if gone {
            self.inner.pubsub_writers.remove(&peer);
            self.inner
                .peerstore
                .update_addr_ttl(&peer, CONNECTED_ADDR_TTL, RECENTLY_CONNECTED_ADDR_TTL);
            if let Some(services) = self.services() {
                services.gossipsub.remove_peer(peer).await;
            }
        }
        let _ = self.inner.events.send(HostEvent::Disconnected { peer, id: conn.id });
        info!(peer = %peer, conn = %conn.id, "peer disconnected");
    }

    // ========================================================================
    // Listening
    // ========================================================================

    /// Start accepting on `addr`; returns the bound address.
    pub async fn listen(&self, addr: &Multiaddr) -> Result<Multiaddr> {
        let mut listener = self
            .inner
            .transport
            .listen(addr)
            .await
            .with_context(|| format!("failed to listen on {addr}"))?;
        let local = listener.local_addr();
        self.inner.listen_addrs.write().push(local.clone());

        let network = self.clone();
        let bound = local.clone();
        tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    _ = network.inner.cancel.cancelled() => break,
                    accepted = listener.accept() => accepted,
                };
                let (raw, remote) = match accepted {
                    Ok(link) => link,
                    Err(e) => {
                        debug!(addr = %bound, error = %e, "listener stopped");
                        break;
                    }
                };
                let network = network.clone();
                tokio::spawn(async move {
                    match network
                        .inner
                        .upgrader
                        .upgrade(raw, Direction::Inbound, remote.clone(), None)
                        .await
                    {
                        Ok(conn) => {
                            network.register(conn);
                        }
                        Err(e) => trace!(addr = %remote, error = %e, "inbound upgrade failed"),
                    }
                });
            }
            network.inner.listen_addrs.write().retain(|a| *a != bound);
        });
        Ok(local)
    }

    // ========================================================================
    // Streams
    // ========================================================================

    pub async fn open_stream(&self, conn: &Connection, protocol: &str) -> Result<Stream> {
        let mut stream = conn.session.open_stream().await?;
        stream
            .send(&StreamOpen {
                protocol: protocol.to_string(),
            })
            .await?;
        match self.recv_timeout::<StreamAck>(&mut stream, MAX_CONTROL_MESSAGE_SIZE).await? {
            StreamAck::Accepted => Ok(stream),
            StreamAck::Unsupported => bail!("{} does not support {protocol}", conn.remote_peer),
        }
    }

    async fn recv_timeout<T: serde::de::DeserializeOwned>(&self, stream: &mut Stream, max_len: usize) -> Result<T> {
        stream.recv_timeout(max_len, DEFAULT_RPC_TIMEOUT).await
    }

    async fn open_to(&self, peer: PeerId, protocol: &str) -> Result<Stream> {
        let conn = self.connect(peer).await?;
        self.open_stream(&conn, protocol).await
    }

    async fn handle_stream(&self, conn: Arc<Connection>, mut stream: Stream) -> Result<()> {
        let open: StreamOpen = self.recv_timeout(&mut stream, MAX_CONTROL_MESSAGE_SIZE).await?;
        if !self.inner.protocols.iter().any(|p| *p == open.protocol) {
            trace!(peer = %conn.remote_peer, protocol = %open.protocol, "unsupported stream protocol");
            stream.send(&StreamAck::Unsupported).await?;
            return Ok(());
        }
        if open.protocol == IDENTIFY_PROTOCOL {
            stream.send(&StreamAck::Accepted).await?;
            return self.serve_identify(&conn, stream).await;
        }

        let Some(services) = self.services() else {
            stream.reset();
            bail!("host shutting down");
        };
        stream.send(&StreamAck::Accepted).await?;
        match open.protocol.as_str() {
            KAD_PROTOCOL => self.serve_kad(&conn, stream, &services).await,
            GOSSIPSUB_PROTOCOL => self.serve_pubsub(&conn, stream, &services).await,
            RELAY_HOP_PROTOCOL => match &services.relay {
                Some(relay) => self.serve_hop(&conn, stream, relay).await,
                None => Ok(()),
            },
            RELAY_STOP_PROTOCOL => self.serve_stop(&conn, stream).await,
            AUTONAT_PROTOCOL => {
                let request: DialBackRequest = self.recv_timeout(&mut stream, MAX_CONTROL_MESSAGE_SIZE).await?;
                let response = services
                    .autonat
                    .handle(conn.remote_peer, &conn.remote_addr, request)
                    .await;
                stream.send(&response).await
            }
            _ => Ok(()),
        }
    }

    // ========================================================================
    // Identify
    // ========================================================================

    async fn identify(&self, conn: &Arc<Connection>) -> Result<()> {
        let mut stream = self.open_stream(conn, IDENTIFY_PROTOCOL).await?;
        let info: IdentifyInfo = self.recv_timeout(&mut stream, MAX_CONTROL_MESSAGE_SIZE).await?;
        let _ = stream.close_write().await;

        let peer = conn.remote_peer;
        if info.public_key.to_peer_id() != peer {
            bail!("identify key does not match authenticated peer {peer}");
        }
        let addrs: Vec<Multiaddr> = info
            .listen_addrs
            .into_iter()
            .filter(|a| a.is_circuit() || a.peer_id().is_none_or(|p| p == peer))
            .map(|a| if a.is_circuit() { a } else { a.without_peer_id() })
            .take(MAX_ADDRS_PER_PEER)
            .collect();

        let store = &self.inner.peerstore;
        store.add_keys(&peer, info.public_key, None)?;
        store.add_addrs(&peer, &addrs, CONNECTED_ADDR_TTL);
        store.set_protocols(&peer, &info.protocols);
        if let Some(observed) = &info.observed_addr {
            trace!(peer = %peer, observed = %observed, "remote observed our address");
        }

        if let Some(services) = self.services() {
            if store.supports_protocol(&peer, KAD_PROTOCOL) {
                let mut record = PeerRecord::new(peer, addrs);
                record.public_key = Some(info.public_key);
                services.dht.observe_peer(record).await;
            }
            if store.supports_protocol(&peer, GOSSIPSUB_PROTOCOL) {
                services.gossipsub.add_peer(peer).await;
            }
        }
        debug!(peer = %peer, protocols = info.protocols.len(), "peer identified");
        let _ = self.inner.events.send(HostEvent::PeerIdentified {
            peer,
            protocols: info.protocols,
        });
        Ok(())
    }

    async fn serve_identify(&self, conn: &Connection, mut stream: Stream) -> Result<()> {
        let info = IdentifyInfo {
            public_key: self.inner.keypair.public(),
            listen_addrs: self.addrs(),
            protocols: self.inner.protocols.clone(),
            observed_addr: Some(conn.remote_addr.clone()),
        };
        stream.send(&info).await?;
        let _ = stream.close_write().await;
        Ok(())
    }

    // ========================================================================
    // Routing
    // ========================================================================

    async fn serve_kad(&self, conn: &Connection, mut stream: Stream, services: &Services) -> Result<()> {
        let request: KadRequest = self.recv_timeout(&mut stream, MAX_CONTROL_MESSAGE_SIZE).await?;
        let peer = conn.remote_peer;
        let from = self
            .inner
            .peerstore
            .peer_record(&peer)
            .unwrap_or_else(|| PeerRecord::new(peer, Vec::new()));

        let response = match request {
            KadRequest::Ping => KadResponse::Ack,
            KadRequest::FindNode { target } => KadResponse::Nodes(services.dht.handle_find_node(from, target).await),
            KadRequest::GetProviders { key } => {
                let (providers, closer) = services.dht.handle_get_providers(from, key).await;
                KadResponse::Providers { providers, closer }
            }
            KadRequest::AddProvider { key, provider } => {
                match services.dht.handle_add_provider(from, key, provider).await {
                    Ok(_) => KadResponse::Ack,
                    Err(e) => KadResponse::Error { message: e.to_string() },
                }
            }
        };
        stream.send(&response).await?;
        let _ = stream.close_write().await;
        Ok(())
    }

    async fn kad_request(&self, to: &PeerRecord, request: KadRequest) -> Result<KadResponse> {
        if !to.addrs.is_empty() && !self.is_connected(&to.peer_id) {
            self.inner.peerstore.add_addrs(&to.peer_id, &to.addrs, TEMP_ADDR_TTL);
        }
        let mut stream = self.open_to(to.peer_id, KAD_PROTOCOL).await?;
        stream.send(&request).await?;
        let response: KadResponse = self.recv_timeout(&mut stream, MAX_VALUE_SIZE).await?;
        if let KadResponse::Error { message } = response {
            bail!("{} rejected routing request: {message}", to.peer_id);
        }
        Ok(response)
    }

    // ========================================================================
    // PubSub
    // ========================================================================

    async fn serve_pubsub(&self, conn: &Connection, mut stream: Stream, services: &Services) -> Result<()> {
        let peer = conn.remote_peer;
        while let Some(frame) = stream.read_message(MAX_PUBSUB_FRAME).await? {
            match messages::deserialize_bounded::<PubSubRpc>(&frame) {
                Ok(rpc) => services.gossipsub.handle_rpc(peer, rpc).await,
                Err(e) => {
                    stream.reset();
                    bail!("malformed pubsub frame from {peer}: {e}");
                }
            }
        }
        Ok(())
    }

    fn spawn_pubsub_writer(&self, peer: PeerId, conn: Arc<Connection>) -> mpsc::Sender<PubSubRpc> {
        let (tx, mut rx) = mpsc::channel::<PubSubRpc>(PUBSUB_WRITER_QUEUE);
        let generation = self.inner.writer_generation.fetch_add(1, Ordering::Relaxed);
        self.inner.pubsub_writers.insert(
            peer,
            PubSubWriter {
                generation,
                tx: tx.clone(),
            },
        );

        let network = self.clone();
        tokio::spawn(async move {
            let result: Result<()> = async {
                let mut stream = network.open_stream(&conn, GOSSIPSUB_PROTOCOL).await?;
                loop {
                    let rpc = tokio::select! {
                        _ = network.inner.cancel.cancelled() => break,
                        rpc = rx.recv() => rpc,
                    };
                    let Some(rpc) = rpc else { break };
                    let bytes = messages::serialize(&rpc)?;
                    stream.write_message(&bytes).await?;
                }
                let _ = stream.close_write().await;
                Ok(())
            }
            .await;
            if let Err(e) = result {
                debug!(peer = %peer, error = %e, "pubsub writer stopped");
            }
            network
                .inner
                .pubsub_writers
                .remove_if(&peer, |_, w| w.generation == generation);
        });
        tx
    }

    // ========================================================================
    // Relay
    // ========================================================================

    async fn serve_hop(&self, conn: &Connection, mut stream: Stream, relay: &RelayService) -> Result<()> {
        let request: HopRequest = self.recv_timeout(&mut stream, MAX_CONTROL_MESSAGE_SIZE).await?;
        let source = conn.remote_peer;
        match request {
            HopRequest::Reserve => {
                let response = match relay.reserve(source) {
                    Ok(ttl) => {
                        self.inner.connmgr.protect(source, RELAY_CLIENT_TAG);
                        let local = self.inner.local;
                        HopResponse::ReservationOk {
                            ttl_secs: ttl.as_secs(),
                            relay_addrs: self.listen_addrs().iter().map(|a| a.with_peer_id(local)).collect(),
                        }
                    }
                    Err(reason) => HopResponse::Rejected { reason },
                };
                stream.send(&response).await
            }
            HopRequest::Connect { target } => {
                let rejected = |reason: &str| HopResponse::Rejected {
                    reason: reason.to_string(),
                };
                if !relay.has_reservation(&target) {
                    return stream.send(&rejected("no reservation for target")).await;
                }
                let Some(permit) = relay.circuit_permit() else {
                    return stream.send(&rejected("relay at circuit capacity")).await;
                };
                let Some(target_conn) = self.connection(&target) else {
                    return stream.send(&rejected("target not connected")).await;
                };
                let mut stop = match self.open_stream(&target_conn, RELAY_STOP_PROTOCOL).await {
                    Ok(stop) => stop,
                    Err(e) => return stream.send(&rejected(&e.to_string())).await,
                };
                stop.send(&StopRequest { from: source }).await?;
                match self.recv_timeout::<StopResponse>(&mut stop, MAX_CONTROL_MESSAGE_SIZE).await {
                    Ok(StopResponse::Accepted) => {}
                    Ok(StopResponse::Rejected { reason }) => return stream.send(&HopResponse::Rejected { reason }).await,
                    Err(e) => return stream.send(&rejected(&e.to_string())).await,
                }
                stream.send(&HopResponse::Connected).await?;
                debug!(source = %source, target = %target, "circuit opened");
                let (up, down) = splice(stream, stop).await;
                drop(permit);
                debug!(source = %source, target = %target, up, down, "circuit closed");
                Ok(())
            }
        }
    }

    /// Target side of a circuit: the relay introduces `from`, and the stream
    /// becomes the raw link of a fresh inbound upgrade.
    async fn serve_stop(&self, conn: &Connection, mut stream: Stream) -> Result<()> {
        let request: StopRequest = self.recv_timeout(&mut stream, MAX_CONTROL_MESSAGE_SIZE).await?;
        let relay = conn.remote_peer;
        if !self.holds_reservation_with(&relay) {
            return stream
                .send(&StopResponse::Rejected {
                    reason: "no reservation with this relay".into(),
                })
                .await;
        }
        stream.send(&StopResponse::Accepted).await?;

        let remote_addr = circuit_addr(&Multiaddr::empty().with(Protocol::P2p(relay)), request.from);
        let conn = self
            .inner
            .upgrader
            .upgrade(Box::new(stream.into_io()), Direction::Inbound, remote_addr, Some(request.from))
            .await?;
        debug!(peer = %request.from, relay = %relay, "relayed connection accepted");
        self.register(conn);
        Ok(())
    }
}

// ============================================================================
// Network Seams
// ============================================================================

#[async_trait]
impl KadRpc for Network {
    async fn ping(&self, to: &PeerRecord) -> Result<()> {
        match self.kad_request(to, KadRequest::Ping).await? {
            KadResponse::Ack => Ok(()),
            other => bail!("unexpected ping response {other:?}"),
        }
    }

    async fn find_node(&self, to: &PeerRecord, target: PeerId) -> Result<Vec<PeerRecord>> {
        match self.kad_request(to, KadRequest::FindNode { target }).await? {
            KadResponse::Nodes(nodes) => Ok(nodes),
            other => bail!("unexpected find_node response {other:?}"),
        }
    }

    async fn get_providers(&self, to: &PeerRecord, key: Key) -> Result<(Vec<PeerRecord>, Vec<PeerRecord>)> {
        match self.kad_request(to, KadRequest::GetProviders { key }).await? {
            KadResponse::Providers { providers, closer } => Ok((providers, closer)),
            other => bail!("unexpected get_providers response {other:?}"),
        }
    }

    async fn add_provider(&self, to: &PeerRecord, key: Key, provider: PeerRecord) -> Result<()> {
        match self.kad_request(to, KadRequest::AddProvider { key, provider }).await? {
            KadResponse::Ack => Ok(()),
            other => bail!("unexpected add_provider response {other:?}"),
        }
    }
}

impl PubSubTransport for Network {
    fn send(&self, to: &PeerId, rpc: PubSubRpc) -> bool {
        let queued = self.inner.pubsub_writers.get(to).map(|w| w.tx.clone());
        let tx = match queued {
            Some(tx) if !tx.is_closed() => tx,
            _ => {
                let Some(conn) = self.connection(to) else {
                    return false;
                };
                self.spawn_pubsub_writer(*to, conn)
            }
        };
        match tx.try_send(rpc) {
            Ok(()) => true,
            Err(_) => {
                trace!(peer = %to, "pubsub writer queue full, dropping rpc");
                false
            }
        }
    }
}

#[async_trait]
impl RelayRpc for Network {
    fn relay_candidates(&self) -> Vec<PeerId> {
        let local = self.inner.local;
        let mut seen = HashSet::new();
        self.inner
            .static_relays
            .iter()
            .copied()
            .chain(self.inner.peerstore.peers_supporting(RELAY_HOP_PROTOCOL))
            .filter(|p| *p != local && seen.insert(*p))
            .collect()
    }

    async fn reserve(&self, relay: PeerId) -> Result<Reservation> {
        let mut stream = self.open_to(relay, RELAY_HOP_PROTOCOL).await?;
        stream.send(&HopRequest::Reserve).await?;
        match self.recv_timeout::<HopResponse>(&mut stream, MAX_CONTROL_MESSAGE_SIZE).await? {
            HopResponse::ReservationOk { ttl_secs, relay_addrs } => {
                self.inner.connmgr.protect(relay, RELAY_RESERVATION_TAG);
                Ok(Reservation::from_grant(
                    relay,
                    self.inner.local,
                    Duration::from_secs(ttl_secs),
                    &relay_addrs,
                ))
            }
            HopResponse::Rejected { reason } => bail!("relay {relay} refused reservation: {reason}"),
            other => bail!("unexpected reservation response {other:?}"),
        }
    }

    fn release(&self, relay: PeerId) {
        if !self.inner.connmgr.unprotect(relay, RELAY_RESERVATION_TAG) {
            trace!(peer = %relay, "relay no longer protected");
        }
    }
}

#[async_trait]
impl DialBackRpc for Network {
    fn dial_back_peers(&self) -> Vec<PeerId> {
        self.connected_peers()
            .into_iter()
            .filter(|p| self.inner.peerstore.supports_protocol(p, AUTONAT_PROTOCOL))
            .collect()
    }

    fn listen_addrs(&self) -> Vec<Multiaddr> {
        Network::listen_addrs(self)
    }

    async fn request_dial_back(&self, peer: PeerId, addrs: Vec<Multiaddr>) -> Result<DialBackResponse> {
        let mut stream = self.open_to(peer, AUTONAT_PROTOCOL).await?;
        // The server dials each address in turn before answering.
        let budget = DEFAULT_RPC_TIMEOUT + DEFAULT_DIAL_BACK_TIMEOUT * addrs.len().min(MAX_DIAL_BACK_ADDRS) as u32;
        stream.send(&DialBackRequest { addrs }).await?;
        stream.recv_timeout(MAX_CONTROL_MESSAGE_SIZE, budget).await
    }
}

#[async_trait]
impl DialBackDialer for Network {
    async fn dial_back(&self, addr: &Multiaddr, expected: PeerId) -> Result<()> {
        let conn = self.dial_direct(addr, Some(expected)).await?;
        conn.close();
        Ok(())
    }
}
