//! Integration tests for the Host public API.
//!
//! These tests exercise the public interface exposed through the Host facade,
//! validating connection lifecycle, identify, discovery and shutdown in
//! realistic multi-host scenarios over the in-memory transport.

use std::sync::{Arc, Once};
use std::time::Duration;

use peerweave::security::SecurityProtocol;
use peerweave::{
    ConfigError, Host, HostConfig, HostEvent, Keypair, MemoryDatastore, MemoryNetwork, MemoryTransport, Multiaddr,
    PeerId, Transport,
};
use tokio::sync::broadcast;
use tokio::time::timeout;

static INIT: Once = Once::new();

fn init_tracing() {
    INIT.call_once(|| {
        let filter = if std::env::var("RUST_LOG").is_ok() {
            tracing_subscriber::EnvFilter::from_default_env()
        } else {
            tracing_subscriber::EnvFilter::new("info")
        };
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init()
            .ok();
    });
}

/// Allow time for async operations
const TEST_TIMEOUT: Duration = Duration::from_secs(10);
const SHORT_TIMEOUT: Duration = Duration::from_secs(2);

async fn try_spawn(network: &Arc<MemoryNetwork>, tweak: impl FnOnce(&mut HostConfig)) -> anyhow::Result<Host> {
    let mut config = HostConfig {
        listen_addrs: vec![Multiaddr::memory(0)],
        ..Default::default()
    };
    tweak(&mut config);
    Host::new(
        Keypair::generate_ed25519().expect("keygen failed"),
        config,
        Arc::new(MemoryTransport::new(network.clone())),
        Arc::new(MemoryDatastore::new()),
    )
    .await
}

async fn spawn_host(network: &Arc<MemoryNetwork>) -> Host {
    try_spawn(network, |_| {}).await.expect("host start failed")
}

fn dial_addr(host: &Host) -> Multiaddr {
    host.listen_addrs()[0].with_peer_id(host.peer_id())
}

async fn next_matching<F>(events: &mut broadcast::Receiver<HostEvent>, mut pred: F) -> HostEvent
where
    F: FnMut(&HostEvent) -> bool,
{
    timeout(TEST_TIMEOUT, async {
        loop {
            match events.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("expected event never arrived")
}

async fn identified(events: &mut broadcast::Receiver<HostEvent>, peer: PeerId) -> Vec<String> {
    match next_matching(events, |e| matches!(e, HostEvent::PeerIdentified { peer: p, .. } if *p == peer)).await {
        HostEvent::PeerIdentified { protocols, .. } => protocols,
        _ => unreachable!(),
    }
}

// ============================================================================
// Construction
// ============================================================================

#[tokio::test]
async fn host_identity_and_listen_addrs() {
    let network = MemoryNetwork::new();
    let keypair = Keypair::generate_ed25519().expect("keygen failed");
    let expected = keypair.peer_id();
    let host = Host::new(
        keypair,
        HostConfig {
            listen_addrs: vec![Multiaddr::memory(0)],
            ..Default::default()
        },
        Arc::new(MemoryTransport::new(network)),
        Arc::new(MemoryDatastore::new()),
    )
    .await
    .expect("host start failed");

    assert_eq!(host.peer_id(), expected);
    assert_eq!(host.public_key().to_peer_id(), expected);
    let listen = host.listen_addrs();
    assert_eq!(listen.len(), 1);
    assert_ne!(listen[0].memory_port(), Some(0), "port 0 should be resolved");
    assert!(host.protocols().iter().any(|p| p.contains("gossipsub")));
    assert_eq!(host.connection_count(), 0);
    assert!(host.peerstore().peer_record(&expected).is_some());
}

#[tokio::test]
async fn invalid_config_is_rejected() {
    let network = MemoryNetwork::new();
    let err = match try_spawn(&network, |c| {
        c.conn_manager.low_water = 50;
        c.conn_manager.high_water = 10;
    })
    .await
    {
        Ok(_) => panic!("contradictory watermarks accepted"),
        Err(e) => e,
    };
    assert!(matches!(
        err.downcast_ref::<ConfigError>(),
        Some(ConfigError::Watermarks { low: 50, high: 10 })
    ));

    let err = match try_spawn(&network, |c| c.security.protocols.clear()).await {
        Ok(_) => panic!("empty security list accepted"),
        Err(e) => e,
    };
    assert!(matches!(err.downcast_ref::<ConfigError>(), Some(ConfigError::NoSecurityProtocols)));
}

#[tokio::test]
async fn listen_on_taken_port_fails() {
    let network = MemoryNetwork::new();
    let first = spawn_host(&network).await;
    let taken = first.listen_addrs()[0].clone();
    let result = try_spawn(&network, |c| c.listen_addrs = vec![taken]).await;
    assert!(result.is_err(), "second listener on the same port should fail");
}

// ============================================================================
// Connection Lifecycle
// ============================================================================

#[tokio::test]
async fn dial_emits_connected_and_identified_events() {
    init_tracing();
    let network = MemoryNetwork::new();
    let a = spawn_host(&network).await;
    let b = spawn_host(&network).await;
    let mut a_events = a.events();
    let mut b_events = b.events();

    let remote = timeout(TEST_TIMEOUT, a.dial(&dial_addr(&b)))
        .await
        .expect("dial timed out")
        .expect("dial failed");
    assert_eq!(remote, b.peer_id());

    let connected = next_matching(&mut b_events, |e| matches!(e, HostEvent::Connected { .. })).await;
    match connected {
        HostEvent::Connected { peer, .. } => assert_eq!(peer, a.peer_id()),
        _ => unreachable!(),
    }
    let protocols = identified(&mut a_events, b.peer_id()).await;
    assert_eq!(protocols, b.protocols());

    // Identify populated the peerstore.
    assert!(a.peerstore().supports_protocol(&b.peer_id(), &b.protocols()[0]));
    assert!(!a.peerstore().addrs_for(&b.peer_id()).is_empty());
    assert_eq!(a.connected_peers(), vec![b.peer_id()]);
    assert_eq!(a.connection_count(), 1);
}

#[tokio::test]
async fn dial_with_wrong_peer_id_fails() {
    let network = MemoryNetwork::new();
    let a = spawn_host(&network).await;
    let b = spawn_host(&network).await;
    let imposter = Keypair::generate_ed25519().expect("keygen failed").peer_id();

    let addr = b.listen_addrs()[0].with_peer_id(imposter);
    let result = timeout(TEST_TIMEOUT, a.dial(&addr)).await.expect("dial hung");
    assert!(result.is_err(), "authenticated identity must match the dialed one");
    assert!(!a.is_connected(&b.peer_id()));
    assert_eq!(a.metrics().await.handshakes_failed, 1);
}

#[tokio::test]
async fn dial_nothing_listening_fails() {
    let network = MemoryNetwork::new();
    let a = spawn_host(&network).await;
    let ghost = Keypair::generate_ed25519().expect("keygen failed").peer_id();
    let addr = Multiaddr::memory(60_000).with_peer_id(ghost);
    assert!(a.dial(&addr).await.is_err());
}

#[tokio::test]
async fn connect_by_peer_id_uses_peerstore() {
    let network = MemoryNetwork::new();
    let a = spawn_host(&network).await;
    let b = spawn_host(&network).await;
    a.peerstore().add_addrs(
        &b.peer_id(),
        &b.listen_addrs(),
        peerweave::peerstore::PERMANENT_ADDR_TTL,
    );

    timeout(TEST_TIMEOUT, a.connect(b.peer_id()))
        .await
        .expect("connect timed out")
        .expect("connect failed");
    assert!(a.is_connected(&b.peer_id()));
}

#[tokio::test]
async fn no_common_security_protocol_fails() {
    let network = MemoryNetwork::new();
    let a = try_spawn(&network, |c| c.security.protocols = vec![SecurityProtocol::ChaCha20Poly1305])
        .await
        .expect("a start failed");
    let b = try_spawn(&network, |c| c.security.protocols = vec![SecurityProtocol::XChaCha20Poly1305])
        .await
        .expect("b start failed");

    let result = timeout(TEST_TIMEOUT, a.dial(&dial_addr(&b))).await.expect("dial hung");
    assert!(result.is_err());
    assert!(!a.is_connected(&b.peer_id()));
}

#[tokio::test]
async fn silent_listener_hits_upgrade_timeout() {
    let network = MemoryNetwork::new();
    let a = try_spawn(&network, |c| c.upgrade_timeout = Duration::from_millis(300))
        .await
        .expect("host start failed");

    // Accepts the raw link and never speaks.
    let raw = MemoryTransport::new(network.clone());
    let mut listener = raw.listen(&Multiaddr::memory(0)).await.expect("raw listen failed");
    let silent_addr = listener.local_addr();
    let holder = tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((conn, _)) = listener.accept().await {
            held.push(conn);
        }
    });

    let someone = Keypair::generate_ed25519().expect("keygen failed").peer_id();
    let result = timeout(SHORT_TIMEOUT, a.dial(&silent_addr.with_peer_id(someone)))
        .await
        .expect("upgrade timeout did not fire");
    assert!(result.is_err());
    assert_eq!(a.metrics().await.handshakes_failed, 1);
    holder.abort();
}

#[tokio::test]
async fn disconnect_emits_event_on_both_sides() {
    init_tracing();
    let network = MemoryNetwork::new();
    let a = spawn_host(&network).await;
    let b = spawn_host(&network).await;
    let mut a_events = a.events();
    let mut b_events = b.events();
    a.dial(&dial_addr(&b)).await.expect("dial failed");
    identified(&mut a_events, b.peer_id()).await;

    a.disconnect(&b.peer_id());
    next_matching(&mut a_events, |e| {
        matches!(e, HostEvent::Disconnected { peer, .. } if *peer == b.peer_id())
    })
    .await;
    next_matching(&mut b_events, |e| {
        matches!(e, HostEvent::Disconnected { peer, .. } if *peer == a.peer_id())
    })
    .await;
    assert!(!a.is_connected(&b.peer_id()));
    assert!(a.connection_addrs(&b.peer_id()).is_empty());
}

// ============================================================================
// Discovery
// ============================================================================

#[tokio::test]
async fn advertise_and_find_peers_through_hub() {
    init_tracing();
    let network = MemoryNetwork::new();
    let hub = spawn_host(&network).await;
    let provider = spawn_host(&network).await;
    let seeker = spawn_host(&network).await;

    for host in [&provider, &seeker] {
        let mut events = host.events();
        host.dial(&dial_addr(&hub)).await.expect("dial hub failed");
        identified(&mut events, hub.peer_id()).await;
    }

    let ttl = provider
        .advertise("chat-service", Duration::from_secs(600))
        .await
        .expect("advertise failed");
    assert!(ttl > Duration::ZERO);

    let found = timeout(TEST_TIMEOUT, seeker.find_peers("chat-service", 10))
        .await
        .expect("find_peers timed out")
        .expect("find_peers failed");
    assert!(
        found.iter().any(|r| r.peer_id == provider.peer_id()),
        "provider should be discoverable"
    );
    assert!(!seeker.peerstore().addrs_for(&provider.peer_id()).is_empty());

    // Within the backoff window the answer comes from cache.
    let again = seeker.find_peers("chat-service", 10).await.expect("second lookup failed");
    assert_eq!(again.len(), found.len());
    let snapshot = seeker.metrics().await;
    assert_eq!(snapshot.discovery_cache_misses, 1);
    assert!(snapshot.discovery_cache_hits >= 1);

    // With an address in hand the seeker can connect by id alone.
    seeker.connect(provider.peer_id()).await.expect("connect to provider failed");
    assert!(seeker.is_connected(&provider.peer_id()));
}

#[tokio::test]
async fn bootstrap_peers_are_dialed_at_startup() {
    init_tracing();
    let network = MemoryNetwork::new();
    let seed = spawn_host(&network).await;
    let seed_addr = dial_addr(&seed);
    let joiner = try_spawn(&network, move |c| c.bootstrap_peers = vec![seed_addr])
        .await
        .expect("joiner start failed");

    timeout(TEST_TIMEOUT, async {
        while joiner.routing_table_size().await == 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("bootstrap never populated routing");
    assert!(joiner.is_connected(&seed.peer_id()));
}

// ============================================================================
// Shutdown
// ============================================================================

#[tokio::test]
async fn shutdown_closes_connections() {
    let network = MemoryNetwork::new();
    let a = spawn_host(&network).await;
    let b = spawn_host(&network).await;
    let mut b_events = b.events();
    a.dial(&dial_addr(&b)).await.expect("dial failed");
    identified(&mut b_events, a.peer_id()).await;

    a.shutdown();
    assert!(a.is_shut_down());
    next_matching(&mut b_events, |e| {
        matches!(e, HostEvent::Disconnected { peer, .. } if *peer == a.peer_id())
    })
    .await;
    assert!(!b.is_connected(&a.peer_id()));

    // Idempotent.
    a.shutdown();
    assert!(a.is_shut_down());
}
