//! # Connection Upgrader
//!
//! Turns a raw transport link into a [`Connection`]: security negotiation
//! first, then stream multiplexing, always in that order and under one
//! overall deadline.
//!
//! An optional [`ConnectionGater`] can veto inbound links before any bytes are
//! exchanged and any link once the remote identity is known. A link that
//! fails, times out, is gated or is cancelled is dropped, which closes it.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::identity::{Keypair, PeerId, PublicKey};
use crate::metrics::Metrics;
use crate::multiaddr::Multiaddr;
use crate::muxer::{MuxConfig, MuxSession};
use crate::security::{HandshakeError, SecurityConfig, SecurityNegotiator, SecurityProtocol};
use crate::transport::{Direction, RawConnection};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

#[derive(Debug, Error)]
pub enum UpgradeError {
    #[error("upgrade did not finish within {0:?}")]
    Timeout(Duration),
    #[error("connection gated: {0}")]
    Gated(String),
    #[error(transparent)]
    Handshake(#[from] HandshakeError),
    #[error("upgrade cancelled")]
    Cancelled,
}

/// Admission hooks consulted during an upgrade. Both default to allowing.
pub trait ConnectionGater: Send + Sync + 'static {
    /// Inbound links only, before the handshake starts.
    fn intercept_accept(&self, _remote_addr: &Multiaddr) -> bool {
        true
    }

    /// After the remote has authenticated.
    fn intercept_secured(&self, _direction: Direction, _peer: &PeerId, _remote_addr: &Multiaddr) -> bool {
        true
    }
}

/// A secure, multiplexed link to one authenticated peer.
pub struct Connection {
    pub id: ConnectionId,
    pub remote_peer: PeerId,
    pub remote_public_key: PublicKey,
    pub remote_addr: Multiaddr,
    pub direction: Direction,
    pub security: SecurityProtocol,
    pub opened_at: Instant,
    pub session: MuxSession,
}

impl Connection {
    pub fn close(&self) {
        self.session.close();
    }

    pub fn is_closed(&self) -> bool {
        self.session.is_closed()
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("remote_peer", &self.remote_peer)
            .field("remote_addr", &self.remote_addr)
            .field("direction", &self.direction)
            .finish_non_exhaustive()
    }
}

pub struct Upgrader {
    negotiator: SecurityNegotiator,
    mux_config: MuxConfig,
    timeout: Duration,
    gater: Option<Arc<dyn ConnectionGater>>,
    metrics: Arc<Metrics>,
    cancel: CancellationToken,
}

impl Upgrader {
    pub fn new(
        keypair: Keypair,
        security: SecurityConfig,
        mux_config: MuxConfig,
        timeout: Duration,
        metrics: Arc<Metrics>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            negotiator: SecurityNegotiator::new(keypair, security),
            mux_config,
            timeout,
            gater: None,
            metrics,
            cancel,
        }
    }

    pub fn with_gater(mut self, gater: Arc<dyn ConnectionGater>) -> Self {
        self.gater = Some(gater);
        self
    }

    pub async fn upgrade(
        &self,
        raw: RawConnection,
        direction: Direction,
        remote_addr: Multiaddr,
        expected: Option<PeerId>,
    ) -> Result<Connection, UpgradeError> {
        if direction == Direction::Inbound
            && let Some(gater) = &self.gater
            && !gater.intercept_accept(&remote_addr)
        {
            debug!(addr = %remote_addr, "inbound link refused by gater");
            return Err(UpgradeError::Gated(format!("inbound from {remote_addr} refused")));
        }

        let result = tokio::select! {
            _ = self.cancel.cancelled() => Err(UpgradeError::Cancelled),
            outcome = tokio::time::timeout(self.timeout, self.secure_and_mux(raw, direction, &remote_addr, expected)) => {
                outcome.unwrap_or(Err(UpgradeError::Timeout(self.timeout)))
            }
        };

        match &result {
            Ok(conn) => {
                Metrics::incr(&self.metrics.handshakes_succeeded);
                debug!(
                    peer = %conn.remote_peer,
                    conn = %conn.id,
                    addr = %conn.remote_addr,
                    direction = ?direction,
                    "connection upgraded"
                );
            }
            Err(e) => {
                Metrics::incr(&self.metrics.handshakes_failed);
                debug!(addr = %remote_addr, direction = ?direction, error = %e, "upgrade failed");
            }
        }
        result
    }

    async fn secure_and_mux(
        &self,
        raw: RawConnection,
        direction: Direction,
        remote_addr: &Multiaddr,
        expected: Option<PeerId>,
    ) -> Result<Connection, UpgradeError> {
        // The upgrade deadline is the one callers see, whichever timer fired.
        let secure = match self.negotiator.negotiate(raw, direction, expected).await {
            Ok(secure) => secure,
            Err(HandshakeError::Timeout) => return Err(UpgradeError::Timeout(self.timeout)),
            Err(e) => return Err(e.into()),
        };
        let remote_peer = secure.remote_peer();

        if let Some(gater) = &self.gater
            && !gater.intercept_secured(direction, &remote_peer, remote_addr)
        {
            return Err(UpgradeError::Gated(format!("peer {remote_peer} refused")));
        }

        Ok(Connection {
            id: ConnectionId::next(),
            remote_peer,
            remote_public_key: secure.remote_public_key(),
            remote_addr: remote_addr.clone(),
            direction,
            security: secure.protocol(),
            opened_at: Instant::now(),
            session: MuxSession::spawn(secure, direction, self.mux_config.clone()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    fn upgrader(timeout: Duration) -> (Upgrader, Arc<Metrics>) {
        upgrader_with(Keypair::generate_ed25519().unwrap(), timeout)
    }

    fn upgrader_with(keypair: Keypair, timeout: Duration) -> (Upgrader, Arc<Metrics>) {
        let metrics = Arc::new(Metrics::default());
        let up = Upgrader::new(
            keypair,
            SecurityConfig::default(),
            MuxConfig::default(),
            timeout,
            metrics.clone(),
            CancellationToken::new(),
        );
        (up, metrics)
    }

    fn pipe() -> (RawConnection, RawConnection) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        (Box::new(a), Box::new(b))
    }

    #[tokio::test]
    async fn both_sides_upgrade() {
        let ka = Keypair::generate_ed25519().unwrap();
        let kb = Keypair::generate_ed25519().unwrap();
        let (ua, ma) = upgrader_with(ka.clone(), Duration::from_secs(5));
        let (ub, _) = upgrader_with(kb.clone(), Duration::from_secs(5));
        let (a, b) = pipe();

        let (ca, cb) = tokio::join!(
            ua.upgrade(a, Direction::Outbound, Multiaddr::memory(2), Some(kb.peer_id())),
            ub.upgrade(b, Direction::Inbound, Multiaddr::memory(1), None)
        );
        let (ca, cb) = (ca.unwrap(), cb.unwrap());
        assert_eq!(ca.remote_peer, kb.peer_id());
        assert_eq!(cb.remote_peer, ka.peer_id());
        assert_ne!(ca.id, cb.id);
        assert_eq!(ca.direction, Direction::Outbound);
        assert_eq!(ma.snapshot().handshakes_succeeded, 1);

        let mut s = ca.session.open_stream().await.unwrap();
        s.write(b"hi").await.unwrap();
        let mut r = cb.session.accept().await.unwrap();
        assert_eq!(r.read().await.unwrap().unwrap(), b"hi");
    }

    #[tokio::test(start_paused = true)]
    async fn silent_remote_times_out_and_link_is_closed() {
        let (up, metrics) = upgrader(Duration::from_secs(2));
        let (a, mut remote) = pipe();

        let started = Instant::now();
        let err = up
            .upgrade(a, Direction::Outbound, Multiaddr::memory(9), None)
            .await
            .unwrap_err();
        assert!(matches!(err, UpgradeError::Timeout(d) if d == Duration::from_secs(2)));
        assert!(started.elapsed() <= Duration::from_secs(2) + Duration::from_millis(10));
        assert_eq!(metrics.snapshot().handshakes_failed, 1);

        // The proposal was written, then the link was dropped: EOF follows.
        let mut seen = Vec::new();
        remote.read_to_end(&mut seen).await.unwrap();
        assert!(!seen.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn default_deadlines_report_upgrade_timeout() {
        let (up, metrics) = upgrader(crate::config::DEFAULT_UPGRADE_TIMEOUT);
        let (a, _remote) = pipe();

        let started = Instant::now();
        let err = up
            .upgrade(a, Direction::Outbound, Multiaddr::memory(9), None)
            .await
            .unwrap_err();
        assert!(
            matches!(err, UpgradeError::Timeout(d) if d == crate::config::DEFAULT_UPGRADE_TIMEOUT),
            "got {err:?}"
        );
        assert!(started.elapsed() <= crate::config::DEFAULT_UPGRADE_TIMEOUT + Duration::from_millis(10));
        assert_eq!(metrics.snapshot().handshakes_failed, 1);
    }

    struct DenyAll;

    impl ConnectionGater for DenyAll {
        fn intercept_accept(&self, _: &Multiaddr) -> bool {
            false
        }
    }

    struct DenyPeer(PeerId);

    impl ConnectionGater for DenyPeer {
        fn intercept_secured(&self, _: Direction, peer: &PeerId, _: &Multiaddr) -> bool {
            *peer != self.0
        }
    }

    #[tokio::test]
    async fn gater_rejects_inbound_before_handshake() {
        let (up, _) = upgrader(Duration::from_secs(5));
        let up = up.with_gater(Arc::new(DenyAll));
        let (_a, b) = pipe();
        let err = up
            .upgrade(b, Direction::Inbound, Multiaddr::memory(1), None)
            .await
            .unwrap_err();
        assert!(matches!(err, UpgradeError::Gated(_)));
    }

    #[tokio::test]
    async fn gater_rejects_authenticated_peer() {
        let dialer_keys = Keypair::generate_ed25519().unwrap();
        let (dialer, _) = upgrader_with(dialer_keys.clone(), Duration::from_secs(5));
        let (listener, _) = upgrader(Duration::from_secs(5));
        let listener = listener.with_gater(Arc::new(DenyPeer(dialer_keys.peer_id())));

        let (a, b) = pipe();
        let (_dial, accept) = tokio::join!(
            dialer.upgrade(a, Direction::Outbound, Multiaddr::memory(2), None),
            listener.upgrade(b, Direction::Inbound, Multiaddr::memory(1), None)
        );
        assert!(matches!(accept.unwrap_err(), UpgradeError::Gated(_)));
    }

    #[tokio::test]
    async fn cancellation_aborts_upgrade() {
        let cancel = CancellationToken::new();
        let up = Upgrader::new(
            Keypair::generate_ed25519().unwrap(),
            SecurityConfig::default(),
            MuxConfig::default(),
            Duration::from_secs(30),
            Arc::new(Metrics::default()),
            cancel.clone(),
        );
        let (a, _remote) = pipe();
        let task = tokio::spawn(async move { up.upgrade(a, Direction::Outbound, Multiaddr::memory(3), None).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        assert!(matches!(task.await.unwrap(), Err(UpgradeError::Cancelled)));
    }
}
