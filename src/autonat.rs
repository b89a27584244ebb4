//! # Reachability Probe
//!
//! Determines whether the local host can be dialed directly.
//!
//! The client asks up to `max_peers` connected peers to dial its listen
//! addresses back. One confirmed dial-back makes the host [`Reachability::Public`];
//! refusals from every peer that answered make it [`Reachability::Private`].
//! A round with no answers keeps the previous verdict.
//!
//! The server side ([`AutoNatServer`]) only dials addresses on the same host
//! the request arrived from.
//! SECURITY: otherwise any peer could point our dialer at a third party.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, trace};

use crate::config::ConfigError;
use crate::identity::PeerId;
use crate::messages::{DialBackRequest, DialBackResponse};
use crate::multiaddr::{Multiaddr, Protocol};
use crate::protocols::{DialBackDialer, DialBackRpc, ReachabilityProbe};

pub const DEFAULT_MAX_PROBE_PEERS: usize = 3;
pub const DEFAULT_DIAL_BACK_TIMEOUT: Duration = Duration::from_secs(5);
/// A verdict is reused for this long before peers are asked again.
pub const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(60);
/// Addresses a server tries per request.
pub const MAX_DIAL_BACK_ADDRS: usize = 8;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Reachability {
    #[default]
    Unknown,
    Public,
    Private,
}

#[derive(Clone, Debug)]
pub struct AutoNatConfig {
    /// Skip probing and report this value.
    pub forced: Option<Reachability>,
    pub max_peers: usize,
    pub dial_back_timeout: Duration,
    pub probe_interval: Duration,
}

impl Default for AutoNatConfig {
    fn default() -> Self {
        Self {
            forced: None,
            max_peers: DEFAULT_MAX_PROBE_PEERS,
            dial_back_timeout: DEFAULT_DIAL_BACK_TIMEOUT,
            probe_interval: DEFAULT_PROBE_INTERVAL,
        }
    }
}

impl AutoNatConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.forced.is_none() && self.max_peers == 0 {
            return Err(ConfigError::Relay("autonat.max_peers must be non-zero".into()));
        }
        if self.dial_back_timeout.is_zero() {
            return Err(ConfigError::ZeroDuration("autonat.dial_back_timeout"));
        }
        Ok(())
    }
}

// ============================================================================
// Client
// ============================================================================

struct Verdict {
    status: Reachability,
    checked_at: Option<Instant>,
}

pub struct AutoNat<D: DialBackRpc> {
    rpc: Arc<D>,
    config: AutoNatConfig,
    verdict: Mutex<Verdict>,
}

impl<D: DialBackRpc> AutoNat<D> {
    pub fn new(rpc: Arc<D>, config: AutoNatConfig) -> Self {
        Self {
            rpc,
            config,
            verdict: Mutex::new(Verdict {
                status: Reachability::Unknown,
                checked_at: None,
            }),
        }
    }

    /// Last verdict without probing.
    pub fn status(&self) -> Reachability {
        self.config.forced.unwrap_or(self.verdict.lock().status)
    }

    /// Ask peers to dial back now, ignoring the cached verdict.
    pub async fn refresh(&self) -> Reachability {
        if let Some(forced) = self.config.forced {
            return forced;
        }
        let addrs = self.rpc.listen_addrs();
        let peers: Vec<PeerId> = self
            .rpc
            .dial_back_peers()
            .into_iter()
            .take(self.config.max_peers)
            .collect();
        if addrs.is_empty() || peers.is_empty() {
            trace!("no listen addrs or probe peers, reachability unchanged");
            return self.status();
        }

        let timeout = self.config.dial_back_timeout;
        let answers = join_all(peers.iter().map(|peer| {
            let addrs = addrs.clone();
            async move {
                // The server may try several addrs, each up to the timeout.
                let budget = timeout * addrs.len().min(MAX_DIAL_BACK_ADDRS) as u32 + timeout;
                match tokio::time::timeout(budget, self.rpc.request_dial_back(*peer, addrs)).await {
                    Ok(Ok(resp)) => Some(resp),
                    Ok(Err(e)) => {
                        debug!(peer = %peer, error = %e, "dial-back request failed");
                        None
                    }
                    Err(_) => None,
                }
            }
        }))
        .await;

        let answered: Vec<DialBackResponse> = answers.into_iter().flatten().collect();
        let mut verdict = self.verdict.lock();
        verdict.checked_at = Some(Instant::now());
        let next = if answered.iter().any(|r| r.reachable) {
            Reachability::Public
        } else if !answered.is_empty() {
            Reachability::Private
        } else {
            verdict.status
        };
        if next != verdict.status {
            info!(from = ?verdict.status, to = ?next, "reachability changed");
            verdict.status = next;
        }
        next
    }
}

#[async_trait]
impl<D: DialBackRpc> ReachabilityProbe for AutoNat<D> {
    async fn probe(&self) -> Reachability {
        if let Some(forced) = self.config.forced {
            return forced;
        }
        {
            let verdict = self.verdict.lock();
            if let Some(at) = verdict.checked_at
                && at.elapsed() < self.config.probe_interval
            {
                return verdict.status;
            }
        }
        self.refresh().await
    }
}

// ============================================================================
// Server
// ============================================================================

pub struct AutoNatServer<T: DialBackDialer> {
    dialer: Arc<T>,
    timeout: Duration,
}

impl<T: DialBackDialer> AutoNatServer<T> {
    pub fn new(dialer: Arc<T>, timeout: Duration) -> Self {
        Self { dialer, timeout }
    }

    /// Try the requested addresses that share a host with `observed`, in
    /// order, stopping at the first that answers as `from`.
    pub async fn handle(&self, from: PeerId, observed: &Multiaddr, request: DialBackRequest) -> DialBackResponse {
        let candidates = same_host_addrs(observed, &request.addrs);
        for addr in candidates.into_iter().take(MAX_DIAL_BACK_ADDRS) {
            let target = addr.without_peer_id();
            match tokio::time::timeout(self.timeout, self.dialer.dial_back(&target, from)).await {
                Ok(Ok(())) => {
                    debug!(peer = %from, addr = %target, "dial-back succeeded");
                    return DialBackResponse {
                        reachable: true,
                        addr: Some(target),
                    };
                }
                Ok(Err(e)) => trace!(peer = %from, addr = %target, error = %e, "dial-back failed"),
                Err(_) => trace!(peer = %from, addr = %target, "dial-back timed out"),
            }
        }
        DialBackResponse {
            reachable: false,
            addr: None,
        }
    }
}

/// Requested addresses on the same host as the observed remote address.
/// Relay circuits never qualify.
pub fn same_host_addrs(observed: &Multiaddr, requested: &[Multiaddr]) -> Vec<Multiaddr> {
    let host = |addr: &Multiaddr| match addr.iter().next() {
        Some(Protocol::Ip4(ip)) => Some(Protocol::Ip4(*ip)),
        Some(Protocol::Ip6(ip)) => Some(Protocol::Ip6(*ip)),
        Some(Protocol::Memory(_)) => Some(Protocol::Memory(0)),
        _ => None,
    };
    let Some(observed_host) = host(observed) else {
        return Vec::new();
    };
    requested
        .iter()
        .filter(|a| !a.is_circuit() && host(a).as_ref() == Some(&observed_host))
        .cloned()
        .collect()
}
