//! Host configuration.
//!
//! Every component owns its config struct with documented defaults and a
//! `validate()`; [`HostConfig`] aggregates them and is checked once by
//! `Host::new`. A contradiction here is fatal at startup.

use std::time::Duration;

use thiserror::Error;

use crate::autonat::AutoNatConfig;
use crate::connmgr::ConnManagerConfig;
use crate::dht::KadConfig;
use crate::discovery::BackoffConfig;
use crate::gossipsub::GossipSubConfig;
use crate::multiaddr::Multiaddr;
use crate::muxer::MuxConfig;
use crate::relay::{AutoRelayConfig, RelayServiceConfig};
use crate::security::SecurityConfig;

/// Overall deadline for security negotiation plus mux setup.
pub const DEFAULT_UPGRADE_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("at least one security protocol must be configured")]
    NoSecurityProtocols,
    #[error("security protocol {0} listed twice")]
    DuplicateSecurityProtocol(String),
    #[error("{0} must be non-zero")]
    ZeroDuration(&'static str),
    #[error("low watermark ({low}) must be below high watermark ({high})")]
    Watermarks { low: usize, high: usize },
    #[error("invalid mux config: {0}")]
    Mux(String),
    #[error("invalid discovery backoff: {0}")]
    Backoff(String),
    #[error("invalid gossipsub config: {0}")]
    GossipSub(String),
    #[error("invalid routing config: {0}")]
    Kad(String),
    #[error("invalid relay config: {0}")]
    Relay(String),
    #[error("address {0} must end with /p2p/<peer id>")]
    MissingPeerId(Multiaddr),
}

#[derive(Clone, Debug)]
pub struct HostConfig {
    /// Addresses to listen on; `/memory/0` or `/ip4/.../tcp/0` pick a free port.
    pub listen_addrs: Vec<Multiaddr>,
    /// Peers dialed at startup to seed routing, as `<addr>/p2p/<id>`.
    pub bootstrap_peers: Vec<Multiaddr>,
    pub upgrade_timeout: Duration,
    pub security: SecurityConfig,
    pub mux: MuxConfig,
    pub conn_manager: ConnManagerConfig,
    pub discovery_backoff: BackoffConfig,
    pub gossipsub: GossipSubConfig,
    pub kad: KadConfig,
    pub auto_relay: AutoRelayConfig,
    pub relay_service: RelayServiceConfig,
    pub autonat: AutoNatConfig,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            listen_addrs: Vec::new(),
            bootstrap_peers: Vec::new(),
            upgrade_timeout: DEFAULT_UPGRADE_TIMEOUT,
            security: SecurityConfig::default(),
            mux: MuxConfig::default(),
            conn_manager: ConnManagerConfig::default(),
            discovery_backoff: BackoffConfig::default(),
            gossipsub: GossipSubConfig::default(),
            kad: KadConfig::default(),
            auto_relay: AutoRelayConfig::default(),
            relay_service: RelayServiceConfig::default(),
            autonat: AutoNatConfig::default(),
        }
    }
}

impl HostConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.upgrade_timeout.is_zero() {
            return Err(ConfigError::ZeroDuration("upgrade_timeout"));
        }
        for addr in &self.bootstrap_peers {
            if addr.peer_id().is_none() {
                return Err(ConfigError::MissingPeerId(addr.clone()));
            }
        }
        self.security.validate()?;
        self.mux.validate()?;
        self.conn_manager.validate()?;
        self.discovery_backoff.validate()?;
        self.gossipsub.validate()?;
        self.kad.validate()?;
        self.auto_relay.validate()?;
        self.relay_service.validate()?;
        self.autonat.validate()?;
        Ok(())
    }
}
