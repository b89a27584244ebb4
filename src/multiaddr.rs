//! # Multiaddresses
//!
//! A [`Multiaddr`] is an ordered stack of [`Protocol`] components, rendered as
//! `/ip4/10.0.0.1/tcp/4001/p2p/<peer>`. Relay-routed addresses nest a second
//! stack after a `p2p-circuit` marker:
//!
//! ```text
//! /ip4/10.0.0.1/tcp/4001/p2p/<relay>/p2p-circuit/p2p/<target>
//! ```
//!
//! The `memory` component addresses the in-process transport used by tests.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::identity::PeerId;

/// Upper bound on components accepted from text or the wire.
pub const MAX_MULTIADDR_COMPONENTS: usize = 16;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MultiaddrError {
    #[error("multiaddr must start with '/'")]
    MissingLeadingSlash,
    #[error("unknown protocol '{0}'")]
    UnknownProtocol(String),
    #[error("missing value for protocol '{0}'")]
    MissingValue(String),
    #[error("invalid value '{value}' for protocol '{protocol}'")]
    InvalidValue { protocol: String, value: String },
    #[error("multiaddr has too many components")]
    TooLong,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Protocol {
    Ip4(Ipv4Addr),
    Ip6(Ipv6Addr),
    Dns(String),
    Tcp(u16),
    Udp(u16),
    Memory(u64),
    P2p(PeerId),
    P2pCircuit,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Ip4(ip) => write!(f, "/ip4/{ip}"),
            Protocol::Ip6(ip) => write!(f, "/ip6/{ip}"),
            Protocol::Dns(host) => write!(f, "/dns/{host}"),
            Protocol::Tcp(port) => write!(f, "/tcp/{port}"),
            Protocol::Udp(port) => write!(f, "/udp/{port}"),
            Protocol::Memory(port) => write!(f, "/memory/{port}"),
            Protocol::P2p(peer) => write!(f, "/p2p/{peer}"),
            Protocol::P2pCircuit => f.write_str("/p2p-circuit"),
        }
    }
}

#[derive(Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Multiaddr(Vec<Protocol>);

impl Multiaddr {
    pub fn empty() -> Self {
        Self(Vec::new())
    }

    pub fn memory(port: u64) -> Self {
        Self(vec![Protocol::Memory(port)])
    }

    pub fn from_socket_addr(addr: SocketAddr) -> Self {
        let ip = match addr.ip() {
            IpAddr::V4(ip) => Protocol::Ip4(ip),
            IpAddr::V6(ip) => Protocol::Ip6(ip),
        };
        Self(vec![ip, Protocol::Tcp(addr.port())])
    }

    pub fn with(mut self, protocol: Protocol) -> Self {
        self.0.push(protocol);
        self
    }

    pub fn push(&mut self, protocol: Protocol) {
        self.0.push(protocol);
    }

    pub fn iter(&self) -> impl Iterator<Item = &Protocol> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The trailing `/p2p/<id>` component, if any.
    pub fn peer_id(&self) -> Option<PeerId> {
        match self.0.last() {
            Some(Protocol::P2p(peer)) => Some(*peer),
            _ => None,
        }
    }

    /// Address with a trailing `/p2p/<id>` removed.
    pub fn without_peer_id(&self) -> Multiaddr {
        let mut out = self.clone();
        if matches!(out.0.last(), Some(Protocol::P2p(_))) {
            out.0.pop();
        }
        out
    }

    /// Append `/p2p/<id>` unless the address already ends with it.
    pub fn with_peer_id(&self, peer: PeerId) -> Multiaddr {
        if self.peer_id() == Some(peer) {
            return self.clone();
        }
        self.without_peer_id().with(Protocol::P2p(peer))
    }

    pub fn is_circuit(&self) -> bool {
        self.0.iter().any(|p| matches!(p, Protocol::P2pCircuit))
    }

    /// Split a relay-routed address into the relay part and the target.
    ///
    /// For `/ip4/../tcp/1/p2p/R/p2p-circuit/p2p/T` this yields
    /// (`/ip4/../tcp/1/p2p/R`, relay `R`, target `Some(T)`).
    pub fn split_circuit(&self) -> Option<(Multiaddr, PeerId, Option<PeerId>)> {
        let idx = self.0.iter().position(|p| matches!(p, Protocol::P2pCircuit))?;
        let relay_addr = Multiaddr(self.0[..idx].to_vec());
        let relay = relay_addr.peer_id()?;
        let target = match &self.0[idx + 1..] {
            [] => None,
            [Protocol::P2p(peer)] => Some(*peer),
            _ => return None,
        };
        Some((relay_addr, relay, target))
    }

    pub fn to_socket_addr(&self) -> Option<SocketAddr> {
        let mut iter = self.0.iter();
        let ip = match iter.next()? {
            Protocol::Ip4(ip) => IpAddr::V4(*ip),
            Protocol::Ip6(ip) => IpAddr::V6(*ip),
            _ => return None,
        };
        match iter.next()? {
            Protocol::Tcp(port) => Some(SocketAddr::new(ip, *port)),
            _ => None,
        }
    }

    pub fn memory_port(&self) -> Option<u64> {
        match self.0.first() {
            Some(Protocol::Memory(port)) => Some(*port),
            _ => None,
        }
    }

    /// Loopback, private and link-local addresses are not useful to peers on
    /// other networks.
    pub fn is_publicly_routable(&self) -> bool {
        match self.0.first() {
            Some(Protocol::Ip4(ip)) => {
                !(ip.is_loopback() || ip.is_private() || ip.is_link_local() || ip.is_unspecified())
            }
            Some(Protocol::Ip6(ip)) => !(ip.is_loopback() || ip.is_unspecified()),
            Some(Protocol::Dns(_)) => true,
            _ => false,
        }
    }
}

impl fmt::Display for Multiaddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for p in &self.0 {
            write!(f, "{p}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Multiaddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Multiaddr({self})")
    }
}

impl FromStr for Multiaddr {
    type Err = MultiaddrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s
            .strip_prefix('/')
            .ok_or(MultiaddrError::MissingLeadingSlash)?;
        let mut parts = rest.split('/').filter(|p| !p.is_empty());
        let mut out = Vec::new();

        while let Some(name) = parts.next() {
            if out.len() >= MAX_MULTIADDR_COMPONENTS {
                return Err(MultiaddrError::TooLong);
            }
            if name == "p2p-circuit" {
                out.push(Protocol::P2pCircuit);
                continue;
            }
            let value = parts
                .next()
                .ok_or_else(|| MultiaddrError::MissingValue(name.to_string()))?;
            let invalid = || MultiaddrError::InvalidValue {
                protocol: name.to_string(),
                value: value.to_string(),
            };
            let protocol = match name {
                "ip4" => Protocol::Ip4(value.parse().map_err(|_| invalid())?),
                "ip6" => Protocol::Ip6(value.parse().map_err(|_| invalid())?),
                "dns" | "dns4" | "dns6" => Protocol::Dns(value.to_string()),
                "tcp" => Protocol::Tcp(value.parse().map_err(|_| invalid())?),
                "udp" => Protocol::Udp(value.parse().map_err(|_| invalid())?),
                "memory" => Protocol::Memory(value.parse().map_err(|_| invalid())?),
                "p2p" | "ipfs" => Protocol::P2p(value.parse().map_err(|_| invalid())?),
                other => return Err(MultiaddrError::UnknownProtocol(other.to_string())),
            };
            out.push(protocol);
        }
        Ok(Multiaddr(out))
    }
}

impl From<SocketAddr> for Multiaddr {
    fn from(addr: SocketAddr) -> Self {
        Self::from_socket_addr(addr)
    }
}

impl From<Protocol> for Multiaddr {
    fn from(protocol: Protocol) -> Self {
        Self(vec![protocol])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(byte: u8) -> PeerId {
        PeerId::from_bytes([byte; 32])
    }

    #[test]
    fn test_parse_and_display() {
        let text = format!("/ip4/127.0.0.1/tcp/4001/p2p/{}", peer(1));
        let addr: Multiaddr = text.parse().unwrap();

        assert_eq!(addr.to_string(), text);
        assert_eq!(addr.peer_id(), Some(peer(1)));
        assert_eq!(
            addr.to_socket_addr(),
            Some("127.0.0.1:4001".parse().unwrap())
        );
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(
            "ip4/1.2.3.4".parse::<Multiaddr>(),
            Err(MultiaddrError::MissingLeadingSlash)
        );
        assert!(matches!(
            "/ip4/999.1.1.1".parse::<Multiaddr>(),
            Err(MultiaddrError::InvalidValue { .. })
        ));
        assert!(matches!(
            "/quic/1".parse::<Multiaddr>(),
            Err(MultiaddrError::UnknownProtocol(_))
        ));
        assert!(matches!(
            "/tcp".parse::<Multiaddr>(),
            Err(MultiaddrError::MissingValue(_))
        ));
    }

    #[test]
    fn test_circuit_split() {
        let relay_addr = Multiaddr::memory(7).with(Protocol::P2p(peer(2)));
        let circuit = relay_addr
            .clone()
            .with(Protocol::P2pCircuit)
            .with(Protocol::P2p(peer(3)));

        assert!(circuit.is_circuit());
        let (addr, relay, target) = circuit.split_circuit().unwrap();
        assert_eq!(addr, relay_addr);
        assert_eq!(relay, peer(2));
        assert_eq!(target, Some(peer(3)));

        let reparsed: Multiaddr = circuit.to_string().parse().unwrap();
        assert_eq!(reparsed, circuit);
    }

    #[test]
    fn test_with_peer_id_is_idempotent() {
        let addr = Multiaddr::memory(1).with_peer_id(peer(4));
        assert_eq!(addr.with_peer_id(peer(4)), addr);
        assert_eq!(addr.without_peer_id(), Multiaddr::memory(1));
    }

    #[test]
    fn test_public_routability() {
        let private: Multiaddr = "/ip4/192.168.1.4/tcp/1".parse().unwrap();
        let public: Multiaddr = "/ip4/8.8.8.8/tcp/1".parse().unwrap();
        assert!(!private.is_publicly_routable());
        assert!(public.is_publicly_routable());
        assert!(!Multiaddr::memory(3).is_publicly_routable());
    }
}
