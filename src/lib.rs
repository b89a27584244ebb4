//! # peerweave - Peer-to-Peer Node Core
//!
//! peerweave is the networking core of a peer-to-peer node:
//!
//! - **Identity**: Ed25519 keypairs, peer ids derived from public keys
//! - **Secure connections**: negotiated authenticated encryption, then stream
//!   multiplexing, over any raw transport (TCP, in-memory)
//! - **Connection management**: watermark trimming with tags, protection and
//!   a grace period
//! - **Relay**: AutoRelay reservations for privately reachable hosts and a
//!   bounded hop service for others
//! - **Routing**: Kademlia-style provider records and peer lookup behind a
//!   per-key discovery backoff
//! - **PubSub**: GossipSub mesh with signatures, dedup and IHAVE/IWANT gossip
//!
//! ## Architecture
//!
//! Stateful components follow the **Actor Pattern**:
//! - a cheap-to-clone handle sends commands over an `mpsc` channel
//! - a private actor task owns the state and runs a `select!` loop over
//!   commands, a heartbeat and the host cancellation token
//!
//! Components reach the network only through the traits in [`protocols`], so
//! each is testable against mocks. [`Host`] wires them together.
//!
//! ## Security Model
//!
//! - Every connection is mutually authenticated; a peer id is bound to the
//!   key that signed the handshake
//! - Signatures are domain-separated per protocol
//! - Every wire message is size-bounded before it is decoded
//! - Caches, tables and queues are bounded and rate limited
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `host` | High-level API combining all components |
//! | `identity` | Keypairs, public keys, peer ids |
//! | `crypto` | Domain-separated signatures |
//! | `multiaddr` | Structured addresses, including relay circuits |
//! | `peerstore` | Addresses, keys and protocols per peer |
//! | `datastore` | Key/value persistence boundary |
//! | `transport` | Raw links: TCP and in-memory |
//! | `security` | Security protocol negotiation and encrypted sessions |
//! | `muxer` | Flow-controlled streams over one session |
//! | `upgrader` | Raw link to authenticated, multiplexed connection |
//! | `connmgr` | Watermark-based connection trimming |
//! | `relay` | Relay hop service and AutoRelay |
//! | `autonat` | Reachability via dial-back |
//! | `dht` | Routing table, provider records, iterative lookups |
//! | `discovery` | Per-key backoff and query coalescing |
//! | `gossipsub` | Topic mesh pubsub |
//! | `protocols` | Protocol ids and component seams |
//! | `messages` | Wire types and bounded framing |
//! | `metrics` | Counters and snapshots |
//! | `config` | Host configuration and validation |

pub mod autonat;
pub mod config;
pub mod connmgr;
pub mod crypto;
pub mod datastore;
pub mod dht;
pub mod discovery;
pub mod gossipsub;
pub mod host;
pub mod identity;
pub mod messages;
pub mod metrics;
pub mod multiaddr;
pub mod muxer;
mod network;
pub mod peerstore;
pub mod protocols;
pub mod relay;
pub mod security;
pub mod transport;
pub mod upgrader;

pub use autonat::Reachability;
pub use config::{ConfigError, HostConfig};
pub use datastore::{Datastore, MemoryDatastore};
pub use gossipsub::{ReceivedMessage, Subscription};
pub use host::{Host, HostEvent};
pub use identity::{KeyType, Keypair, PeerId, PublicKey};
pub use messages::MessageId;
pub use metrics::MetricsSnapshot;
pub use multiaddr::{Multiaddr, Protocol};
pub use peerstore::{PeerRecord, Peerstore};
pub use transport::{MemoryNetwork, MemoryTransport, TcpTransport, Transport};
