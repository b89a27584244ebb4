//! # Wire Protocol Messages
//!
//! Every serializable message exchanged between peers, plus the framing
//! helpers used to move them over byte streams.
//!
//! ## Protocol Types
//!
//! | Protocol | Request | Response |
//! |----------|---------|----------|
//! | Security negotiation | `SecurityProposal` | `SecuritySelect` |
//! | Handshake | `HandshakeHello`, `HandshakeAuth` | same |
//! | Stream selection | `StreamOpen` | `StreamAck` |
//! | Identify | (empty) | `IdentifyInfo` |
//! | Routing | `KadRequest` | `KadResponse` |
//! | Relay hop | `HopRequest` | `HopResponse` |
//! | Relay stop | `StopRequest` | `StopResponse` |
//! | Reachability | `DialBackRequest` | `DialBackResponse` |
//! | PubSub | `PubSubRpc` (one-way) | |
//!
//! ## Security Limits
//!
//! All deserialization goes through [`deserialize_bounded`], and every frame
//! read from the network is checked against an explicit maximum before any
//! buffer is allocated.

use bincode::Options;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::dht::Key;
use crate::identity::{PeerId, PublicKey};
use crate::multiaddr::Multiaddr;
use crate::peerstore::PeerRecord;

/// Maximum size of a single application payload carried in a pubsub message.
pub const MAX_VALUE_SIZE: usize = 1024 * 1024;

/// Maximum buffer size for deserialization.
pub const MAX_DESERIALIZE_SIZE: u64 = (MAX_VALUE_SIZE as u64) + 64 * 1024;

/// Maximum size of a control-plane message (negotiation, routing, relay).
pub const MAX_CONTROL_MESSAGE_SIZE: usize = 64 * 1024;

/// Content-derived identifier of a pubsub message.
pub type MessageId = [u8; 32];

/// SECURITY: always use these options so decoding is bounded.
fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_DESERIALIZE_SIZE)
        .with_fixint_encoding()
}

pub fn serialize<T: Serialize>(value: &T) -> Result<Vec<u8>, bincode::Error> {
    bincode_options().serialize(value)
}

/// Deserialize with size bounds enforced.
pub fn deserialize_bounded<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, bincode::Error> {
    bincode_options().deserialize(bytes)
}

// ============================================================================
// Framing
// ============================================================================

/// Write one u32 big-endian length-prefixed frame.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, payload: &[u8]) -> std::io::Result<()> {
    let len = u32::try_from(payload.len())
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "frame too large"))?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await
}

/// Read one length-prefixed frame. Returns `Ok(None)` on a clean EOF before the
/// length prefix.
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_len: usize,
) -> std::io::Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_len {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame of {len} bytes exceeds limit {max_len}"),
        ));
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(Some(buf))
}

/// Serialize `message` and write it as one frame.
pub async fn write_message<W: AsyncWrite + Unpin, T: Serialize>(
    writer: &mut W,
    message: &T,
) -> std::io::Result<()> {
    let bytes = serialize(message)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
    write_frame(writer, &bytes).await
}

/// Read one frame and decode it. EOF is reported as `UnexpectedEof`.
pub async fn read_message<R: AsyncRead + Unpin, T: DeserializeOwned>(
    reader: &mut R,
    max_len: usize,
) -> std::io::Result<T> {
    let frame = read_frame(reader, max_len)
        .await?
        .ok_or_else(|| std::io::Error::from(std::io::ErrorKind::UnexpectedEof))?;
    deserialize_bounded(&frame).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

// ============================================================================
// Security Negotiation & Handshake
// ============================================================================

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityProposal {
    /// Protocol ids in the proposer's order of preference.
    pub protocols: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SecuritySelect {
    Selected(String),
    NoMatch,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HandshakeHello {
    pub public_key: PublicKey,
    pub ephemeral: [u8; 32],
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HandshakeAuth {
    pub signature: Vec<u8>,
}

// ============================================================================
// Stream Protocol Selection & Identify
// ============================================================================

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamOpen {
    pub protocol: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamAck {
    Accepted,
    Unsupported,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IdentifyInfo {
    pub public_key: PublicKey,
    pub listen_addrs: Vec<Multiaddr>,
    pub protocols: Vec<String>,
    /// The address the responder sees the requester connecting from.
    pub observed_addr: Option<Multiaddr>,
}

// ============================================================================
// Routing
// ============================================================================

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum KadRequest {
    Ping,
    FindNode { target: PeerId },
    GetProviders { key: Key },
    AddProvider { key: Key, provider: PeerRecord },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum KadResponse {
    Ack,
    Nodes(Vec<PeerRecord>),
    Providers {
        providers: Vec<PeerRecord>,
        closer: Vec<PeerRecord>,
    },
    Error {
        message: String,
    },
}

// ============================================================================
// Relay
// ============================================================================

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum HopRequest {
    Reserve,
    Connect { target: PeerId },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum HopResponse {
    ReservationOk {
        ttl_secs: u64,
        /// The relay's own addresses, each ending in `/p2p/<relay>`.
        relay_addrs: Vec<Multiaddr>,
    },
    Connected,
    Rejected {
        reason: String,
    },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StopRequest {
    pub from: PeerId,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopResponse {
    Accepted,
    Rejected { reason: String },
}

// ============================================================================
// Reachability
// ============================================================================

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DialBackRequest {
    pub addrs: Vec<Multiaddr>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DialBackResponse {
    pub reachable: bool,
    pub addr: Option<Multiaddr>,
}

// ============================================================================
// PubSub
// ============================================================================

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PubSubMessage {
    pub from: PeerId,
    pub seqno: u64,
    pub topic: String,
    pub data: Vec<u8>,
    pub signature: Option<Vec<u8>>,
    /// Sender key, for receivers that have not learned it yet.
    pub key: Option<PublicKey>,
}

impl PubSubMessage {
    /// `BLAKE3(from || seqno (BE) || data)`.
    pub fn id(&self) -> MessageId {
        message_id(&self.from, self.seqno, &self.data)
    }
}

pub fn message_id(from: &PeerId, seqno: u64, data: &[u8]) -> MessageId {
    let mut hasher = blake3::Hasher::new();
    hasher.update(from.as_bytes());
    hasher.update(&seqno.to_be_bytes());
    hasher.update(data);
    *hasher.finalize().as_bytes()
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionOpt {
    pub subscribe: bool,
    pub topic: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlIHave {
    pub topic: String,
    pub message_ids: Vec<MessageId>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlIWant {
    pub message_ids: Vec<MessageId>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlGraft {
    pub topic: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlPrune {
    pub topic: String,
    pub backoff_secs: Option<u64>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlMessage {
    pub ihave: Vec<ControlIHave>,
    pub iwant: Vec<ControlIWant>,
    pub graft: Vec<ControlGraft>,
    pub prune: Vec<ControlPrune>,
}

impl ControlMessage {
    pub fn is_empty(&self) -> bool {
        self.ihave.is_empty() && self.iwant.is_empty() && self.graft.is_empty() && self.prune.is_empty()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PubSubRpc {
    pub subscriptions: Vec<SubscriptionOpt>,
    pub messages: Vec<PubSubMessage>,
    pub control: Option<ControlMessage>,
}

impl PubSubRpc {
    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
            && self.messages.is_empty()
            && self.control.as_ref().is_none_or(|c| c.is_empty())
    }

    pub fn with_control(control: ControlMessage) -> Self {
        Self {
            control: Some(control),
            ..Default::default()
        }
    }
}
