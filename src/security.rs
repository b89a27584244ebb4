//! # Security Negotiator
//!
//! Turns a raw byte stream into an authenticated, encrypted [`SecureSession`].
//!
//! ## State Machine
//!
//! ```text
//! Start -> ProtocolSelect -> KeyExchange -> Authenticated
//!                 \               \
//!                  +-> Failed      +-> Failed
//! ```
//!
//! **ProtocolSelect.** The outbound side sends its ordered preference list;
//! the inbound side answers with the first entry it also supports. The
//! dialer's order is therefore authoritative, and both sides arrive at the same
//! answer for the same pair of configurations.
//!
//! **KeyExchange.** Each side sends its static Ed25519 key and a fresh X25519
//! ephemeral, then a signature over
//! `role || protocol id || initiator ephemeral || responder ephemeral`.
//! The remote [`PeerId`] is derived from the verified static key. Session keys
//! are derived from the ephemeral Diffie-Hellman secret, one per direction.
//!
//! ## Security Properties
//!
//! - There is no plaintext mode: a failed negotiation never yields a session
//! - Role tags stop a peer from reflecting our own signature back at us
//! - Non-contributory (low-order) ephemerals are rejected
//! - Frames that fail authentication terminate the session

use std::time::Duration;

use rand::rngs::OsRng;
use thiserror::Error;
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tracing::{debug, trace};
use x25519_dalek::{EphemeralSecret, PublicKey as X25519Public};

use crate::config::ConfigError;
use crate::crypto::{
    CipherError, CipherSuite, FrameCipher, HANDSHAKE_SIGNATURE_DOMAIN, derive_session_keys,
    sign_with_domain, verify_with_domain,
};
use crate::identity::{Keypair, PeerId, PublicKey};
use crate::messages::{
    self, HandshakeAuth, HandshakeHello, SecurityProposal, SecuritySelect, read_message, write_message,
};
use crate::transport::{Direction, RawConnection};

// ============================================================================
// Constants
// ============================================================================

/// Largest plaintext carried by one secure frame.
pub const MAX_SECURE_PLAINTEXT: usize = 64 * 1024;

/// Poly1305 tag appended to every frame.
const AEAD_TAG_LEN: usize = 16;

/// Largest ciphertext frame accepted from the wire.
pub const MAX_SECURE_FRAME: usize = MAX_SECURE_PLAINTEXT + AEAD_TAG_LEN;

/// Bound on negotiation and handshake messages.
const MAX_HANDSHAKE_MESSAGE: usize = 4096;

/// Default time allowed for the whole negotiation.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

const ROLE_INITIATOR: u8 = 0x01;
const ROLE_RESPONDER: u8 = 0x02;

// ============================================================================
// Protocols & Configuration
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SecurityProtocol {
    ChaCha20Poly1305,
    XChaCha20Poly1305,
}

impl SecurityProtocol {
    pub const ALL: [SecurityProtocol; 2] = [
        SecurityProtocol::ChaCha20Poly1305,
        SecurityProtocol::XChaCha20Poly1305,
    ];

    pub fn id(self) -> &'static str {
        match self {
            SecurityProtocol::ChaCha20Poly1305 => "/peerweave/secure/chacha20poly1305/1.0.0",
            SecurityProtocol::XChaCha20Poly1305 => "/peerweave/secure/xchacha20poly1305/1.0.0",
        }
    }

    pub fn from_id(id: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.id() == id)
    }

    fn suite(self) -> CipherSuite {
        match self {
            SecurityProtocol::ChaCha20Poly1305 => CipherSuite::ChaCha20Poly1305,
            SecurityProtocol::XChaCha20Poly1305 => CipherSuite::XChaCha20Poly1305,
        }
    }
}

/// Ordered security preferences, resolved once at host construction.
#[derive(Clone, Debug)]
pub struct SecurityConfig {
    /// Most preferred first.
    pub protocols: Vec<SecurityProtocol>,
    pub handshake_timeout: Duration,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            protocols: SecurityProtocol::ALL.to_vec(),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }
}

impl SecurityConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.protocols.is_empty() {
            return Err(ConfigError::NoSecurityProtocols);
        }
        for (i, p) in self.protocols.iter().enumerate() {
            if self.protocols[..i].contains(p) {
                return Err(ConfigError::DuplicateSecurityProtocol(p.id().to_string()));
            }
        }
        if self.handshake_timeout.is_zero() {
            return Err(ConfigError::ZeroDuration("security.handshake_timeout"));
        }
        Ok(())
    }
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("no mutually supported security protocol")]
    NoCommonProtocol,
    #[error("remote selected unsupported security protocol {0}")]
    UnsupportedProtocol(String),
    #[error("handshake signature verification failed")]
    InvalidSignature,
    #[error("remote peer {actual} does not match expected {expected}")]
    PeerIdMismatch { expected: PeerId, actual: PeerId },
    #[error("remote presented our own identity")]
    SelfConnection,
    #[error("non-contributory key exchange")]
    WeakKeyExchange,
    #[error("malformed handshake message: {0}")]
    Malformed(String),
    #[error("connection closed during handshake")]
    ConnectionClosed,
    #[error("handshake timed out")]
    Timeout,
    #[error("handshake i/o: {0}")]
    Io(std::io::Error),
}

impl From<std::io::Error> for HandshakeError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::BrokenPipe => HandshakeError::ConnectionClosed,
            std::io::ErrorKind::InvalidData => HandshakeError::Malformed(e.to_string()),
            _ => HandshakeError::Io(e),
        }
    }
}

#[derive(Debug, Error)]
pub enum SecureChannelError {
    #[error("secure channel i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame failed authentication")]
    Decrypt,
    #[error("plaintext of {0} bytes exceeds frame limit")]
    FrameTooLarge(usize),
    #[error("cipher failure: {0}")]
    Cipher(CipherError),
}

// ============================================================================
// Negotiation
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NegotiationState {
    Start,
    ProtocolSelect,
    KeyExchange,
    Authenticated,
    Failed,
}

struct Progress {
    state: NegotiationState,
    direction: Direction,
}

impl Progress {
    fn advance(&mut self, next: NegotiationState) {
        trace!(from = ?self.state, to = ?next, direction = ?self.direction, "security negotiation");
        self.state = next;
    }
}

pub struct SecurityNegotiator {
    keypair: Keypair,
    config: SecurityConfig,
}

impl SecurityNegotiator {
    pub fn new(keypair: Keypair, config: SecurityConfig) -> Self {
        Self { keypair, config }
    }

    pub fn config(&self) -> &SecurityConfig {
        &self.config
    }

    /// Authenticate the remote end of `raw` and derive an encrypted session.
    ///
    /// `expected`, when given, must equal the remote's derived [`PeerId`].
    pub async fn negotiate(
        &self,
        raw: RawConnection,
        direction: Direction,
        expected: Option<PeerId>,
    ) -> Result<SecureSession, HandshakeError> {
        let mut progress = Progress {
            state: NegotiationState::Start,
            direction,
        };
        let result = tokio::time::timeout(
            self.config.handshake_timeout,
            self.run(raw, direction, expected, &mut progress),
        )
        .await
        .unwrap_or(Err(HandshakeError::Timeout));

        match &result {
            Ok(session) => {
                progress.advance(NegotiationState::Authenticated);
                debug!(
                    peer = %session.remote_peer,
                    protocol = session.protocol.id(),
                    direction = ?direction,
                    "secure session established"
                );
            }
            Err(e) => {
                progress.advance(NegotiationState::Failed);
                debug!(error = %e, direction = ?direction, "security negotiation failed");
            }
        }
        result
    }

    async fn run(
        &self,
        mut raw: RawConnection,
        direction: Direction,
        expected: Option<PeerId>,
        progress: &mut Progress,
    ) -> Result<SecureSession, HandshakeError> {
        progress.advance(NegotiationState::ProtocolSelect);
        let protocol = self.select_protocol(&mut raw, direction).await?;

        progress.advance(NegotiationState::KeyExchange);
        let secret = EphemeralSecret::random_from_rng(OsRng);
        let local_ephemeral = X25519Public::from(&secret).to_bytes();

        write_message(
            &mut raw,
            &HandshakeHello {
                public_key: self.keypair.public(),
                ephemeral: local_ephemeral,
            },
        )
        .await?;
        let hello: HandshakeHello = read_message(&mut raw, MAX_HANDSHAKE_MESSAGE).await?;

        // Deserialization does not validate the point; do it here.
        let remote_key = PublicKey::from_bytes(hello.public_key.as_bytes())
            .map_err(|_| HandshakeError::Malformed("invalid static public key".into()))?;
        let remote_peer = remote_key.to_peer_id();
        if remote_peer == self.keypair.peer_id() {
            return Err(HandshakeError::SelfConnection);
        }
        if let Some(expected) = expected
            && expected != remote_peer
        {
            return Err(HandshakeError::PeerIdMismatch {
                expected,
                actual: remote_peer,
            });
        }

        let (initiator_eph, responder_eph) = match direction {
            Direction::Outbound => (local_ephemeral, hello.ephemeral),
            Direction::Inbound => (hello.ephemeral, local_ephemeral),
        };
        let (local_role, remote_role) = match direction {
            Direction::Outbound => (ROLE_INITIATOR, ROLE_RESPONDER),
            Direction::Inbound => (ROLE_RESPONDER, ROLE_INITIATOR),
        };

        let local_transcript = transcript(local_role, protocol, &initiator_eph, &responder_eph);
        let signature = sign_with_domain(&self.keypair, HANDSHAKE_SIGNATURE_DOMAIN, &local_transcript);
        write_message(&mut raw, &HandshakeAuth { signature }).await?;

        let auth: HandshakeAuth = read_message(&mut raw, MAX_HANDSHAKE_MESSAGE).await?;
        let remote_transcript = transcript(remote_role, protocol, &initiator_eph, &responder_eph);
        verify_with_domain(
            &remote_key,
            HANDSHAKE_SIGNATURE_DOMAIN,
            &remote_transcript,
            &auth.signature,
        )
        .map_err(|_| HandshakeError::InvalidSignature)?;

        let shared = secret.diffie_hellman(&X25519Public::from(hello.ephemeral));
        if !shared.was_contributory() {
            return Err(HandshakeError::WeakKeyExchange);
        }
        let keys = derive_session_keys(shared.as_bytes(), &initiator_eph, &responder_eph, protocol.id());
        let (send_key, recv_key) = match direction {
            Direction::Outbound => (keys.initiator_to_responder, keys.responder_to_initiator),
            Direction::Inbound => (keys.responder_to_initiator, keys.initiator_to_responder),
        };

        Ok(SecureSession::new(raw, protocol, remote_peer, remote_key, &send_key, &recv_key))
    }

    async fn select_protocol(
        &self,
        raw: &mut RawConnection,
        direction: Direction,
    ) -> Result<SecurityProtocol, HandshakeError> {
        match direction {
            Direction::Outbound => {
                let proposal = SecurityProposal {
                    protocols: self.config.protocols.iter().map(|p| p.id().to_string()).collect(),
                };
                write_message(raw, &proposal).await?;
                match read_message::<_, SecuritySelect>(raw, MAX_HANDSHAKE_MESSAGE).await? {
                    SecuritySelect::Selected(id) => SecurityProtocol::from_id(&id)
                        .filter(|p| self.config.protocols.contains(p))
                        .ok_or(HandshakeError::UnsupportedProtocol(id)),
                    SecuritySelect::NoMatch => Err(HandshakeError::NoCommonProtocol),
                }
            }
            Direction::Inbound => {
                let proposal: SecurityProposal = read_message(raw, MAX_HANDSHAKE_MESSAGE).await?;
                let selected = proposal
                    .protocols
                    .iter()
                    .filter_map(|id| SecurityProtocol::from_id(id))
                    .find(|p| self.config.protocols.contains(p));
                match selected {
                    Some(p) => {
                        write_message(raw, &SecuritySelect::Selected(p.id().to_string())).await?;
                        Ok(p)
                    }
                    None => {
                        write_message(raw, &SecuritySelect::NoMatch).await?;
                        Err(HandshakeError::NoCommonProtocol)
                    }
                }
            }
        }
    }
}

fn transcript(role: u8, protocol: SecurityProtocol, initiator: &[u8; 32], responder: &[u8; 32]) -> Vec<u8> {
    let id = protocol.id().as_bytes();
    let mut out = Vec::with_capacity(1 + id.len() + 64);
    out.push(role);
    out.extend_from_slice(id);
    out.extend_from_slice(initiator);
    out.extend_from_slice(responder);
    out
}

// ============================================================================
// Secure Session
// ============================================================================

pub struct SecureReader {
    io: ReadHalf<RawConnection>,
    cipher: FrameCipher,
}

impl SecureReader {
    /// Next decrypted frame, `None` on clean EOF.
    pub async fn read_frame(&mut self) -> Result<Option<Vec<u8>>, SecureChannelError> {
        let Some(ciphertext) = messages::read_frame(&mut self.io, MAX_SECURE_FRAME).await? else {
            return Ok(None);
        };
        self.cipher
            .open(&ciphertext)
            .map(Some)
            .map_err(|_| SecureChannelError::Decrypt)
    }
}

pub struct SecureWriter {
    io: WriteHalf<RawConnection>,
    cipher: FrameCipher,
}

impl SecureWriter {
    pub async fn write_frame(&mut self, plaintext: &[u8]) -> Result<(), SecureChannelError> {
        if plaintext.len() > MAX_SECURE_PLAINTEXT {
            return Err(SecureChannelError::FrameTooLarge(plaintext.len()));
        }
        let ciphertext = self.cipher.seal(plaintext).map_err(SecureChannelError::Cipher)?;
        messages::write_frame(&mut self.io, &ciphertext).await?;
        Ok(())
    }

    pub async fn close(&mut self) -> std::io::Result<()> {
        self.io.shutdown().await
    }
}

/// An authenticated, encrypted channel to one remote peer.
pub struct SecureSession {
    remote_peer: PeerId,
    remote_public_key: PublicKey,
    protocol: SecurityProtocol,
    reader: SecureReader,
    writer: SecureWriter,
}

impl SecureSession {
    fn new(
        raw: RawConnection,
        protocol: SecurityProtocol,
        remote_peer: PeerId,
        remote_public_key: PublicKey,
        send_key: &[u8; 32],
        recv_key: &[u8; 32],
    ) -> Self {
        let (read_half, write_half) = tokio::io::split(raw);
        Self {
            remote_peer,
            remote_public_key,
            protocol,
            reader: SecureReader {
                io: read_half,
                cipher: FrameCipher::new(protocol.suite(), recv_key),
            },
            writer: SecureWriter {
                io: write_half,
                cipher: FrameCipher::new(protocol.suite(), send_key),
            },
        }
    }

    pub fn remote_peer(&self) -> PeerId {
        self.remote_peer
    }

    pub fn remote_public_key(&self) -> PublicKey {
        self.remote_public_key
    }

    pub fn protocol(&self) -> SecurityProtocol {
        self.protocol
    }

    pub async fn read_frame(&mut self) -> Result<Option<Vec<u8>>, SecureChannelError> {
        self.reader.read_frame().await
    }

    pub async fn write_frame(&mut self, plaintext: &[u8]) -> Result<(), SecureChannelError> {
        self.writer.write_frame(plaintext).await
    }

    pub fn into_split(self) -> (SecureReader, SecureWriter) {
        (self.reader, self.writer)
    }
}

impl std::fmt::Debug for SecureSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureSession")
            .field("remote_peer", &self.remote_peer)
            .field("protocol", &self.protocol)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn negotiator(protocols: Vec<SecurityProtocol>) -> SecurityNegotiator {
        SecurityNegotiator::new(
            Keypair::generate_ed25519().unwrap(),
            SecurityConfig {
                protocols,
                handshake_timeout: Duration::from_secs(5),
            },
        )
    }

    fn pipe() -> (RawConnection, RawConnection) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        (Box::new(a), Box::new(b))
    }

    #[tokio::test]
    async fn handshake_authenticates_both_sides() {
        let dialer = negotiator(SecurityProtocol::ALL.to_vec());
        let listener = negotiator(SecurityProtocol::ALL.to_vec());
        let (a, b) = pipe();

        let (out, inb) = tokio::join!(
            dialer.negotiate(a, Direction::Outbound, Some(listener.keypair.peer_id())),
            listener.negotiate(b, Direction::Inbound, None),
        );
        let mut out = out.unwrap();
        let mut inb = inb.unwrap();

        assert_eq!(out.remote_peer(), listener.keypair.peer_id());
        assert_eq!(inb.remote_peer(), dialer.keypair.peer_id());
        assert_eq!(inb.remote_public_key(), dialer.keypair.public());

        out.write_frame(b"hello").await.unwrap();
        out.write_frame(b"world").await.unwrap();
        assert_eq!(inb.read_frame().await.unwrap().unwrap(), b"hello");
        assert_eq!(inb.read_frame().await.unwrap().unwrap(), b"world");

        inb.write_frame(b"back").await.unwrap();
        assert_eq!(out.read_frame().await.unwrap().unwrap(), b"back");
    }

    #[tokio::test]
    async fn dialer_preference_order_wins() {
        let dialer = negotiator(vec![
            SecurityProtocol::XChaCha20Poly1305,
            SecurityProtocol::ChaCha20Poly1305,
        ]);
        let listener = negotiator(vec![
            SecurityProtocol::ChaCha20Poly1305,
            SecurityProtocol::XChaCha20Poly1305,
        ]);
        let (a, b) = pipe();

        let (out, inb) = tokio::join!(
            dialer.negotiate(a, Direction::Outbound, None),
            listener.negotiate(b, Direction::Inbound, None),
        );
        assert_eq!(out.unwrap().protocol(), SecurityProtocol::XChaCha20Poly1305);
        assert_eq!(inb.unwrap().protocol(), SecurityProtocol::XChaCha20Poly1305);
    }

    #[tokio::test]
    async fn no_common_protocol_fails_both_sides() {
        let dialer = negotiator(vec![SecurityProtocol::ChaCha20Poly1305]);
        let listener = negotiator(vec![SecurityProtocol::XChaCha20Poly1305]);
        let (a, b) = pipe();

        let (out, inb) = tokio::join!(
            dialer.negotiate(a, Direction::Outbound, None),
            listener.negotiate(b, Direction::Inbound, None),
        );
        assert!(matches!(out, Err(HandshakeError::NoCommonProtocol)));
        assert!(matches!(inb, Err(HandshakeError::NoCommonProtocol)));
    }

    #[tokio::test]
    async fn unexpected_peer_is_rejected() {
        let dialer = negotiator(SecurityProtocol::ALL.to_vec());
        let listener = negotiator(SecurityProtocol::ALL.to_vec());
        let wrong = PeerId::from_bytes([0xAB; 32]);
        let (a, b) = pipe();

        let (out, _inb) = tokio::join!(
            dialer.negotiate(a, Direction::Outbound, Some(wrong)),
            listener.negotiate(b, Direction::Inbound, None),
        );
        assert!(matches!(
            out,
            Err(HandshakeError::PeerIdMismatch { expected, .. }) if expected == wrong
        ));
    }

    #[tokio::test]
    async fn forged_signature_is_rejected() {
        let listener = negotiator(SecurityProtocol::ALL.to_vec());
        let claimed = Keypair::generate_ed25519().unwrap();
        let signer = Keypair::generate_ed25519().unwrap();
        let (mut a, b) = pipe();

        let attacker = async move {
            write_message(
                &mut a,
                &SecurityProposal {
                    protocols: vec![SecurityProtocol::ChaCha20Poly1305.id().to_string()],
                },
            )
            .await
            .unwrap();
            let _: SecuritySelect = read_message(&mut a, 4096).await.unwrap();
            let secret = EphemeralSecret::random_from_rng(OsRng);
            let eph = X25519Public::from(&secret).to_bytes();
            write_message(
                &mut a,
                &HandshakeHello {
                    public_key: claimed.public(),
                    ephemeral: eph,
                },
            )
            .await
            .unwrap();
            let hello: HandshakeHello = read_message(&mut a, 4096).await.unwrap();
            let t = transcript(
                ROLE_INITIATOR,
                SecurityProtocol::ChaCha20Poly1305,
                &eph,
                &hello.ephemeral,
            );
            let signature = sign_with_domain(&signer, HANDSHAKE_SIGNATURE_DOMAIN, &t);
            write_message(&mut a, &HandshakeAuth { signature }).await.unwrap();
            a
        };

        let (_a, result) = tokio::join!(attacker, listener.negotiate(b, Direction::Inbound, None));
        assert!(matches!(result, Err(HandshakeError::InvalidSignature)));
    }

    #[tokio::test(start_paused = true)]
    async fn silent_peer_times_out() {
        let listener = negotiator(SecurityProtocol::ALL.to_vec());
        let (_a, b) = pipe();

        let result = listener.negotiate(b, Direction::Inbound, None).await;
        assert!(matches!(result, Err(HandshakeError::Timeout)));
    }

    #[tokio::test]
    async fn closed_peer_is_reported() {
        let listener = negotiator(SecurityProtocol::ALL.to_vec());
        let (a, b) = pipe();
        drop(a);

        let result = listener.negotiate(b, Direction::Inbound, None).await;
        assert!(matches!(result, Err(HandshakeError::ConnectionClosed)));
    }

    #[test]
    fn config_validation() {
        assert!(SecurityConfig::default().validate().is_ok());
        let empty = SecurityConfig {
            protocols: vec![],
            ..Default::default()
        };
        assert!(matches!(empty.validate(), Err(ConfigError::NoSecurityProtocols)));
        let dup = SecurityConfig {
            protocols: vec![SecurityProtocol::ChaCha20Poly1305, SecurityProtocol::ChaCha20Poly1305],
            ..Default::default()
        };
        assert!(matches!(dup.validate(), Err(ConfigError::DuplicateSecurityProtocol(_))));
    }
}
