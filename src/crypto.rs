//! # Cryptographic Infrastructure
//!
//! Primitives shared by the security handshake and pubsub:
//!
//! - **Signatures**: domain-separated Ed25519 signing and strict verification
//! - **Key derivation**: BLAKE3 `derive_key` turning an X25519 shared secret
//!   into one session key per direction
//! - **Frame cipher**: ChaCha20-Poly1305 / XChaCha20-Poly1305 AEAD with
//!   counter nonces, used to seal every secure-channel frame
//!
//! ## Security Properties
//!
//! - Domain separation prevents cross-protocol signature replay
//! - Each direction of a session has its own key, so nonces never collide
//!   between the two senders
//! - A nonce counter is never reused; exhausting it fails the session

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce, XChaCha20Poly1305, XNonce};

use crate::identity::{Keypair, PublicKey};

// ============================================================================
// Signature Error Types
// ============================================================================

/// Error type for signature verification failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureError {
    /// Signature is missing (empty).
    Missing,
    /// Signature has invalid length (expected 64 bytes for Ed25519).
    InvalidLength,
    /// Cryptographic verification failed.
    VerificationFailed,
    /// The public key is not a valid Ed25519 point.
    InvalidPublicKey,
}

impl std::fmt::Display for SignatureError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignatureError::Missing => write!(f, "signature is missing"),
            SignatureError::InvalidLength => write!(f, "signature has invalid length"),
            SignatureError::VerificationFailed => write!(f, "signature verification failed"),
            SignatureError::InvalidPublicKey => write!(f, "invalid public key"),
        }
    }
}

impl std::error::Error for SignatureError {}

// ============================================================================
// Domain Separation Prefixes
// ============================================================================
//
// SECURITY: each signed data type uses a unique prefix so a signature can
// never be replayed in a different context.

/// Domain separation prefix for pubsub message signatures.
pub const PUBSUB_SIGNATURE_DOMAIN: &[u8] = b"peerweave-pubsub-v1:";

/// Domain separation prefix for handshake transcript signatures.
pub const HANDSHAKE_SIGNATURE_DOMAIN: &[u8] = b"peerweave-handshake-v1:";

/// BLAKE3 `derive_key` context for the initiator-to-responder session key.
const KDF_CONTEXT_INITIATOR: &str = "peerweave 2025 secure channel initiator->responder";

/// BLAKE3 `derive_key` context for the responder-to-initiator session key.
const KDF_CONTEXT_RESPONDER: &str = "peerweave 2025 secure channel responder->initiator";

// ============================================================================
// Domain-Separated Signature Helpers
// ============================================================================

/// Sign `data` prefixed by `domain`. Returns the 64-byte Ed25519 signature.
pub fn sign_with_domain(keypair: &Keypair, domain: &[u8], data: &[u8]) -> Vec<u8> {
    let mut prefixed = Vec::with_capacity(domain.len() + data.len());
    prefixed.extend_from_slice(domain);
    prefixed.extend_from_slice(data);
    keypair.sign(&prefixed).to_bytes().to_vec()
}

/// Verify a signature produced by [`sign_with_domain`].
pub fn verify_with_domain(
    public_key: &PublicKey,
    domain: &[u8],
    data: &[u8],
    signature: &[u8],
) -> Result<(), SignatureError> {
    let mut prefixed = Vec::with_capacity(domain.len() + data.len());
    prefixed.extend_from_slice(domain);
    prefixed.extend_from_slice(data);
    public_key.verify(&prefixed, signature)
}

// ============================================================================
// Session Key Derivation
// ============================================================================

/// One key per direction, derived from the handshake.
pub struct SessionKeys {
    pub initiator_to_responder: [u8; 32],
    pub responder_to_initiator: [u8; 32],
}

/// Derive directional session keys from an X25519 shared secret.
///
/// Both ephemerals and the negotiated protocol id are bound into the key
/// material so a transcript for one protocol never yields keys for another.
pub fn derive_session_keys(
    shared_secret: &[u8; 32],
    initiator_ephemeral: &[u8; 32],
    responder_ephemeral: &[u8; 32],
    protocol_id: &str,
) -> SessionKeys {
    let mut material = Vec::with_capacity(32 * 3 + protocol_id.len());
    material.extend_from_slice(shared_secret);
    material.extend_from_slice(initiator_ephemeral);
    material.extend_from_slice(responder_ephemeral);
    material.extend_from_slice(protocol_id.as_bytes());

    SessionKeys {
        initiator_to_responder: blake3::derive_key(KDF_CONTEXT_INITIATOR, &material),
        responder_to_initiator: blake3::derive_key(KDF_CONTEXT_RESPONDER, &material),
    }
}

// ============================================================================
// Frame Cipher
// ============================================================================

/// AEAD construction used by a secure session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CipherSuite {
    ChaCha20Poly1305,
    XChaCha20Poly1305,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherError {
    /// Authentication tag did not verify, or the ciphertext was malformed.
    Decrypt,
    Encrypt,
    /// The 64-bit nonce counter has been used up.
    NonceExhausted,
}

impl std::fmt::Display for CipherError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CipherError::Decrypt => write!(f, "frame authentication failed"),
            CipherError::Encrypt => write!(f, "frame encryption failed"),
            CipherError::NonceExhausted => write!(f, "nonce counter exhausted"),
        }
    }
}

impl std::error::Error for CipherError {}

enum CipherImpl {
    ChaCha(ChaCha20Poly1305),
    XChaCha(XChaCha20Poly1305),
}

/// One direction of an encrypted channel.
///
/// Nonces are a little-endian frame counter zero-padded to the suite's nonce
/// size. Sender and receiver advance their counters in lockstep, so frames
/// must be opened in the order they were sealed.
pub struct FrameCipher {
    cipher: CipherImpl,
    counter: u64,
}

impl FrameCipher {
    pub fn new(suite: CipherSuite, key: &[u8; 32]) -> Self {
        let key = Key::from_slice(key);
        let cipher = match suite {
            CipherSuite::ChaCha20Poly1305 => CipherImpl::ChaCha(ChaCha20Poly1305::new(key)),
            CipherSuite::XChaCha20Poly1305 => CipherImpl::XChaCha(XChaCha20Poly1305::new(key)),
        };
        Self { cipher, counter: 0 }
    }

    fn next_counter(&mut self) -> Result<u64, CipherError> {
        let current = self.counter;
        self.counter = self
            .counter
            .checked_add(1)
            .ok_or(CipherError::NonceExhausted)?;
        Ok(current)
    }

    pub fn seal(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, CipherError> {
        let counter = self.next_counter()?;
        let sealed = match &self.cipher {
            CipherImpl::ChaCha(c) => {
                let nonce = counter_nonce::<12>(counter);
                c.encrypt(Nonce::from_slice(&nonce), plaintext)
            }
            CipherImpl::XChaCha(c) => {
                let nonce = counter_nonce::<24>(counter);
                c.encrypt(XNonce::from_slice(&nonce), plaintext)
            }
        };
        sealed.map_err(|_| CipherError::Encrypt)
    }

    pub fn open(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, CipherError> {
        let counter = self.next_counter()?;
        let opened = match &self.cipher {
            CipherImpl::ChaCha(c) => {
                let nonce = counter_nonce::<12>(counter);
                c.decrypt(Nonce::from_slice(&nonce), ciphertext)
            }
            CipherImpl::XChaCha(c) => {
                let nonce = counter_nonce::<24>(counter);
                c.decrypt(XNonce::from_slice(&nonce), ciphertext)
            }
        };
        opened.map_err(|_| CipherError::Decrypt)
    }
}

fn counter_nonce<const N: usize>(counter: u64) -> [u8; N] {
    let mut nonce = [0u8; N];
    nonce[..8].copy_from_slice(&counter.to_le_bytes());
    nonce
}
