//! # Identity
//!
//! Core identity types used throughout peerweave:
//!
//! - [`Keypair`]: public/private signing keypair owned by the local host
//! - [`PublicKey`] / [`PrivateKey`]: the two halves of a keypair
//! - [`PeerId`]: 32-byte identifier derived from a public key
//!
//! ## Identity Model
//!
//! A [`PeerId`] is `BLAKE3(PEER_ID_DOMAIN || key_type_tag || public_key)`.
//! Derivation is pure and deterministic: the same key always yields the same
//! identifier and distinct keys yield distinct identifiers with overwhelming
//! probability. Peer identifiers double as Kademlia keys, so XOR distance is
//! defined directly on them.
//!
//! ## Security Invariants
//!
//! - Private key material is never serialized and is redacted in `Debug`
//! - Only valid Ed25519 points are accepted as public keys
//! - Key generation fails closed when the OS entropy source is unavailable

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto::SignatureError;

// ============================================================================
// Constants
// ============================================================================

/// Domain separation prefix for peer identifier derivation.
pub const PEER_ID_DOMAIN: &[u8] = b"peerweave-peer-id-v1:";

/// Bit size of an Ed25519 key. `0` is accepted as "default size".
pub const ED25519_KEY_BITS: usize = 256;

/// Length of a peer identifier in bytes.
pub const PEER_ID_LEN: usize = 32;

// ============================================================================
// Key Types and Errors
// ============================================================================

/// Key algorithms a caller may request.
///
/// Only [`KeyType::Ed25519`] can be generated. The other variants exist so that
/// callers carrying configuration from other stacks get a typed error instead
/// of a silent substitution.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyType {
    Ed25519,
    Rsa,
    Secp256k1,
    Ecdsa,
}

impl KeyType {
    fn tag(self) -> u8 {
        match self {
            KeyType::Rsa => 0,
            KeyType::Ed25519 => 1,
            KeyType::Secp256k1 => 2,
            KeyType::Ecdsa => 3,
        }
    }
}

/// Identity creation failure. Fatal to identity creation and never retried.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum KeyGenerationError {
    #[error("unsupported key type {0:?}")]
    UnsupportedKeyType(KeyType),
    #[error("unsupported key size {bits} bits for {key_type:?}")]
    UnsupportedKeySize { key_type: KeyType, bits: usize },
    #[error("entropy source failure (code {0})")]
    Entropy(u32),
}

// ============================================================================
// Public / Private Keys
// ============================================================================

/// Ed25519 public key. The raw bytes are validated on construction.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PublicKey([u8; 32]);

impl PublicKey {
    /// Parse and validate a public key. Rejects bytes that are not a valid
    /// Ed25519 point.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SignatureError> {
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| SignatureError::InvalidPublicKey)?;
        VerifyingKey::from_bytes(&arr).map_err(|_| SignatureError::InvalidPublicKey)?;
        Ok(Self(arr))
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn key_type(&self) -> KeyType {
        KeyType::Ed25519
    }

    /// Canonical encoding fed into [`derive_id`]: type tag followed by key bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + self.0.len());
        out.push(self.key_type().tag());
        out.extend_from_slice(&self.0);
        out
    }

    pub fn to_peer_id(&self) -> PeerId {
        derive_id(self)
    }

    pub(crate) fn verifying_key(&self) -> Result<VerifyingKey, SignatureError> {
        VerifyingKey::from_bytes(&self.0).map_err(|_| SignatureError::InvalidPublicKey)
    }

    /// Strict Ed25519 verification of `signature` over `message`.
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> Result<(), SignatureError> {
        if signature.is_empty() {
            return Err(SignatureError::Missing);
        }
        let sig_bytes: [u8; 64] = signature
            .try_into()
            .map_err(|_| SignatureError::InvalidLength)?;
        let sig = Signature::from_bytes(&sig_bytes);
        self.verifying_key()?
            .verify_strict(message, &sig)
            .map_err(|_| SignatureError::VerificationFailed)
    }
}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PublicKey({})", &hex::encode(self.0)[..16])
    }
}

/// Ed25519 private key. Not serializable.
#[derive(Clone)]
pub struct PrivateKey(SigningKey);

impl PrivateKey {
    pub fn public(&self) -> PublicKey {
        PublicKey(self.0.verifying_key().to_bytes())
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        self.0.to_bytes()
    }
}

impl std::fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PrivateKey(<redacted>)")
    }
}

/// Generate a fresh keypair of the requested type and size.
///
/// `bits == 0` selects the default size for the key type.
pub fn generate(key_type: KeyType, bits: usize) -> Result<(PublicKey, PrivateKey), KeyGenerationError> {
    if key_type != KeyType::Ed25519 {
        return Err(KeyGenerationError::UnsupportedKeyType(key_type));
    }
    if bits != 0 && bits != ED25519_KEY_BITS {
        return Err(KeyGenerationError::UnsupportedKeySize { key_type, bits });
    }

    let mut seed = [0u8; 32];
    getrandom::getrandom(&mut seed).map_err(|e| KeyGenerationError::Entropy(e.code().get()))?;
    let signing_key = SigningKey::from_bytes(&seed);
    let private = PrivateKey(signing_key);
    Ok((private.public(), private))
}

/// Derive the peer identifier of a public key. Pure and deterministic.
pub fn derive_id(public_key: &PublicKey) -> PeerId {
    let mut hasher = blake3::Hasher::new();
    hasher.update(PEER_ID_DOMAIN);
    hasher.update(&public_key.encode());
    PeerId(*hasher.finalize().as_bytes())
}

// ============================================================================
// Keypair
// ============================================================================

#[derive(Clone)]
pub struct Keypair {
    public: PublicKey,
    private: PrivateKey,
    peer_id: PeerId,
}

impl Keypair {
    pub fn generate(key_type: KeyType, bits: usize) -> Result<Self, KeyGenerationError> {
        let (public, private) = generate(key_type, bits)?;
        Ok(Self::from_parts(public, private))
    }

    /// Generate a default Ed25519 keypair.
    pub fn generate_ed25519() -> Result<Self, KeyGenerationError> {
        Self::generate(KeyType::Ed25519, 0)
    }

    pub fn from_secret_bytes(bytes: &[u8; 32]) -> Self {
        let private = PrivateKey(SigningKey::from_bytes(bytes));
        Self::from_parts(private.public(), private)
    }

    fn from_parts(public: PublicKey, private: PrivateKey) -> Self {
        let peer_id = derive_id(&public);
        Self {
            public,
            private,
            peer_id,
        }
    }

    #[inline]
    pub fn public(&self) -> PublicKey {
        self.public
    }

    pub fn private(&self) -> &PrivateKey {
        &self.private
    }

    #[inline]
    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.private.0.sign(message)
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair")
            .field("peer_id", &self.peer_id)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Peer Identifier
// ============================================================================

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PeerId([u8; PEER_ID_LEN]);

impl PeerId {
    #[inline]
    pub fn from_bytes(bytes: [u8; PEER_ID_LEN]) -> Self {
        Self(bytes)
    }

    pub fn from_public_key(public_key: &PublicKey) -> Self {
        derive_id(public_key)
    }

    /// A uniformly random identifier, used as a lookup target when refreshing
    /// routing table buckets.
    pub fn random() -> Self {
        let mut bytes = [0u8; PEER_ID_LEN];
        rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut bytes);
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; PEER_ID_LEN] {
        &self.0
    }

    #[inline]
    pub fn xor_distance(&self, other: &PeerId) -> [u8; PEER_ID_LEN] {
        let mut out = [0u8; PEER_ID_LEN];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        out
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        let arr: [u8; PEER_ID_LEN] = bytes
            .try_into()
            .map_err(|_| hex::FromHexError::InvalidStringLength)?;
        Ok(Self(arr))
    }
}

/// Compare two XOR distances lexicographically.
#[inline]
pub fn distance_cmp(a: &[u8; PEER_ID_LEN], b: &[u8; PEER_ID_LEN]) -> std::cmp::Ordering {
    a.cmp(b)
}

impl std::fmt::Debug for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PeerId({})", &self.to_hex()[..16])
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl std::str::FromStr for PeerId {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl AsRef<[u8]> for PeerId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_generate_rejects_unsupported_parameters() {
        assert_eq!(
            generate(KeyType::Rsa, 2048).unwrap_err(),
            KeyGenerationError::UnsupportedKeyType(KeyType::Rsa)
        );
        assert_eq!(
            generate(KeyType::Ed25519, 512).unwrap_err(),
            KeyGenerationError::UnsupportedKeySize {
                key_type: KeyType::Ed25519,
                bits: 512
            }
        );
        assert!(generate(KeyType::Ed25519, ED25519_KEY_BITS).is_ok());
        assert!(generate(KeyType::Ed25519, 0).is_ok());
    }

    #[test]
    fn test_derive_id_is_deterministic() {
        let (public, _) = generate(KeyType::Ed25519, 0).unwrap();
        assert_eq!(derive_id(&public), derive_id(&public));

        let copy = PublicKey::from_bytes(public.as_bytes()).unwrap();
        assert_eq!(derive_id(&copy), public.to_peer_id());
    }

    #[test]
    fn test_derive_id_distinct_across_ten_thousand_keys() {
        let mut ids = HashSet::new();
        for _ in 0..10_000 {
            let (public, _) = generate(KeyType::Ed25519, 0).unwrap();
            assert!(ids.insert(derive_id(&public)), "duplicate peer id derived");
        }
        assert_eq!(ids.len(), 10_000);
    }

    #[test]
    fn test_keypair_from_secret_is_stable() {
        let kp = Keypair::generate_ed25519().unwrap();
        let restored = Keypair::from_secret_bytes(&kp.private().to_bytes());
        assert_eq!(kp.peer_id(), restored.peer_id());
        assert_eq!(kp.public(), restored.public());
    }

    #[test]
    fn test_sign_and_verify() {
        let kp = Keypair::generate_ed25519().unwrap();
        let sig = kp.sign(b"hello world").to_bytes();

        assert!(kp.public().verify(b"hello world", &sig).is_ok());
        assert_eq!(
            kp.public().verify(b"wrong message", &sig),
            Err(SignatureError::VerificationFailed)
        );
        assert_eq!(kp.public().verify(b"hello world", &[]), Err(SignatureError::Missing));
        assert_eq!(
            kp.public().verify(b"hello world", &sig[..10]),
            Err(SignatureError::InvalidLength)
        );
    }

    #[test]
    fn test_public_key_rejects_bad_lengths() {
        assert!(PublicKey::from_bytes(&[1u8; 31]).is_err());
        assert!(PublicKey::from_bytes(&[1u8; 33]).is_err());
    }

    #[test]
    fn test_private_key_debug_is_redacted() {
        let kp = Keypair::generate_ed25519().unwrap();
        let rendered = format!("{:?}", kp.private());
        assert_eq!(rendered, "PrivateKey(<redacted>)");
    }

    #[test]
    fn test_peer_id_hex_round_trip_and_xor() {
        let a = PeerId::from_bytes([0xFF; 32]);
        let b = PeerId::from_bytes([0x00; 32]);

        assert_eq!(PeerId::from_hex(&a.to_hex()).unwrap(), a);
        assert!(PeerId::from_hex("abcd").is_err());
        assert_eq!(a.xor_distance(&a), [0u8; 32]);
        assert_eq!(a.xor_distance(&b), b.xor_distance(&a));
        assert_eq!(a.xor_distance(&b), [0xFF; 32]);
    }
}
