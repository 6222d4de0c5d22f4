//! Cryptographic primitives for clipsync.
//!
//! This module provides:
//! - X25519 key agreement expanded with HKDF-SHA256 into a 256-bit key
//! - AES-256-GCM with 96-bit nonces and detached 128-bit tags
//! - Ed25519 identity signatures for pairing and direct-channel proofs
//!
//! # Security Notes
//!
//! - Nonces come from the OS RNG unless a [`NonceSource`] is injected (tests)
//! - Decryption verifies the tag before releasing any plaintext
//! - Key agreement rejects low-order peer points (all-zero shared secret)
//! - Key material zeroizes on drop and never appears in `Debug` output

use aes_gcm::{
    aead::{AeadInPlace, KeyInit},
    Aes256Gcm, Nonce, Tag,
};
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use hkdf::Hkdf;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::Sha256;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

use clipsync_core::key_fingerprint;
use clipsync_types::encoding::base64_array;

/// Key size for AES-256-GCM (256 bits = 32 bytes).
pub const KEY_SIZE: usize = 32;

/// Nonce size for AES-256-GCM (96 bits = 12 bytes).
pub const NONCE_SIZE: usize = 12;

/// Authentication tag size (128 bits = 16 bytes).
pub const TAG_SIZE: usize = 16;

/// X25519 and Ed25519 public key size.
pub const PUBLIC_KEY_SIZE: usize = 32;

const HKDF_SALT: &[u8] = b"clipsync-ecdh-v1";
const HKDF_INFO: &[u8] = b"clipsync-aes-256-gcm";

/// Crypto errors.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Encryption failed.
    #[error("encryption failed: {0}")]
    EncryptionFailed(String),

    /// Decryption failed (authentication error).
    #[error("decryption failed: authentication error")]
    DecryptionFailed,

    /// Invalid key length.
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength {
        /// Expected length.
        expected: usize,
        /// Actual length.
        actual: usize,
    },

    /// Key derivation failed.
    #[error("key derivation failed: {0}")]
    KeyDerivationFailed(String),

    /// Public key is malformed or a low-order point.
    #[error("invalid public key")]
    InvalidPublicKey,

    /// Signature did not verify.
    #[error("signature verification failed")]
    SignatureInvalid,
}

/// A 256-bit symmetric key shared with one peer.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SessionKey([u8; KEY_SIZE]);

impl SessionKey {
    /// Wrap raw key bytes.
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Wrap a slice, checking its length.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let array = <[u8; KEY_SIZE]>::try_from(bytes).map_err(|_| CryptoError::InvalidKeyLength {
            expected: KEY_SIZE,
            actual: bytes.len(),
        })?;
        Ok(Self(array))
    }

    /// Generate a random key (for testing).
    pub fn random() -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        getrandom::getrandom(&mut bytes).expect("getrandom failed");
        Self(bytes)
    }

    /// Get the raw bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

// Don't leak key material in debug output
impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SessionKey([REDACTED])")
    }
}

impl Serialize for SessionKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        base64_array::serialize(&self.0, serializer)
    }
}

impl<'de> Deserialize<'de> for SessionKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        base64_array::deserialize(deserializer).map(Self)
    }
}

/// Source of AEAD nonces.
///
/// A nonce must never repeat under the same key.
pub trait NonceSource: Send + Sync {
    /// Produce the next nonce.
    fn next_nonce(&self) -> [u8; NONCE_SIZE];
}

/// Random nonces from the OS RNG.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsNonceSource;

impl NonceSource for OsNonceSource {
    fn next_nonce(&self) -> [u8; NONCE_SIZE] {
        let mut nonce = [0u8; NONCE_SIZE];
        getrandom::getrandom(&mut nonce).expect("getrandom failed");
        nonce
    }
}

/// Deterministic nonces: a 4-byte prefix followed by a big-endian counter.
///
/// For tests and known-answer vectors only.
#[derive(Debug)]
pub struct CounterNonceSource {
    prefix: [u8; 4],
    counter: AtomicU64,
}

impl CounterNonceSource {
    /// Start counting from zero under `prefix`.
    pub fn new(prefix: [u8; 4]) -> Self {
        Self {
            prefix,
            counter: AtomicU64::new(0),
        }
    }
}

impl NonceSource for CounterNonceSource {
    fn next_nonce(&self) -> [u8; NONCE_SIZE] {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        let mut nonce = [0u8; NONCE_SIZE];
        nonce[..4].copy_from_slice(&self.prefix);
        nonce[4..].copy_from_slice(&n.to_be_bytes());
        nonce
    }
}

/// Output of [`encrypt`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sealed {
    /// Ciphertext, same length as the plaintext.
    pub ciphertext: Vec<u8>,
    /// Nonce used.
    pub nonce: [u8; NONCE_SIZE],
    /// Authentication tag.
    pub tag: [u8; TAG_SIZE],
}

/// Encrypt with a fresh random nonce.
pub fn encrypt(plaintext: &[u8], key: &SessionKey, aad: &[u8]) -> Result<Sealed, CryptoError> {
    encrypt_with(&OsNonceSource, plaintext, key, aad)
}

/// Encrypt with a nonce from `nonces`.
pub fn encrypt_with(
    nonces: &dyn NonceSource,
    plaintext: &[u8],
    key: &SessionKey,
    aad: &[u8],
) -> Result<Sealed, CryptoError> {
    let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
        .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;
    let nonce = nonces.next_nonce();

    let mut buffer = plaintext.to_vec();
    let tag = cipher
        .encrypt_in_place_detached(Nonce::from_slice(&nonce), aad, &mut buffer)
        .map_err(|_| CryptoError::EncryptionFailed("aead encrypt failed".into()))?;

    let mut tag_bytes = [0u8; TAG_SIZE];
    tag_bytes.copy_from_slice(&tag);

    Ok(Sealed {
        ciphertext: buffer,
        nonce,
        tag: tag_bytes,
    })
}

/// Decrypt and authenticate.
///
/// Any mismatch (ciphertext, tag, nonce, key, or associated data) yields
/// [`CryptoError::DecryptionFailed`] and no plaintext.
pub fn decrypt(
    ciphertext: &[u8],
    nonce: &[u8; NONCE_SIZE],
    tag: &[u8; TAG_SIZE],
    key: &SessionKey,
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher =
        Aes256Gcm::new_from_slice(key.as_bytes()).map_err(|_| CryptoError::DecryptionFailed)?;

    let mut buffer = ciphertext.to_vec();
    match cipher.decrypt_in_place_detached(
        Nonce::from_slice(nonce),
        aad,
        &mut buffer,
        Tag::from_slice(tag),
    ) {
        Ok(()) => Ok(buffer),
        Err(_) => {
            buffer.zeroize();
            Err(CryptoError::DecryptionFailed)
        }
    }
}

/// Derive a session key from raw X25519 key bytes.
///
/// Both inputs must be exactly 32 bytes.
pub fn derive_key(local_private: &[u8], remote_public: &[u8]) -> Result<SessionKey, CryptoError> {
    let mut private = <[u8; 32]>::try_from(local_private).map_err(|_| {
        CryptoError::InvalidKeyLength {
            expected: KEY_SIZE,
            actual: local_private.len(),
        }
    })?;
    let public = <[u8; 32]>::try_from(remote_public).map_err(|_| {
        CryptoError::InvalidKeyLength {
            expected: PUBLIC_KEY_SIZE,
            actual: remote_public.len(),
        }
    })?;

    let secret = StaticSecret::from(private);
    private.zeroize();
    agree(&secret, &public)
}

/// ECDH then HKDF-SHA256.
fn agree(secret: &StaticSecret, remote_public: &[u8; 32]) -> Result<SessionKey, CryptoError> {
    let shared = secret.diffie_hellman(&PublicKey::from(*remote_public));
    if !shared.was_contributory() {
        return Err(CryptoError::InvalidPublicKey);
    }

    let hkdf = Hkdf::<Sha256>::new(Some(HKDF_SALT), shared.as_bytes());
    let mut okm = [0u8; KEY_SIZE];
    hkdf.expand(HKDF_INFO, &mut okm)
        .map_err(|e| CryptoError::KeyDerivationFailed(e.to_string()))?;
    Ok(SessionKey(okm))
}

fn random_secret_bytes() -> [u8; 32] {
    let mut bytes = [0u8; 32];
    getrandom::getrandom(&mut bytes).expect("getrandom failed");
    bytes
}

/// A device's long-lived identity: X25519 for agreement, Ed25519 for signing.
pub struct IdentityKeys {
    agreement: StaticSecret,
    signing: SigningKey,
}

impl IdentityKeys {
    /// Generate fresh identity keys.
    pub fn generate() -> Self {
        Self::from_bytes(random_secret_bytes(), random_secret_bytes())
    }

    /// Restore from stored secret bytes.
    pub fn from_bytes(agreement_secret: [u8; 32], signing_secret: [u8; 32]) -> Self {
        Self {
            agreement: StaticSecret::from(agreement_secret),
            signing: SigningKey::from_bytes(&signing_secret),
        }
    }

    /// X25519 public key (advertised in the pairing payload).
    pub fn agreement_public(&self) -> [u8; 32] {
        PublicKey::from(&self.agreement).to_bytes()
    }

    /// Ed25519 public key (advertised and pinned).
    pub fn signing_public(&self) -> [u8; 32] {
        self.signing.verifying_key().to_bytes()
    }

    /// Secret bytes for persistence: (agreement, signing).
    pub fn secret_bytes(&self) -> ([u8; 32], [u8; 32]) {
        (self.agreement.to_bytes(), self.signing.to_bytes())
    }

    /// Hex SHA-256 of the signing public key.
    pub fn fingerprint(&self) -> String {
        key_fingerprint(&self.signing_public())
    }

    /// Sign a message with the identity key.
    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.signing.sign(message).to_bytes()
    }

    /// Agree with a remote X25519 public key.
    pub fn agree(&self, remote_public: &[u8; 32]) -> Result<SessionKey, CryptoError> {
        agree(&self.agreement, remote_public)
    }
}

impl std::fmt::Debug for IdentityKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityKeys")
            .field("fingerprint", &self.fingerprint())
            .field("secrets", &"[REDACTED]")
            .finish()
    }
}

/// Per-pairing X25519 key pair. Dropped (and zeroized) after use.
pub struct EphemeralKeyPair {
    secret: StaticSecret,
    public: [u8; 32],
}

impl EphemeralKeyPair {
    /// Generate a fresh pair.
    pub fn generate() -> Self {
        let secret = StaticSecret::from(random_secret_bytes());
        let public = PublicKey::from(&secret).to_bytes();
        Self { secret, public }
    }

    /// The public half.
    pub fn public(&self) -> [u8; 32] {
        self.public
    }

    /// Agree with a remote X25519 public key.
    pub fn agree(&self, remote_public: &[u8; 32]) -> Result<SessionKey, CryptoError> {
        agree(&self.secret, remote_public)
    }
}

impl std::fmt::Debug for EphemeralKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "EphemeralKeyPair([REDACTED])")
    }
}

/// Verify an Ed25519 signature.
pub fn verify_signature(
    public_key: &[u8; 32],
    message: &[u8],
    signature: &[u8; 64],
) -> Result<(), CryptoError> {
    let key = VerifyingKey::from_bytes(public_key).map_err(|_| CryptoError::InvalidPublicKey)?;
    let signature = Signature::from_bytes(signature);
    key.verify_strict(message, &signature)
        .map_err(|_| CryptoError::SignatureInvalid)
}
