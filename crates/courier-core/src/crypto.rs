//! Cryptographic primitives for Courier.
//!
//! Provides two things:
//!   1. BLAKE3 hashing: content hashes that correlate file metadata with
//!      the raw bytes published on the sibling topic
//!   2. XChaCha20-Poly1305 sealing: authenticated encryption of envelope
//!      data and raw file bytes under a symmetric key
//!
//! Keys come from a `KeySource`: a client-wide static key, a per-topic
//! `KeyResolver`, or both. The resolver is consulted on every publish and
//! every receive, so keys can rotate without reconnecting.
//!
//! All key material derives ZeroizeOnDrop and is wiped from memory when dropped.
//! There is no unsafe code in this module.

use std::fmt;
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    Key, XChaCha20Poly1305, XNonce,
};
use rand::RngCore;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

// ── BLAKE3 ────────────────────────────────────────────────────────────────────

/// Hash a byte slice, returning a 32-byte BLAKE3 digest.
pub fn hash(data: &[u8]) -> [u8; 32] {
    *blake3::hash(data).as_bytes()
}

/// Hex-encoded BLAKE3 digest of a file payload.
///
/// This is the `contentHash` carried by file metadata envelopes. It is a
/// correlation key, not an integrity guarantee: two unrelated transfers with
/// identical bytes share a hash and will be merged by the receiver.
pub fn content_hash(data: &[u8]) -> String {
    hex::encode(hash(data))
}

// ── Keys ──────────────────────────────────────────────────────────────────────

/// Size of an XChaCha20-Poly1305 nonce. Prepended to every ciphertext.
pub const NONCE_LEN: usize = 24;

/// Size of the Poly1305 authentication tag.
pub const TAG_LEN: usize = 16;

/// A 256-bit symmetric key.
///
/// Serialized as standard base64 (44 characters) in configuration files.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SecretKey([u8; 32]);

impl SecretKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Generate a new random key.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Parse a base64-encoded key.
    pub fn from_base64(encoded: &str) -> Result<Self, CryptoError> {
        let decoded = STANDARD.decode(encoded.trim())?;
        let bytes: [u8; 32] = decoded
            .as_slice()
            .try_into()
            .map_err(|_| CryptoError::InvalidKeyLength(decoded.len()))?;
        Ok(Self(bytes))
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.0)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretKey(..)")
    }
}

/// Resolves the key for a concrete wire topic.
///
/// Returning `None` means the topic has no key; secure routes treat that as
/// a configuration error rather than falling back to plaintext.
pub trait KeyResolver: Send + Sync {
    fn resolve(&self, topic: &str) -> Option<SecretKey>;
}

impl<F> KeyResolver for F
where
    F: Fn(&str) -> Option<SecretKey> + Send + Sync,
{
    fn resolve(&self, topic: &str) -> Option<SecretKey> {
        self(topic)
    }
}

/// Where a client gets its keys from.
///
/// A resolver, when present and returning a key, wins over the static key.
#[derive(Clone, Default)]
pub struct KeySource {
    static_key: Option<SecretKey>,
    resolver: Option<Arc<dyn KeyResolver>>,
}

impl KeySource {
    /// No keys at all. Secure routes cannot be registered.
    pub fn none() -> Self {
        Self::default()
    }

    pub fn with_static(key: SecretKey) -> Self {
        Self {
            static_key: Some(key),
            resolver: None,
        }
    }

    pub fn with_resolver(resolver: impl KeyResolver + 'static) -> Self {
        Self {
            static_key: None,
            resolver: Some(Arc::new(resolver)),
        }
    }

    /// Attach a resolver to an existing source, keeping any static key as
    /// the fallback.
    pub fn and_resolver(mut self, resolver: impl KeyResolver + 'static) -> Self {
        self.resolver = Some(Arc::new(resolver));
        self
    }

    /// Use `key` as the static key unless one is already set.
    pub fn or_static(mut self, key: SecretKey) -> Self {
        if self.static_key.is_none() {
            self.static_key = Some(key);
        }
        self
    }

    /// True if at least one key source exists.
    pub fn is_configured(&self) -> bool {
        self.static_key.is_some() || self.resolver.is_some()
    }

    /// Resolve the key for `topic`.
    pub fn resolve(&self, topic: &str) -> Option<SecretKey> {
        self.resolver
            .as_ref()
            .and_then(|r| r.resolve(topic))
            .or_else(|| self.static_key.clone())
    }
}

impl fmt::Debug for KeySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeySource")
            .field("static_key", &self.static_key.is_some())
            .field("resolver", &self.resolver.is_some())
            .finish()
    }
}

// ── Sealing ───────────────────────────────────────────────────────────────────

/// Generate a cryptographically random 24-byte nonce.
fn generate_nonce() -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce);
    nonce
}

/// Encrypt raw bytes.
///
/// Output layout:
///   [nonce (24 bytes)] [ciphertext (plaintext.len() bytes)] [tag (16 bytes)]
pub fn encrypt(key: &SecretKey, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
    let nonce = generate_nonce();

    let ciphertext = cipher
        .encrypt(XNonce::from_slice(&nonce), plaintext)
        .map_err(|_| CryptoError::EncryptionFailed)?;

    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt bytes produced by [`encrypt`].
///
/// Returns Err on truncation, tampering, or a wrong key. Never returns
/// partially decrypted data.
pub fn decrypt(key: &SecretKey, sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if sealed.len() < NONCE_LEN + TAG_LEN {
        return Err(CryptoError::TooShort(sealed.len()));
    }
    let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
    cipher
        .decrypt(XNonce::from_slice(nonce), ciphertext)
        .map_err(|_| CryptoError::DecryptionFailed)
}

/// Encrypt a string, returning base64 text suitable for a JSON string field.
pub fn seal_str(key: &SecretKey, plaintext: &str) -> Result<String, CryptoError> {
    Ok(STANDARD.encode(encrypt(key, plaintext.as_bytes())?))
}

/// Reverse of [`seal_str`].
pub fn open_str(key: &SecretKey, sealed: &str) -> Result<String, CryptoError> {
    let raw = STANDARD.decode(sealed)?;
    String::from_utf8(decrypt(key, &raw)?).map_err(|_| CryptoError::NotUtf8)
}

/// Canonicalize a JSON value to a compact string and seal it.
///
/// Object keys serialize in sorted order (serde_json's default map), so the
/// same value always produces the same plaintext.
pub fn seal_json(key: &SecretKey, value: &serde_json::Value) -> Result<String, CryptoError> {
    let canonical = serde_json::to_string(value).map_err(CryptoError::Json)?;
    seal_str(key, &canonical)
}

/// Reverse of [`seal_json`]: decrypt and re-parse.
pub fn open_json(key: &SecretKey, sealed: &str) -> Result<serde_json::Value, CryptoError> {
    let text = open_str(key, sealed)?;
    serde_json::from_str(&text).map_err(CryptoError::Json)
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("encryption failed")]
    EncryptionFailed,

    #[error("decryption failed: wrong key or tampered ciphertext")]
    DecryptionFailed,

    #[error("ciphertext too short ({0} bytes, need at least 40: 24 nonce + 16 tag)")]
    TooShort(usize),

    #[error("key must be 32 bytes, got {0}")]
    InvalidKeyLength(usize),

    #[error("invalid base64: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("decrypted payload is not valid UTF-8")]
    NotUtf8,

    #[error("JSON payload error: {0}")]
    Json(serde_json::Error),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
