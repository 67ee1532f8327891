//! Credential encryption using AES-256-GCM
//!
//! Every secret is stored as a self-describing envelope of the form
//! `<iv_hex>:<tag_hex>:<cipher_hex>`, where the IV and the authentication tag are
//! both 16 bytes. The same shape doubles as the "already encrypted" predicate, which
//! keeps sealing idempotent and lets readers tell migrated values from legacy plaintext.
//!
//! The master key is supplied once at startup through [`CipherConfig`]. Without a key
//! the cipher runs in passthrough mode: `encrypt`/`decrypt` are identities, and
//! [`Cipher::seal`] refuses to persist plaintext unless the configuration explicitly
//! allows it (local and test profiles only).

#![allow(deprecated)]

use std::fmt;
use std::sync::LazyLock;

use aes_gcm::{
    AesGcm, Nonce,
    aead::{Aead, AeadCore, KeyInit, OsRng, consts::U16},
    aes::Aes256,
};
use base64::{Engine as _, engine::general_purpose};
use regex::Regex;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::config::AppConfig;

/// AES-256-GCM with a 128-bit IV.
type EnvelopeCipher = AesGcm<Aes256, U16>;

const KEY_LEN: usize = 32;
const IV_LEN: usize = 16;
const TAG_LEN: usize = 16;

static ENVELOPE_SHAPE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[0-9a-fA-F]{32}:[0-9a-fA-F]{32}:(?:[0-9a-fA-F]{2})*$")
        .expect("envelope pattern is a valid regex")
});

/// Crypto error types
///
/// Decryption failures deliberately carry no detail: a malformed envelope, a
/// tampered ciphertext and a wrong key all surface as the same variant.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CryptoError {
    #[error("decryption failed")]
    Decryption,
    #[error("encryption failed")]
    EncryptionFailed,
    #[error("invalid master key: {0}")]
    InvalidKey(String),
    #[error("encryption is disabled; refusing to persist plaintext credentials")]
    EncryptionDisabled,
}

/// Secure wrapper for the master key with zeroization
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct ZeroizingKey(Vec<u8>);

/// Type alias for crypto keys
pub type CryptoKey = ZeroizingKey;

impl CryptoKey {
    /// Create a new crypto key from raw bytes
    pub fn new(bytes: Vec<u8>) -> Result<Self, CryptoError> {
        if bytes.len() != KEY_LEN {
            return Err(CryptoError::InvalidKey(format!(
                "expected {} bytes, got {}",
                KEY_LEN,
                bytes.len()
            )));
        }
        Ok(ZeroizingKey(bytes))
    }

    /// Parse a key given either as 64 hex characters or as base64.
    pub fn parse(encoded: &str) -> Result<Self, CryptoError> {
        let trimmed = encoded.trim();
        let bytes = if trimmed.len() == KEY_LEN * 2 && trimmed.chars().all(|c| c.is_ascii_hexdigit())
        {
            hex::decode(trimmed).map_err(|e| CryptoError::InvalidKey(e.to_string()))?
        } else {
            general_purpose::STANDARD
                .decode(trimmed)
                .map_err(|e| CryptoError::InvalidKey(e.to_string()))?
        };
        Self::new(bytes)
    }

    /// Get the key as bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for ZeroizingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CryptoKey([REDACTED])")
    }
}

/// Process-wide cipher configuration, built once at startup and injected.
#[derive(Debug, Clone, Default)]
pub struct CipherConfig {
    master_key: Option<CryptoKey>,
    allow_plaintext_persistence: bool,
}

impl CipherConfig {
    /// Encryption enabled with the given master key.
    pub fn with_key(master_key: CryptoKey) -> Self {
        Self {
            master_key: Some(master_key),
            allow_plaintext_persistence: false,
        }
    }

    /// Passthrough mode that still refuses to persist plaintext.
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Passthrough mode for local development; plaintext may be persisted.
    pub fn dev_passthrough() -> Self {
        Self {
            master_key: None,
            allow_plaintext_persistence: true,
        }
    }

    /// Derive the cipher configuration from application configuration.
    ///
    /// Plaintext persistence is only ever allowed for the `local` and `test` profiles.
    pub fn from_app_config(config: &AppConfig) -> Result<Self, CryptoError> {
        match config.master_key.as_ref() {
            Some(bytes) => Ok(Self::with_key(CryptoKey::new(bytes.clone())?)),
            None if config.is_dev_profile() => Ok(Self::dev_passthrough()),
            None => Ok(Self::disabled()),
        }
    }

    pub fn is_encryption_enabled(&self) -> bool {
        self.master_key.is_some()
    }
}

/// The Cipher Envelope: authenticated encryption of single string values.
#[derive(Debug, Clone)]
pub struct Cipher {
    config: CipherConfig,
}

impl Cipher {
    pub fn new(config: CipherConfig) -> Self {
        Self { config }
    }

    /// True iff a master key is configured.
    pub fn is_encryption_enabled(&self) -> bool {
        self.config.is_encryption_enabled()
    }

    /// Encrypt a plaintext into an envelope with a fresh random IV.
    ///
    /// Identity when encryption is disabled.
    pub fn encrypt(&self, plaintext: &str) -> Result<String, CryptoError> {
        let Some(key) = self.config.master_key.as_ref() else {
            return Ok(plaintext.to_string());
        };

        let cipher = EnvelopeCipher::new_from_slice(key.as_bytes())
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        let iv = EnvelopeCipher::generate_nonce(&mut OsRng);

        // aes-gcm appends the tag to the ciphertext
        let sealed = cipher
            .encrypt(&iv, plaintext.as_bytes())
            .map_err(|_| CryptoError::EncryptionFailed)?;
        let (ciphertext, tag) = sealed.split_at(sealed.len() - TAG_LEN);

        Ok(format!(
            "{}:{}:{}",
            hex::encode(iv),
            hex::encode(tag),
            hex::encode(ciphertext)
        ))
    }

    /// Decrypt an envelope back to its plaintext.
    ///
    /// Identity when encryption is disabled.
    pub fn decrypt(&self, value: &str) -> Result<String, CryptoError> {
        let Some(key) = self.config.master_key.as_ref() else {
            return Ok(value.to_string());
        };

        let mut segments = value.split(':');
        let (Some(iv_hex), Some(tag_hex), Some(cipher_hex), None) = (
            segments.next(),
            segments.next(),
            segments.next(),
            segments.next(),
        ) else {
            return Err(CryptoError::Decryption);
        };

        let iv = hex::decode(iv_hex).map_err(|_| CryptoError::Decryption)?;
        let tag = hex::decode(tag_hex).map_err(|_| CryptoError::Decryption)?;
        let mut payload = hex::decode(cipher_hex).map_err(|_| CryptoError::Decryption)?;
        if iv.len() != IV_LEN || tag.len() != TAG_LEN {
            return Err(CryptoError::Decryption);
        }
        payload.extend_from_slice(&tag);

        let cipher = EnvelopeCipher::new_from_slice(key.as_bytes())
            .map_err(|_| CryptoError::Decryption)?;
        let plaintext = cipher
            .decrypt(Nonce::<U16>::from_slice(&iv), payload.as_slice())
            .map_err(|_| CryptoError::Decryption)?;

        String::from_utf8(plaintext).map_err(|_| CryptoError::Decryption)
    }

    /// Prepare a value for persistence.
    ///
    /// Already-encrypted values are returned unchanged (never double-encrypted). With
    /// encryption disabled this fails closed unless plaintext persistence was allowed.
    pub fn seal(&self, value: &str) -> Result<String, CryptoError> {
        if is_encrypted(value) {
            return Ok(value.to_string());
        }
        if !self.is_encryption_enabled() {
            if self.config.allow_plaintext_persistence {
                return Ok(value.to_string());
            }
            return Err(CryptoError::EncryptionDisabled);
        }
        self.encrypt(value)
    }

    /// Decrypt a stored value if it is an envelope, otherwise pass it through.
    ///
    /// An envelope cannot be opened without a key, so that case is a decryption
    /// failure rather than a silent passthrough of ciphertext.
    pub fn open(&self, value: &str) -> Result<String, CryptoError> {
        if !is_encrypted(value) {
            return Ok(value.to_string());
        }
        if !self.is_encryption_enabled() {
            return Err(CryptoError::Decryption);
        }
        self.decrypt(value)
    }
}

/// Structural check for the `hex32:hex32:hex` envelope shape. Does not decrypt.
///
/// This is a heuristic: a plaintext secret that happens to match the shape is
/// classified as encrypted.
pub fn is_encrypted(value: &str) -> bool {
    ENVELOPE_SHAPE.is_match(value)
}
