//! Cryptographic primitives.
//!
//! AES-256-GCM authenticated encryption with optional associated data,
//! HKDF-SHA256 key derivation, HMAC-SHA256 for audit references, and a
//! zeroize-on-drop key newtype.
//!
//! Every sealed value is bound to associated data naming its owner (a
//! storage path or a vault id). A value moved to another owner fails to
//! open.

use std::fmt;

use aes_gcm::aead::rand_core::RngCore;
use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::CryptoError;

/// Key length for AES-256.
pub const KEY_LEN: usize = 32;

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const MIN_SEALED_LEN: usize = NONCE_LEN + TAG_LEN;

type HmacSha256 = Hmac<Sha256>;

/// A 256-bit key that is zeroized on drop.
///
/// Used for the master key, vault key-encryption keys and per-token data
/// keys. The inner bytes never appear in `Debug` output.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct EncryptionKey([u8; KEY_LEN]);

impl EncryptionKey {
    /// Create a key from raw bytes.
    #[must_use]
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Create a key from a slice, which must be exactly 32 bytes.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidKeyLength`] for any other length.
    pub fn try_from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let arr: [u8; KEY_LEN] = bytes.try_into().map_err(|_| CryptoError::InvalidKeyLength {
            expected: KEY_LEN,
            actual: bytes.len(),
        })?;
        Ok(Self(arr))
    }

    /// Parse a key from 64 hex characters.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidKeyLength`] if the input is not valid
    /// hex of the right length. The input itself is never echoed.
    pub fn from_hex(hex_str: &str) -> Result<Self, CryptoError> {
        let mut bytes = hex::decode(hex_str.trim()).map_err(|_| CryptoError::InvalidKeyLength {
            expected: KEY_LEN,
            actual: hex_str.trim().len() / 2,
        })?;
        let key = Self::try_from_slice(&bytes);
        bytes.zeroize();
        key
    }

    /// A fresh random key from `OsRng`.
    #[must_use]
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Borrow the raw key bytes.
    ///
    /// The caller must not log or persist these bytes unencrypted.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EncryptionKey([REDACTED])")
    }
}

/// Encrypt `plaintext` under `key`, bound to `aad`.
///
/// Output layout is `nonce || ciphertext || tag`. Each call draws a fresh
/// nonce from `OsRng`.
///
/// # Errors
///
/// Returns [`CryptoError::Encryption`] if the AEAD operation fails.
pub fn seal(key: &EncryptionKey, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let body = cipher
        .encrypt(&nonce, Payload { msg: plaintext, aad })
        .map_err(|e| CryptoError::Encryption {
            reason: e.to_string(),
        })?;

    let mut sealed = nonce.to_vec();
    sealed.extend_from_slice(&body);
    Ok(sealed)
}

/// Reverse [`seal`]. `aad` must match the value used to seal.
///
/// # Errors
///
/// Returns [`CryptoError::CiphertextTooShort`] for input shorter than a
/// nonce plus tag, or [`CryptoError::Decryption`] when authentication fails.
pub fn open(key: &EncryptionKey, sealed: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if sealed.len() < MIN_SEALED_LEN {
        return Err(CryptoError::CiphertextTooShort {
            expected: MIN_SEALED_LEN,
            actual: sealed.len(),
        });
    }

    let (nonce, body) = sealed.split_at(NONCE_LEN);
    Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()))
        .decrypt(Nonce::from_slice(nonce), Payload { msg: body, aad })
        .map_err(|e| CryptoError::Decryption {
            reason: e.to_string(),
        })
}

/// Derive a purpose-specific key from a root key using HKDF-SHA256.
///
/// `info` must be unique per purpose (e.g. `b"tokenvault-audit-hmac-v1"`).
///
/// # Errors
///
/// Returns [`CryptoError::KeyDerivation`] if HKDF expansion fails.
pub fn derive_key(
    root_key: &EncryptionKey,
    salt: Option<&[u8]>,
    info: &[u8],
) -> Result<EncryptionKey, CryptoError> {
    let mut derived = EncryptionKey::from_bytes([0u8; KEY_LEN]);
    Hkdf::<Sha256>::new(salt, root_key.as_bytes())
        .expand(info, &mut derived.0)
        .map_err(|e| CryptoError::KeyDerivation {
            context: String::from_utf8_lossy(info).into_owned(),
            reason: e.to_string(),
        })?;
    Ok(derived)
}

/// Hex-encoded HMAC-SHA256 of `value` under `key`.
#[must_use]
#[allow(clippy::missing_panics_doc)]
pub fn hmac_hex(key: &EncryptionKey, value: &[u8]) -> String {
    // HMAC-SHA256 accepts any key length per RFC 2104, so new_from_slice
    // never fails here.
    #[allow(clippy::unwrap_used)]
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key.as_bytes()).unwrap();
    mac.update(value);
    hex::encode(mac.finalize().into_bytes())
}

/// Hex-encoded SHA-256 digest.
#[must_use]
pub fn sha256_hex(value: &[u8]) -> String {
    hex::encode(Sha256::digest(value))
}
