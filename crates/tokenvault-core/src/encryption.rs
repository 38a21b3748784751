//! Encryption Service.
//!
//! Envelope encryption over per-vault keyrings: every payload gets a fresh
//! data key (DEK); the DEK is wrapped under the vault's current KEK version.
//! Rotating a vault adds a KEK version, and [`EncryptionService::rewrap`]
//! moves a payload's DEK onto it without touching the ciphertext body.
//!
//! Both layers are bound to the vault id as associated data, so a payload
//! copied into a different vault never decrypts.

use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::crypto::{self, EncryptionKey};
use crate::error::EncryptionError;
use crate::id::VaultId;
use crate::keyring::KeyringStore;

/// Ciphertext plus the wrapped data key needed to open it.
///
/// Holds no key material in the clear.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedPayload {
    /// KEK version the data key is wrapped under.
    pub key_version: u32,
    /// Base64 of the DEK encrypted under the KEK.
    pub wrapped_key: String,
    /// Base64 of the plaintext encrypted under the DEK.
    pub ciphertext: String,
}

/// Pluggable encryption policy for vault payloads.
#[async_trait]
pub trait EncryptionService: Send + Sync {
    /// Provision key material for a new vault. Returns the initial version.
    async fn create_keyring(&self, vault_id: VaultId) -> Result<u32, EncryptionError>;

    /// Encrypt `plaintext` under the vault's current key version.
    async fn encrypt(
        &self,
        vault_id: VaultId,
        plaintext: &[u8],
    ) -> Result<EncryptedPayload, EncryptionError>;

    /// Decrypt a payload using the key version it records.
    async fn decrypt(
        &self,
        vault_id: VaultId,
        payload: &EncryptedPayload,
    ) -> Result<Zeroizing<Vec<u8>>, EncryptionError>;

    /// Add a key version to the vault and return its number.
    async fn rotate_key(&self, vault_id: VaultId) -> Result<u32, EncryptionError>;

    /// Move a payload's data key onto the current key version.
    async fn rewrap(
        &self,
        vault_id: VaultId,
        payload: &EncryptedPayload,
    ) -> Result<EncryptedPayload, EncryptionError>;

    /// The vault's current key version.
    async fn current_version(&self, vault_id: VaultId) -> Result<u32, EncryptionError>;

    /// Forbid decryption under versions older than `version`.
    async fn retire_versions_below(
        &self,
        vault_id: VaultId,
        version: u32,
    ) -> Result<(), EncryptionError>;
}

/// Default [`EncryptionService`]: AES-256-GCM envelope encryption.
#[derive(Debug, Clone)]
pub struct EnvelopeEncryptionService {
    keyrings: KeyringStore,
}

impl EnvelopeEncryptionService {
    #[must_use]
    pub fn new(keyrings: KeyringStore) -> Self {
        Self { keyrings }
    }

    fn aad(vault_id: VaultId) -> String {
        vault_id.to_string()
    }

    fn unwrap_dek(
        kek: &EncryptionKey,
        wrapped: &str,
        aad: &[u8],
    ) -> Result<EncryptionKey, EncryptionError> {
        let wrapped = decode(wrapped, "wrapped_key")?;
        let dek = Zeroizing::new(crypto::open(kek, &wrapped, aad)?);
        Ok(EncryptionKey::try_from_slice(&dek)?)
    }
}

fn decode(value: &str, field: &str) -> Result<Vec<u8>, EncryptionError> {
    BASE64
        .decode(value)
        .map_err(|e| EncryptionError::InvalidPayload {
            reason: format!("{field}: {e}"),
        })
}

#[async_trait]
impl EncryptionService for EnvelopeEncryptionService {
    async fn create_keyring(&self, vault_id: VaultId) -> Result<u32, EncryptionError> {
        Ok(self.keyrings.create(vault_id).await?.latest_version)
    }

    async fn encrypt(
        &self,
        vault_id: VaultId,
        plaintext: &[u8],
    ) -> Result<EncryptedPayload, EncryptionError> {
        let keyring = self.keyrings.load(vault_id).await?;
        let (key_version, kek) = keyring.latest()?;
        let aad = Self::aad(vault_id);

        let dek = EncryptionKey::generate();
        let ciphertext = crypto::seal(&dek, plaintext, aad.as_bytes())?;
        let wrapped = crypto::seal(&kek, dek.as_bytes(), aad.as_bytes())?;

        Ok(EncryptedPayload {
            key_version,
            wrapped_key: BASE64.encode(wrapped),
            ciphertext: BASE64.encode(ciphertext),
        })
    }

    async fn decrypt(
        &self,
        vault_id: VaultId,
        payload: &EncryptedPayload,
    ) -> Result<Zeroizing<Vec<u8>>, EncryptionError> {
        let keyring = self.keyrings.load(vault_id).await?;
        let kek = keyring.key(payload.key_version)?;
        let aad = Self::aad(vault_id);

        let dek = Self::unwrap_dek(&kek, &payload.wrapped_key, aad.as_bytes())?;
        let ciphertext = decode(&payload.ciphertext, "ciphertext")?;
        Ok(Zeroizing::new(crypto::open(
            &dek,
            &ciphertext,
            aad.as_bytes(),
        )?))
    }

    async fn rotate_key(&self, vault_id: VaultId) -> Result<u32, EncryptionError> {
        self.keyrings.rotate(vault_id).await
    }

    async fn rewrap(
        &self,
        vault_id: VaultId,
        payload: &EncryptedPayload,
    ) -> Result<EncryptedPayload, EncryptionError> {
        let keyring = self.keyrings.load(vault_id).await?;
        let (latest, new_kek) = keyring.latest()?;
        if payload.key_version == latest {
            return Ok(payload.clone());
        }
        let old_kek = keyring.key(payload.key_version)?;
        let aad = Self::aad(vault_id);

        let dek = Self::unwrap_dek(&old_kek, &payload.wrapped_key, aad.as_bytes())?;
        let wrapped = crypto::seal(&new_kek, dek.as_bytes(), aad.as_bytes())?;

        Ok(EncryptedPayload {
            key_version: latest,
            wrapped_key: BASE64.encode(wrapped),
            ciphertext: payload.ciphertext.clone(),
        })
    }

    async fn current_version(&self, vault_id: VaultId) -> Result<u32, EncryptionError> {
        Ok(self.keyrings.load(vault_id).await?.latest_version)
    }

    async fn retire_versions_below(
        &self,
        vault_id: VaultId,
        version: u32,
    ) -> Result<(), EncryptionError> {
        self.keyrings.retire_below(vault_id, version).await
    }
}

/// Build the default service over a barrier.
#[must_use]
pub fn envelope_service(barrier: Arc<crate::barrier::Barrier>) -> Arc<dyn EncryptionService> {
    Arc::new(EnvelopeEncryptionService::new(KeyringStore::new(barrier)))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::barrier::Barrier;
    use tokenvault_storage::MemoryBackend;

    fn service() -> Arc<dyn EncryptionService> {
        envelope_service(Arc::new(Barrier::unsealed(
            Arc::new(MemoryBackend::new()),
            EncryptionKey::generate(),
        )))
    }

    #[tokio::test]
    async fn encrypt_decrypt_roundtrip() {
        let svc = service();
        let vault_id = VaultId::new();
        assert_eq!(svc.create_keyring(vault_id).await.unwrap(), 1);

        let payload = svc.encrypt(vault_id, b"4111111111111111").await.unwrap();
        assert_eq!(payload.key_version, 1);
        assert_eq!(
            svc.decrypt(vault_id, &payload).await.unwrap().as_slice(),
            b"4111111111111111"
        );
    }

    #[tokio::test]
    async fn rewrap_keeps_ciphertext_body_and_plaintext() {
        let svc = service();
        let vault_id = VaultId::new();
        svc.create_keyring(vault_id).await.unwrap();
        let old = svc.encrypt(vault_id, b"secret").await.unwrap();

        assert_eq!(svc.rotate_key(vault_id).await.unwrap(), 2);
        let new = svc.rewrap(vault_id, &old).await.unwrap();

        assert_eq!(new.key_version, 2);
        assert_eq!(new.ciphertext, old.ciphertext);
        assert_ne!(new.wrapped_key, old.wrapped_key);
        assert_eq!(svc.decrypt(vault_id, &new).await.unwrap().as_slice(), b"secret");
        assert_eq!(svc.decrypt(vault_id, &old).await.unwrap().as_slice(), b"secret");
    }

    #[tokio::test]
    async fn retired_version_cannot_decrypt() {
        let svc = service();
        let vault_id = VaultId::new();
        svc.create_keyring(vault_id).await.unwrap();
        let old = svc.encrypt(vault_id, b"secret").await.unwrap();
        svc.rotate_key(vault_id).await.unwrap();
        svc.retire_versions_below(vault_id, 2).await.unwrap();

        assert!(matches!(
            svc.decrypt(vault_id, &old).await,
            Err(EncryptionError::KeyVersionRetired { .. })
        ));
    }

    #[tokio::test]
    async fn payload_from_another_vault_fails() {
        let svc = service();
        let a = VaultId::new();
        let b = VaultId::new();
        svc.create_keyring(a).await.unwrap();
        svc.create_keyring(b).await.unwrap();

        let payload = svc.encrypt(a, b"secret").await.unwrap();
        assert!(matches!(
            svc.decrypt(b, &payload).await,
            Err(EncryptionError::Crypto(_))
        ));
    }

    #[tokio::test]
    async fn malformed_payload_is_rejected_without_echo() {
        let svc = service();
        let vault_id = VaultId::new();
        svc.create_keyring(vault_id).await.unwrap();
        let mut payload = svc.encrypt(vault_id, b"secret").await.unwrap();
        payload.ciphertext = "!!not base64!!".to_owned();

        let err = svc.decrypt(vault_id, &payload).await.unwrap_err();
        assert!(matches!(err, EncryptionError::InvalidPayload { .. }));
        assert!(!err.to_string().contains("secret"));
    }

    #[tokio::test]
    async fn unknown_version_is_reported() {
        let svc = service();
        let vault_id = VaultId::new();
        svc.create_keyring(vault_id).await.unwrap();
        let mut payload = svc.encrypt(vault_id, b"x").await.unwrap();
        payload.key_version = 5;
        assert!(matches!(
            svc.decrypt(vault_id, &payload).await,
            Err(EncryptionError::UnknownKeyVersion { version: 5, .. })
        ));
    }
}
