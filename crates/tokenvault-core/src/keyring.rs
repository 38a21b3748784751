//! Per-vault key-encryption-key lineage.
//!
//! Each vault owns a keyring of numbered KEK versions. Versions are only ever
//! appended; `min_decryption_version` marks the oldest version still allowed
//! to unwrap data keys. Keyrings are persisted through the [`Barrier`], so the
//! storage backend only sees them encrypted under the master key.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::barrier::Barrier;
use crate::crypto::EncryptionKey;
use crate::error::EncryptionError;
use crate::id::VaultId;

const KEYRING_PREFIX: &str = "keyrings/";

/// One KEK version. The hex material is wiped when the value is dropped.
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct KeyVersion {
    material: String,
    #[zeroize(skip)]
    created_at: DateTime<Utc>,
}

impl KeyVersion {
    fn generate() -> Self {
        Self {
            material: hex::encode(EncryptionKey::generate().as_bytes()),
            created_at: Utc::now(),
        }
    }

    /// When this version was added.
    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn key(&self) -> Result<EncryptionKey, EncryptionError> {
        Ok(EncryptionKey::from_hex(&self.material)?)
    }
}

impl std::fmt::Debug for KeyVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyVersion")
            .field("material", &"[REDACTED]")
            .field("created_at", &self.created_at)
            .finish()
    }
}

/// The KEK lineage of a single vault.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultKeyring {
    pub vault_id: VaultId,
    versions: BTreeMap<u32, KeyVersion>,
    pub latest_version: u32,
    pub min_decryption_version: u32,
    pub created_at: DateTime<Utc>,
}

impl VaultKeyring {
    fn new(vault_id: VaultId) -> Self {
        let mut versions = BTreeMap::new();
        versions.insert(1, KeyVersion::generate());
        Self {
            vault_id,
            versions,
            latest_version: 1,
            min_decryption_version: 1,
            created_at: Utc::now(),
        }
    }

    /// The latest version number and its key.
    ///
    /// # Errors
    ///
    /// Returns [`EncryptionError::UnknownKeyVersion`] if the record is
    /// inconsistent.
    pub fn latest(&self) -> Result<(u32, EncryptionKey), EncryptionError> {
        let version = self.latest_version;
        self.key(version).map(|key| (version, key))
    }

    /// The key for `version`, if it may still be used for decryption.
    ///
    /// # Errors
    ///
    /// - [`EncryptionError::KeyVersionRetired`] below `min_decryption_version`.
    /// - [`EncryptionError::UnknownKeyVersion`] if the version never existed.
    pub fn key(&self, version: u32) -> Result<EncryptionKey, EncryptionError> {
        if version < self.min_decryption_version {
            return Err(EncryptionError::KeyVersionRetired {
                vault_id: self.vault_id,
                version,
                min_version: self.min_decryption_version,
            });
        }
        self.versions
            .get(&version)
            .ok_or(EncryptionError::UnknownKeyVersion {
                vault_id: self.vault_id,
                version,
            })?
            .key()
    }

    /// Version numbers currently held, oldest first.
    #[must_use]
    pub fn versions(&self) -> Vec<u32> {
        self.versions.keys().copied().collect()
    }

    fn rotate(&mut self) -> u32 {
        let next = self.latest_version.saturating_add(1);
        self.versions.insert(next, KeyVersion::generate());
        self.latest_version = next;
        next
    }

    fn retire_below(&mut self, version: u32) {
        let floor = version.min(self.latest_version);
        if floor > self.min_decryption_version {
            self.min_decryption_version = floor;
            self.versions.retain(|v, _| *v >= floor);
        }
    }
}

/// Barrier-backed persistence for keyrings.
#[derive(Debug, Clone)]
pub struct KeyringStore {
    barrier: Arc<Barrier>,
}

impl KeyringStore {
    #[must_use]
    pub fn new(barrier: Arc<Barrier>) -> Self {
        Self { barrier }
    }

    /// Create version 1 of a new vault's keyring.
    ///
    /// # Errors
    ///
    /// Returns [`EncryptionError::KeyringExists`] if one is already stored.
    pub async fn create(&self, vault_id: VaultId) -> Result<VaultKeyring, EncryptionError> {
        let keyring = VaultKeyring::new(vault_id);
        let bytes = Self::encode(&keyring)?;
        if !self.barrier.put_if_absent(&Self::path(vault_id), &bytes).await? {
            return Err(EncryptionError::KeyringExists { vault_id });
        }
        Ok(keyring)
    }

    /// Load a vault's keyring.
    ///
    /// # Errors
    ///
    /// Returns [`EncryptionError::KeyringNotFound`] if none is stored.
    pub async fn load(&self, vault_id: VaultId) -> Result<VaultKeyring, EncryptionError> {
        let bytes = self
            .barrier
            .get(&Self::path(vault_id))
            .await?
            .ok_or(EncryptionError::KeyringNotFound { vault_id })?;
        serde_json::from_slice(&bytes).map_err(|e| EncryptionError::Serialization {
            reason: e.to_string(),
        })
    }

    /// Append a new KEK version and return its number.
    ///
    /// Callers serialise rotations per vault.
    ///
    /// # Errors
    ///
    /// Returns [`EncryptionError`] if the keyring is missing or storage fails.
    pub async fn rotate(&self, vault_id: VaultId) -> Result<u32, EncryptionError> {
        let mut keyring = self.load(vault_id).await?;
        let version = keyring.rotate();
        self.save(&keyring).await?;
        Ok(version)
    }

    /// Drop every version below `version` from the keyring.
    ///
    /// # Errors
    ///
    /// Returns [`EncryptionError`] if the keyring is missing or storage fails.
    pub async fn retire_below(&self, vault_id: VaultId, version: u32) -> Result<(), EncryptionError> {
        let mut keyring = self.load(vault_id).await?;
        keyring.retire_below(version);
        self.save(&keyring).await
    }

    async fn save(&self, keyring: &VaultKeyring) -> Result<(), EncryptionError> {
        let bytes = Self::encode(keyring)?;
        self.barrier.put(&Self::path(keyring.vault_id), &bytes).await?;
        Ok(())
    }

    fn encode(keyring: &VaultKeyring) -> Result<Vec<u8>, EncryptionError> {
        serde_json::to_vec(keyring).map_err(|e| EncryptionError::Serialization {
            reason: e.to_string(),
        })
    }

    fn path(vault_id: VaultId) -> String {
        format!("{KEYRING_PREFIX}{vault_id}")
    }
}
