//! Key barrier.
//!
//! Every keyring record passes through the barrier before it touches the
//! storage backend, encrypted under the master key. The storage layer only
//! ever sees wrapped key material.
//!
//! # Security model
//!
//! - The master key lives only in process memory, never on disk.
//! - Values are encrypted with AES-256-GCM, bound to their storage path as
//!   associated data, so swapping two records on disk fails decryption.
//! - Paths are stored in plaintext to support prefix listing.
//! - Sealing drops (and zeroizes) the master key immediately.

use std::fmt;
use std::sync::Arc;

use tokio::sync::RwLock;
use tokenvault_storage::StorageBackend;

use crate::crypto::{self, EncryptionKey};
use crate::error::BarrierError;

/// Encrypting wrapper around a storage backend, holding the master key.
///
/// When sealed, all operations return [`BarrierError::Sealed`].
pub struct Barrier {
    storage: Arc<dyn StorageBackend>,
    key: RwLock<Option<EncryptionKey>>,
}

impl Barrier {
    /// Create a new sealed barrier wrapping the given storage backend.
    #[must_use]
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self {
            storage,
            key: RwLock::new(None),
        }
    }

    /// Create a barrier that is already unsealed with `master_key`.
    #[must_use]
    pub fn unsealed(storage: Arc<dyn StorageBackend>, master_key: EncryptionKey) -> Self {
        Self {
            storage,
            key: RwLock::new(Some(master_key)),
        }
    }

    /// Unseal the barrier with the master key.
    pub async fn unseal(&self, key: EncryptionKey) {
        *self.key.write().await = Some(key);
    }

    /// Seal the barrier. The master key is zeroized when dropped.
    pub async fn seal(&self) {
        *self.key.write().await = None;
    }

    /// Whether the barrier currently holds the master key.
    pub async fn is_unsealed(&self) -> bool {
        self.key.read().await.is_some()
    }

    /// Read and decrypt the record at `path`.
    ///
    /// # Errors
    ///
    /// - [`BarrierError::Sealed`] if sealed.
    /// - [`BarrierError::Crypto`] if decryption fails.
    /// - [`BarrierError::Storage`] if the backend fails.
    pub async fn get(&self, path: &str) -> Result<Option<Vec<u8>>, BarrierError> {
        let master = self.master_key().await?;
        match self.storage.get(path).await? {
            None => Ok(None),
            Some(ciphertext) => Ok(Some(crypto::open(
                &master,
                &ciphertext,
                path.as_bytes(),
            )?)),
        }
    }

    /// Encrypt and write the record at `path`, overwriting it.
    ///
    /// # Errors
    ///
    /// - [`BarrierError::Sealed`] if sealed.
    /// - [`BarrierError::Crypto`] if encryption fails.
    /// - [`BarrierError::Storage`] if the backend fails.
    pub async fn put(&self, path: &str, value: &[u8]) -> Result<(), BarrierError> {
        let master = self.master_key().await?;
        let ciphertext = crypto::seal(&master, value, path.as_bytes())?;
        self.storage.put(path, &ciphertext).await?;
        Ok(())
    }

    /// Encrypt and write the record at `path` only if nothing is stored there.
    ///
    /// Returns `Ok(false)` if the path was already taken.
    ///
    /// # Errors
    ///
    /// Same as [`put`](Barrier::put).
    pub async fn put_if_absent(&self, path: &str, value: &[u8]) -> Result<bool, BarrierError> {
        let master = self.master_key().await?;
        let ciphertext = crypto::seal(&master, value, path.as_bytes())?;
        Ok(self
            .storage
            .compare_and_swap(path, None, &ciphertext)
            .await?)
    }

    /// List record paths under `prefix`.
    ///
    /// # Errors
    ///
    /// - [`BarrierError::Sealed`] if sealed.
    /// - [`BarrierError::Storage`] if the backend fails.
    pub async fn list(&self, prefix: &str) -> Result<Vec<String>, BarrierError> {
        let _master = self.master_key().await?;
        Ok(self.storage.list(prefix).await?)
    }

    /// Derive a purpose-specific key from the master key without exposing it.
    ///
    /// # Errors
    ///
    /// - [`BarrierError::Sealed`] if sealed.
    /// - [`BarrierError::Crypto`] if derivation fails.
    pub async fn derive_key(&self, info: &[u8]) -> Result<EncryptionKey, BarrierError> {
        let master = self.master_key().await?;
        Ok(crypto::derive_key(&master, None, info)?)
    }

    async fn master_key(&self) -> Result<EncryptionKey, BarrierError> {
        self.key.read().await.clone().ok_or(BarrierError::Sealed)
    }
}

impl fmt::Debug for Barrier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Barrier").finish_non_exhaustive()
    }
}
