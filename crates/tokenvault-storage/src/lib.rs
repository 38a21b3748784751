//! Storage backend abstraction for `TokenVault`.
//!
//! This crate defines the [`StorageBackend`] trait, a key-value interface that
//! knows nothing about vaults, tokens, or audit logs. Repositories in
//! `tokenvault-core` serialize their records into it.
//!
//! Besides plain reads and writes, the trait exposes the two primitives the
//! core needs for correctness under concurrency:
//!
//! - [`compare_and_swap`](StorageBackend::compare_and_swap) for optimistic
//!   updates (vault token counters, unique name reservation).
//! - [`write_batch`](StorageBackend::write_batch) for all-or-nothing writes
//!   of a record together with its secondary index entries.
//!
//! Three implementations are provided:
//!
//! - [`RocksDbBackend`]: production default (feature `rocksdb-backend`)
//! - [`RedbBackend`]: pure-Rust alternative (feature `redb-backend`)
//! - [`MemoryBackend`]: in-memory, for tests and development

mod error;
mod memory;
#[cfg(feature = "redb-backend")]
mod redb_backend;
#[cfg(feature = "rocksdb-backend")]
mod rocksdb_backend;

pub use error::{StorageError, StorageOp};
pub use memory::MemoryBackend;
#[cfg(feature = "redb-backend")]
pub use redb_backend::RedbBackend;
#[cfg(feature = "rocksdb-backend")]
pub use rocksdb_backend::RocksDbBackend;

/// A single write inside a [`StorageBackend::write_batch`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    /// Insert or overwrite `key` with `value`.
    Put { key: String, value: Vec<u8> },
    /// Remove `key` if present.
    Delete { key: String },
}

impl BatchOp {
    /// Shorthand for [`BatchOp::Put`].
    #[must_use]
    pub fn put(key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Self::Put {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Shorthand for [`BatchOp::Delete`].
    #[must_use]
    pub fn delete(key: impl Into<String>) -> Self {
        Self::Delete { key: key.into() }
    }

    /// The key this operation touches.
    #[must_use]
    pub fn key(&self) -> &str {
        match self {
            Self::Put { key, .. } | Self::Delete { key } => key,
        }
    }
}

/// A pluggable key-value storage backend.
///
/// Keys are UTF-8 strings using `/` as a separator (e.g. `vaults/<id>`,
/// `token-index/<vault>/<hash>`). Values are opaque byte arrays.
///
/// Implementations must be safe to share across async tasks (`Send + Sync`).
#[async_trait::async_trait]
pub trait StorageBackend: Send + Sync + 'static {
    /// Retrieve a value by key.
    ///
    /// Returns `Ok(None)` if the key does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Operation`] if the underlying backend fails.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// Store a key-value pair, overwriting any existing value.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Operation`] if the underlying backend fails.
    async fn put(&self, key: &str, value: &[u8]) -> Result<(), StorageError>;

    /// Delete a key. Deleting a non-existent key is not an error.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Operation`] if the underlying backend fails.
    async fn delete(&self, key: &str) -> Result<(), StorageError>;

    /// List all keys that start with the given prefix, in ascending order.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Operation`] if the underlying backend fails,
    /// or [`StorageError::InvalidKey`] if a stored key is not UTF-8.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError>;

    /// Atomically replace the value at `key` if it currently equals
    /// `expected`.
    ///
    /// `expected = None` means the key must be absent (insert-if-missing).
    /// Returns `Ok(true)` if the swap happened and `Ok(false)` if the current
    /// value did not match.
    ///
    /// # Errors
    ///
    /// Returns a [`StorageError`] if the underlying backend fails.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        new: &[u8],
    ) -> Result<bool, StorageError>;

    /// Apply every operation in `ops` or none of them.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Commit`] if the batch could not be committed.
    /// No operation is applied in that case.
    async fn write_batch(&self, ops: Vec<BatchOp>) -> Result<(), StorageError>;

    /// Check whether a key exists in storage.
    ///
    /// The default implementation calls [`get`](StorageBackend::get).
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Operation`] if the underlying backend fails.
    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.get(key).await?.is_some())
    }
}

/// Run a synchronous backend call on the Tokio blocking pool.
///
/// A panicked or cancelled worker surfaces as [`StorageError::Worker`].
#[cfg(any(feature = "rocksdb-backend", feature = "redb-backend"))]
pub(crate) async fn run_blocking<T, F>(op: StorageOp, f: F) -> Result<T, StorageError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, StorageError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| StorageError::worker(op, e))?
}
