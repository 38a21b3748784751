//! `RocksDB` storage backend (feature `rocksdb-backend`, on by default).
//!
//! `RocksDB` is a synchronous C++ library, so every call runs on the Tokio
//! blocking pool. A plain `DB` has no compare-and-swap. Mutations (put,
//! delete, batch, CAS) therefore take a process-local write lock while reads
//! go straight to the database. `RocksDB`'s own `LOCK` file keeps a second
//! process out of the directory, so the process-local lock is sufficient.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use rocksdb::{DBWithThreadMode, Direction, IteratorMode, MultiThreaded, Options, WriteBatch};

use crate::{BatchOp, StorageBackend, StorageError, StorageOp, run_blocking};

type Db = DBWithThreadMode<MultiThreaded>;

struct Inner {
    db: Db,
    write_lock: Mutex<()>,
    path: PathBuf,
}

/// Storage backed by a `RocksDB` directory.
///
/// # Examples
///
/// ```no_run
/// # use tokenvault_storage::RocksDbBackend;
/// let backend = RocksDbBackend::open("/var/lib/tokenvault/data").unwrap();
/// ```
#[derive(Clone)]
pub struct RocksDbBackend {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for RocksDbBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RocksDbBackend")
            .field("path", &self.inner.path)
            .finish_non_exhaustive()
    }
}

impl RocksDbBackend {
    /// Open the database directory at `path`, creating it if missing.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Open`] if `RocksDB` cannot open or create the
    /// directory, for example because another process holds its lock.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref();
        let mut opts = Options::default();
        opts.create_if_missing(true);

        let db = Db::open(&opts, path).map_err(|e| StorageError::Open {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

        Ok(Self {
            inner: Arc::new(Inner {
                db,
                write_lock: Mutex::new(()),
                path: path.to_path_buf(),
            }),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    async fn read<T, F>(&self, op: StorageOp, f: F) -> Result<T, StorageError>
    where
        T: Send + 'static,
        F: FnOnce(&Db) -> Result<T, StorageError> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        run_blocking(op, move || f(&inner.db)).await
    }

    /// Run `f` while holding the write lock.
    async fn mutate<T, F>(&self, op: StorageOp, f: F) -> Result<T, StorageError>
    where
        T: Send + 'static,
        F: FnOnce(&Db) -> Result<T, StorageError> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        run_blocking(op, move || {
            let _guard = inner
                .write_lock
                .lock()
                .map_err(|_| StorageError::worker(op, "write lock poisoned"))?;
            f(&inner.db)
        })
        .await
    }
}

#[async_trait::async_trait]
impl StorageBackend for RocksDbBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let key = key.to_owned();
        self.read(StorageOp::Read, move |db| {
            db.get(key.as_bytes())
                .map_err(|e| StorageError::op(StorageOp::Read, key.as_str(), e))
        })
        .await
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        let key = key.to_owned();
        let value = value.to_vec();
        self.mutate(StorageOp::Write, move |db| {
            db.put(key.as_bytes(), &value)
                .map_err(|e| StorageError::op(StorageOp::Write, key.as_str(), e))
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let key = key.to_owned();
        self.mutate(StorageOp::Delete, move |db| {
            db.delete(key.as_bytes())
                .map_err(|e| StorageError::op(StorageOp::Delete, key.as_str(), e))
        })
        .await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let prefix = prefix.to_owned();
        self.read(StorageOp::List, move |db| {
            let mut keys = Vec::new();
            for item in db.iterator(IteratorMode::From(prefix.as_bytes(), Direction::Forward)) {
                let (key, _) =
                    item.map_err(|e| StorageError::op(StorageOp::List, prefix.as_str(), e))?;
                if !key.starts_with(prefix.as_bytes()) {
                    break;
                }
                let key = String::from_utf8(key.into_vec())
                    .map_err(|e| StorageError::InvalidKey { reason: e.to_string() })?;
                keys.push(key);
            }
            Ok(keys)
        })
        .await
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        new: &[u8],
    ) -> Result<bool, StorageError> {
        let key = key.to_owned();
        let expected = expected.map(<[u8]>::to_vec);
        let new = new.to_vec();
        self.mutate(StorageOp::CompareAndSwap, move |db| {
            let err = |e: rocksdb::Error| StorageError::op(StorageOp::CompareAndSwap, key.as_str(), e);
            if db.get(key.as_bytes()).map_err(err)? != expected {
                return Ok(false);
            }
            db.put(key.as_bytes(), &new).map_err(err)?;
            Ok(true)
        })
        .await
    }

    async fn write_batch(&self, ops: Vec<BatchOp>) -> Result<(), StorageError> {
        self.mutate(StorageOp::Batch, move |db| {
            let mut batch = WriteBatch::default();
            for op in &ops {
                match op {
                    BatchOp::Put { key, value } => batch.put(key.as_bytes(), value),
                    BatchOp::Delete { key } => batch.delete(key.as_bytes()),
                }
            }
            db.write(batch).map_err(StorageError::commit)
        })
        .await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn open_temp() -> (tempfile::TempDir, RocksDbBackend) {
        let dir = tempfile::tempdir().unwrap();
        let backend = RocksDbBackend::open(dir.path()).unwrap();
        (dir, backend)
    }

    #[tokio::test]
    async fn list_stops_at_prefix_boundary() {
        let (_dir, backend) = open_temp();
        backend.put("audit/2", b"b").await.unwrap();
        backend.put("audit/1", b"a").await.unwrap();
        backend.put("auditx", b"z").await.unwrap();
        backend.put("vaults/x", b"c").await.unwrap();

        assert_eq!(backend.get("audit/1").await.unwrap(), Some(b"a".to_vec()));
        assert_eq!(backend.list("audit/").await.unwrap(), vec!["audit/1", "audit/2"]);
    }

    #[tokio::test]
    async fn cas_insert_then_swap() {
        let (_dir, backend) = open_temp();
        assert!(backend.compare_and_swap("k", None, b"1").await.unwrap());
        assert!(!backend.compare_and_swap("k", None, b"2").await.unwrap());
        assert!(backend.compare_and_swap("k", Some(b"1"), b"2").await.unwrap());
        assert_eq!(backend.get("k").await.unwrap(), Some(b"2".to_vec()));
    }

    #[tokio::test]
    async fn batch_is_applied_together() {
        let (_dir, backend) = open_temp();
        backend.put("gone", b"x").await.unwrap();
        backend
            .write_batch(vec![BatchOp::put("a", b"1".to_vec()), BatchOp::delete("gone")])
            .await
            .unwrap();
        assert!(backend.exists("a").await.unwrap());
        assert!(!backend.exists("gone").await.unwrap());
    }

    #[tokio::test]
    async fn second_open_of_same_directory_fails() {
        let (dir, _backend) = open_temp();
        assert!(matches!(
            RocksDbBackend::open(dir.path()),
            Err(StorageError::Open { .. })
        ));
    }
}
