//! redb storage backend (feature `redb-backend`).
//!
//! Pure Rust, so it builds without a C++ toolchain. Every key lives in one
//! table. redb runs one write transaction at a time, so compare-and-swap and
//! batches are a read followed by writes inside the same transaction.

use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use redb::{Database, ReadOnlyTable, ReadableTable, Table, TableDefinition};

use crate::{BatchOp, StorageBackend, StorageError, StorageOp, run_blocking};

const TABLE_NAME: &str = "tokenvault";
const KV: TableDefinition<&str, &[u8]> = TableDefinition::new(TABLE_NAME);

type ReadTable = ReadOnlyTable<&'static str, &'static [u8]>;
type WriteTable<'txn> = Table<'txn, &'static str, &'static [u8]>;

/// Storage backed by a single redb file.
///
/// # Examples
///
/// ```no_run
/// # use tokenvault_storage::RedbBackend;
/// let backend = RedbBackend::open("/var/lib/tokenvault/data.redb").unwrap();
/// ```
#[derive(Clone)]
pub struct RedbBackend {
    db: Arc<Database>,
    path: PathBuf,
}

impl std::fmt::Debug for RedbBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbBackend")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

fn open_err(path: &Path, e: impl Display) -> StorageError {
    StorageError::Open {
        path: path.display().to_string(),
        reason: e.to_string(),
    }
}

impl RedbBackend {
    /// Open the database file at `path`, creating it and its table if
    /// missing.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Open`] if the file cannot be opened or
    /// initialised.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref();
        let db = Database::create(path).map_err(|e| open_err(path, e))?;

        let txn = db.begin_write().map_err(|e| open_err(path, e))?;
        txn.open_table(KV).map_err(|e| open_err(path, e))?;
        txn.commit().map_err(|e| open_err(path, e))?;

        Ok(Self {
            db: Arc::new(db),
            path: path.to_path_buf(),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read<T, F>(&self, op: StorageOp, f: F) -> Result<T, StorageError>
    where
        T: Send + 'static,
        F: FnOnce(&ReadTable) -> Result<T, StorageError> + Send + 'static,
    {
        let db = Arc::clone(&self.db);
        run_blocking(op, move || {
            let txn = db.begin_read().map_err(|e| StorageError::op(op, TABLE_NAME, e))?;
            let table = txn.open_table(KV).map_err(|e| StorageError::op(op, TABLE_NAME, e))?;
            f(&table)
        })
        .await
    }

    /// Run `f` in one write transaction. Nothing is committed if `f` fails.
    async fn write<T, F>(&self, op: StorageOp, f: F) -> Result<T, StorageError>
    where
        T: Send + 'static,
        F: FnOnce(&mut WriteTable<'_>) -> Result<T, StorageError> + Send + 'static,
    {
        let db = Arc::clone(&self.db);
        run_blocking(op, move || {
            let txn = db.begin_write().map_err(StorageError::commit)?;
            let out = {
                let mut table = txn
                    .open_table(KV)
                    .map_err(|e| StorageError::op(op, TABLE_NAME, e))?;
                f(&mut table)?
            };
            txn.commit().map_err(StorageError::commit)?;
            Ok(out)
        })
        .await
    }
}

#[async_trait::async_trait]
impl StorageBackend for RedbBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let key = key.to_owned();
        self.read(StorageOp::Read, move |table| {
            let value = table
                .get(key.as_str())
                .map_err(|e| StorageError::op(StorageOp::Read, key.as_str(), e))?;
            Ok(value.map(|v| v.value().to_vec()))
        })
        .await
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        let key = key.to_owned();
        let value = value.to_vec();
        self.write(StorageOp::Write, move |table| {
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(|e| StorageError::op(StorageOp::Write, key.as_str(), e))?;
            Ok(())
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let key = key.to_owned();
        self.write(StorageOp::Delete, move |table| {
            table
                .remove(key.as_str())
                .map_err(|e| StorageError::op(StorageOp::Delete, key.as_str(), e))?;
            Ok(())
        })
        .await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let prefix = prefix.to_owned();
        self.read(StorageOp::List, move |table| {
            let err = |e: redb::StorageError| StorageError::op(StorageOp::List, prefix.as_str(), e);
            let mut keys = Vec::new();
            for item in table.range(prefix.as_str()..).map_err(err)? {
                let (key, _) = item.map_err(err)?;
                let key = key.value();
                if !key.starts_with(prefix.as_str()) {
                    break;
                }
                keys.push(key.to_owned());
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
        self.write(StorageOp::CompareAndSwap, move |table| {
            let err =
                |e: redb::StorageError| StorageError::op(StorageOp::CompareAndSwap, key.as_str(), e);
            let current = table.get(key.as_str()).map_err(err)?.map(|v| v.value().to_vec());
            if current != expected {
                return Ok(false);
            }
            table.insert(key.as_str(), new.as_slice()).map_err(err)?;
            Ok(true)
        })
        .await
    }

    async fn write_batch(&self, ops: Vec<BatchOp>) -> Result<(), StorageError> {
        self.write(StorageOp::Batch, move |table| {
            for op in &ops {
                let applied = match op {
                    BatchOp::Put { key, value } => table.insert(key.as_str(), value.as_slice()),
                    BatchOp::Delete { key } => table.remove(key.as_str()),
                };
                applied.map_err(|e| StorageError::op(StorageOp::Batch, op.key(), e))?;
            }
            Ok(())
        })
        .await
    }
}
