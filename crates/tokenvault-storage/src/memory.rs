//! In-memory storage backend.
//!
//! Stores all data in a `BTreeMap` behind a `RwLock`. Nothing is persisted.
//! Used by unit and integration tests, and by the daemon when
//! `TOKENVAULT_STORAGE=memory`.

use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::{BatchOp, StorageBackend, StorageError};

/// Storage held in process memory.
///
/// Sorted keys make prefix listing a `range` scan. Compare-and-swap and
/// batches hold the write lock for their whole duration, which makes them
/// atomic with respect to every other call.
///
/// # Examples
///
/// ```
/// # use tokenvault_storage::{MemoryBackend, StorageBackend};
/// # #[tokio::main]
/// # async fn main() {
/// let backend = MemoryBackend::new();
/// assert!(backend.compare_and_swap("vault-names/cards", None, b"id").await.unwrap());
/// assert!(!backend.compare_and_swap("vault-names/cards", None, b"other").await.unwrap());
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct MemoryBackend {
    data: Arc<RwLock<BTreeMap<String, Vec<u8>>>>,
}

impl MemoryBackend {
    #[must_use]
    pub fn new() -> Self {
        Self {
            data: Arc::new(RwLock::new(BTreeMap::new())),
        }
    }

    /// Number of stored keys.
    pub async fn len(&self) -> usize {
        self.data.read().await.len()
    }

    /// Whether the backend holds no keys.
    pub async fn is_empty(&self) -> bool {
        self.data.read().await.is_empty()
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl StorageBackend for MemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let data = self.data.read().await;
        Ok(data.get(key).cloned())
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        let mut data = self.data.write().await;
        data.insert(key.to_owned(), value.to_vec());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let mut data = self.data.write().await;
        data.remove(key);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let data = self.data.read().await;
        let keys = data
            .range(prefix.to_owned()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect();
        Ok(keys)
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        new: &[u8],
    ) -> Result<bool, StorageError> {
        let mut data = self.data.write().await;
        if data.get(key).map(Vec::as_slice) != expected {
            return Ok(false);
        }
        data.insert(key.to_owned(), new.to_vec());
        Ok(true)
    }

    async fn write_batch(&self, ops: Vec<BatchOp>) -> Result<(), StorageError> {
        let mut data = self.data.write().await;
        for op in ops {
            match op {
                BatchOp::Put { key, value } => {
                    data.insert(key, value);
                }
                BatchOp::Delete { key } => {
                    data.remove(&key);
                }
            }
        }
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        let data = self.data.read().await;
        Ok(data.contains_key(key))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_keys_and_deletes() {
        let backend = MemoryBackend::new();
        assert_eq!(backend.get("vaults/missing").await.unwrap(), None);
        assert!(!backend.exists("vaults/missing").await.unwrap());
        backend.delete("vaults/missing").await.unwrap();
        assert!(backend.is_empty().await);
    }

    #[tokio::test]
    async fn list_is_sorted_and_stops_at_prefix() {
        let backend = MemoryBackend::new();
        backend.put("tokens/b", b"2").await.unwrap();
        backend.put("tokens/a", b"1").await.unwrap();
        backend.put("token-index/v/a", b"").await.unwrap();
        backend.put("tokensx", b"3").await.unwrap();

        assert_eq!(backend.list("tokens/").await.unwrap(), vec!["tokens/a", "tokens/b"]);
        assert_eq!(backend.len().await, 4);
    }

    #[tokio::test]
    async fn cas_guards_revisioned_records() {
        let backend = MemoryBackend::new();
        backend.put("vaults/v", b"rev-1").await.unwrap();

        assert!(backend.compare_and_swap("vaults/v", Some(b"rev-1"), b"rev-2").await.unwrap());
        assert!(!backend.compare_and_swap("vaults/v", Some(b"rev-1"), b"rev-3").await.unwrap());
        assert!(!backend.compare_and_swap("vaults/v", None, b"rev-9").await.unwrap());
        assert_eq!(backend.get("vaults/v").await.unwrap(), Some(b"rev-2".to_vec()));
    }

    #[tokio::test]
    async fn concurrent_counter_increments_are_not_lost() {
        let backend = MemoryBackend::new();
        backend.put("counter", b"0").await.unwrap();

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let b = backend.clone();
                tokio::spawn(async move {
                    loop {
                        let current = b.get("counter").await.unwrap().unwrap();
                        let n: u32 = std::str::from_utf8(&current).unwrap().parse().unwrap();
                        let next = (n + 1).to_string();
                        if b.compare_and_swap("counter", Some(&current), next.as_bytes())
                            .await
                            .unwrap()
                        {
                            return;
                        }
                    }
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(backend.get("counter").await.unwrap(), Some(b"16".to_vec()));
    }

    #[tokio::test]
    async fn batch_moves_record_and_index_together() {
        let backend = MemoryBackend::new();
        backend.put("tokens/old", b"x").await.unwrap();
        backend.put("token-index/v/old", b"").await.unwrap();

        backend
            .write_batch(vec![
                BatchOp::delete("tokens/old"),
                BatchOp::delete("token-index/v/old"),
                BatchOp::put("tokens/new", b"y".to_vec()),
                BatchOp::put("token-index/v/new", Vec::new()),
            ])
            .await
            .unwrap();

        assert_eq!(
            backend.list("").await.unwrap(),
            vec!["token-index/v/new", "tokens/new"]
        );
    }
}
