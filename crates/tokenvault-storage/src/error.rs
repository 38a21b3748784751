//! Storage error types.
//!
//! Errors name the operation and the key or prefix it touched. Stored values
//! never appear in an error.

use std::fmt;

/// The backend call that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageOp {
    Read,
    Write,
    Delete,
    List,
    CompareAndSwap,
    Batch,
}

impl fmt::Display for StorageOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Delete => "delete",
            Self::List => "list",
            Self::CompareAndSwap => "compare-and-swap",
            Self::Batch => "batch",
        })
    }
}

/// Errors returned by a [`StorageBackend`](crate::StorageBackend).
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// The backend could not be opened or created at `path`.
    #[error("failed to open storage at '{path}': {reason}")]
    Open { path: String, reason: String },

    /// An operation on `key` (or a prefix, for `list`) failed.
    #[error("storage {op} failed for '{key}': {reason}")]
    Operation {
        op: StorageOp,
        key: String,
        reason: String,
    },

    /// A transaction or write batch could not be committed. Nothing from it
    /// was applied.
    #[error("storage commit failed: {reason}")]
    Commit { reason: String },

    /// The blocking worker running the call died or its lock was poisoned.
    #[error("storage {op} worker failed: {reason}")]
    Worker { op: StorageOp, reason: String },

    /// A stored key was not valid UTF-8.
    #[error("invalid key encoding: {reason}")]
    InvalidKey { reason: String },
}

impl StorageError {
    pub(crate) fn op(op: StorageOp, key: impl Into<String>, e: impl fmt::Display) -> Self {
        Self::Operation {
            op,
            key: key.into(),
            reason: e.to_string(),
        }
    }

    pub(crate) fn commit(e: impl fmt::Display) -> Self {
        Self::Commit {
            reason: e.to_string(),
        }
    }

    pub(crate) fn worker(op: StorageOp, e: impl fmt::Display) -> Self {
        Self::Worker {
            op,
            reason: e.to_string(),
        }
    }

    /// The operation this error came from, when known.
    #[must_use]
    pub fn operation(&self) -> Option<StorageOp> {
        match self {
            Self::Operation { op, .. } | Self::Worker { op, .. } => Some(*op),
            Self::Commit { .. } => Some(StorageOp::Batch),
            Self::Open { .. } | Self::InvalidKey { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_operation_and_key() {
        let err = StorageError::op(StorageOp::CompareAndSwap, "vaults/abc", "io error");
        assert_eq!(
            err.to_string(),
            "storage compare-and-swap failed for 'vaults/abc': io error"
        );
        assert_eq!(err.operation(), Some(StorageOp::CompareAndSwap));
        assert_eq!(StorageError::commit("disk full").operation(), Some(StorageOp::Batch));
    }
}
