//! JSON-lines audit files.
//!
//! [`FileAuditSink`] mirrors every entry to an append-only file as it is
//! written. [`ArchiveWriter`] writes batches of aged entries to their own
//! files before the repository marks them archived.
//!
//! Each line is one complete JSON [`AuditLog`]. Files are only ever created
//! or appended to.

use std::path::{Path, PathBuf};

use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::audit::{AuditLog, AuditSink};
use crate::error::AuditError;

fn encode_lines(entries: &[AuditLog]) -> Result<Vec<u8>, AuditError> {
    let mut out = Vec::new();
    for entry in entries {
        serde_json::to_writer(&mut out, entry).map_err(|e| AuditError::Serialization {
            reason: e.to_string(),
        })?;
        out.push(b'\n');
    }
    Ok(out)
}

/// Mirror sink appending JSON lines to a file.
pub struct FileAuditSink {
    path: PathBuf,
    writer: Mutex<Option<tokio::fs::File>>,
}

impl FileAuditSink {
    /// The file is created (or opened for append) lazily on the first write.
    #[must_use]
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            writer: Mutex::new(None),
        }
    }

    fn failure(&self, reason: String) -> AuditError {
        AuditError::SinkFailure {
            name: self.name().to_owned(),
            reason,
        }
    }
}

#[async_trait::async_trait]
impl AuditSink for FileAuditSink {
    #[allow(clippy::unnecessary_literal_bound)]
    fn name(&self) -> &str {
        "file"
    }

    async fn write(&self, entry: &AuditLog) -> Result<(), AuditError> {
        let line = encode_lines(std::slice::from_ref(entry))?;

        let mut guard = self.writer.lock().await;
        if guard.is_none() {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await
                .map_err(|e| {
                    self.failure(format!("failed to open '{}': {e}", self.path.display()))
                })?;
            *guard = Some(file);
        }
        let file = guard
            .as_mut()
            .ok_or_else(|| self.failure("file handle missing after open".to_owned()))?;

        file.write_all(&line)
            .await
            .map_err(|e| self.failure(format!("write failed: {e}")))?;
        file.flush()
            .await
            .map_err(|e| self.failure(format!("flush failed: {e}")))
    }
}

impl std::fmt::Debug for FileAuditSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileAuditSink")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

/// Writes archive batches, one new file per batch.
#[derive(Debug, Clone)]
pub struct ArchiveWriter {
    dir: PathBuf,
}

impl ArchiveWriter {
    #[must_use]
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    /// Write `batch` to a new file and return its path.
    ///
    /// The file is synced before returning. An existing file is never
    /// overwritten.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError::Archive`] if the directory or file cannot be
    /// written.
    pub async fn write_batch(&self, batch: &[AuditLog]) -> Result<String, AuditError> {
        let Some(first) = batch.first() else {
            return Err(AuditError::Archive {
                location: self.dir.display().to_string(),
                reason: "empty batch".to_owned(),
            });
        };
        let name = format!(
            "audit-{}-{}.jsonl",
            first.timestamp.format("%Y%m%dT%H%M%S"),
            first.id
        );
        let path = self.dir.join(name);
        let location = path.display().to_string();
        let archive_err = |reason: String| AuditError::Archive {
            location: location.clone(),
            reason,
        };

        let body = encode_lines(batch)?;
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| archive_err(format!("create directory: {e}")))?;
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
            .map_err(|e| archive_err(format!("create file: {e}")))?;
        file.write_all(&body)
            .await
            .map_err(|e| archive_err(format!("write: {e}")))?;
        file.sync_all()
            .await
            .map_err(|e| archive_err(format!("sync: {e}")))?;

        Ok(location)
    }
}
