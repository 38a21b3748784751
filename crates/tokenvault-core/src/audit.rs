//! Audit logging.
//!
//! Every sensitive operation produces exactly one [`AuditLog`] entry, written
//! through [`AuditLogger`] BEFORE the result is handed back. The durable
//! repository write is fail-closed: if it fails, the business operation is
//! treated as failed. Mirror sinks (see [`crate::audit_file`]) are best
//! effort.
//!
//! Entries never hold token values or plaintext. Tokens are referenced by
//! an HMAC-SHA256 under a key derived from the master key, so entries can be
//! correlated without being reversible.
//!
//! [`AuditLogService`] is the query and retention surface: archival writes
//! aged entries to JSON-lines files and marks them archived; purging only
//! ever deletes entries that were archived first.

use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::audit_file::ArchiveWriter;
use crate::context::{RequestContext, bounded};
use crate::crypto::{self, EncryptionKey};
use crate::error::{AuditError, ErrorCode};
use crate::id::{AuditLogId, VaultId};
use crate::repository::AuditLogRepository;
use crate::risk::{RiskInput, RiskLevel, RiskScorer};
use crate::settings::AuditSettings;
use crate::vault::{DataType, Vault};

/// HKDF info for the audit HMAC key.
pub const AUDIT_HMAC_INFO: &[u8] = b"tokenvault-audit-hmac-v1";

/// Audited operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    Tokenize,
    Detokenize,
    Revoke,
    Suspend,
    Reactivate,
    PurgeTokens,
    RotateKey,
    CreateVault,
    UpdateVaultStatus,
    DeleteVault,
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Tokenize => "tokenize",
            Self::Detokenize => "detokenize",
            Self::Revoke => "revoke",
            Self::Suspend => "suspend",
            Self::Reactivate => "reactivate",
            Self::PurgeTokens => "purge_tokens",
            Self::RotateKey => "rotate_key",
            Self::CreateVault => "create_vault",
            Self::UpdateVaultStatus => "update_vault_status",
            Self::DeleteVault => "delete_vault",
        })
    }
}

/// Whether an entry is still live or has been written to an archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ArchiveState {
    Live,
    Archived {
        location: String,
        archived_at: DateTime<Utc>,
    },
}

/// One audit entry. Immutable once written, apart from `archive`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditLog {
    pub id: AuditLogId,
    pub vault_id: Option<VaultId>,
    /// HMAC of the token value, hex.
    pub token_ref: Option<String>,
    pub operation: OperationType,
    pub risk_level: RiskLevel,
    pub ip_address: Option<IpAddr>,
    pub actor: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub duration_ms: u64,
    pub success: bool,
    pub error_code: Option<ErrorCode>,
    pub pci_relevant: bool,
    pub details: BTreeMap<String, String>,
    pub archive: ArchiveState,
}

impl AuditLog {
    #[must_use]
    pub fn is_archived(&self) -> bool {
        matches!(self.archive, ArchiveState::Archived { .. })
    }
}

/// An operation in flight, turned into an [`AuditLog`] when it finishes.
#[derive(Debug, Clone)]
pub struct AuditEvent {
    operation: OperationType,
    vault_id: Option<VaultId>,
    data_type: Option<DataType>,
    token_ref: Option<String>,
    ip_address: Option<IpAddr>,
    actor: Option<String>,
    started: Instant,
    recent_accesses: u32,
    details: BTreeMap<String, String>,
}

impl AuditEvent {
    /// Start timing an operation on behalf of `ctx`.
    #[must_use]
    pub fn start(operation: OperationType, ctx: &RequestContext) -> Self {
        Self {
            operation,
            vault_id: None,
            data_type: None,
            token_ref: None,
            ip_address: ctx.ip_address,
            actor: ctx.actor.clone(),
            started: Instant::now(),
            recent_accesses: 0,
            details: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn vault(mut self, vault: &Vault) -> Self {
        self.vault_id = Some(vault.id);
        self.data_type = Some(vault.data_type);
        self
    }

    #[must_use]
    pub fn vault_id(mut self, vault_id: VaultId) -> Self {
        self.vault_id = Some(vault_id);
        self
    }

    #[must_use]
    pub fn token_ref(mut self, token_ref: String) -> Self {
        self.token_ref = Some(token_ref);
        self
    }

    #[must_use]
    pub fn recent_accesses(mut self, count: u32) -> Self {
        self.recent_accesses = count;
        self
    }

    #[must_use]
    pub fn detail(mut self, key: &str, value: impl ToString) -> Self {
        self.details.insert(key.to_owned(), value.to_string());
        self
    }

    #[must_use]
    pub fn operation(&self) -> OperationType {
        self.operation
    }
}

/// A best-effort mirror of audit entries.
#[async_trait::async_trait]
pub trait AuditSink: Send + Sync {
    /// The sink's name (for error reporting).
    fn name(&self) -> &str;

    /// Write one entry.
    ///
    /// # Errors
    ///
    /// Returns an error if the entry could not be written.
    async fn write(&self, entry: &AuditLog) -> Result<(), AuditError>;
}

/// Writes audit entries: repository first (mandatory), then sinks.
pub struct AuditLogger {
    repository: Arc<dyn AuditLogRepository>,
    sinks: Vec<Arc<dyn AuditSink>>,
    scorer: Arc<dyn RiskScorer>,
    hmac_key: EncryptionKey,
    timeout: Duration,
}

impl AuditLogger {
    #[must_use]
    pub fn new(
        repository: Arc<dyn AuditLogRepository>,
        scorer: Arc<dyn RiskScorer>,
        hmac_key: EncryptionKey,
        timeout: Duration,
    ) -> Self {
        Self {
            repository,
            sinks: Vec::new(),
            scorer,
            hmac_key,
            timeout,
        }
    }

    /// Add a mirror sink.
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Keyed, irreversible reference to a token value.
    #[must_use]
    pub fn token_ref(&self, token: &str) -> String {
        crypto::hmac_hex(&self.hmac_key, token.as_bytes())
    }

    /// Record a successful operation.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError::WriteFailed`] if the entry could not be durably
    /// stored. The caller must then treat its operation as failed.
    pub async fn success(&self, event: AuditEvent) -> Result<AuditLog, AuditError> {
        self.record(event, None).await
    }

    /// Record a failed operation with the code the caller will see.
    ///
    /// # Errors
    ///
    /// Same as [`success`](AuditLogger::success).
    pub async fn failure(&self, event: AuditEvent, code: ErrorCode) -> Result<AuditLog, AuditError> {
        self.record(event, Some(code)).await
    }

    async fn record(
        &self,
        event: AuditEvent,
        error_code: Option<ErrorCode>,
    ) -> Result<AuditLog, AuditError> {
        let success = error_code.is_none();
        let risk_level = self.scorer.score(&RiskInput {
            operation: event.operation,
            success,
            recent_accesses: event.recent_accesses,
        });
        let entry = AuditLog {
            id: AuditLogId::new(),
            vault_id: event.vault_id,
            token_ref: event.token_ref,
            operation: event.operation,
            risk_level,
            ip_address: event.ip_address,
            actor: event.actor,
            timestamp: Utc::now(),
            duration_ms: u64::try_from(event.started.elapsed().as_millis()).unwrap_or(u64::MAX),
            success,
            error_code,
            pci_relevant: event.data_type.is_some_and(DataType::is_pci),
            details: event.details,
            archive: ArchiveState::Live,
        };

        bounded("audit.save", self.timeout, self.repository.save(&entry))
            .await
            .map_err(|e| AuditError::WriteFailed {
                reason: e.to_string(),
            })?;

        for sink in &self.sinks {
            if let Err(e) = sink.write(&entry).await {
                warn!(sink = sink.name(), error = %e, "audit mirror sink failed");
            }
        }

        Ok(entry)
    }
}

impl fmt::Debug for AuditLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuditLogger")
            .field("sinks", &self.sinks.len())
            .field("hmac_key", &"[REDACTED]")
            .finish_non_exhaustive()
    }
}

/// Outcome of an archival pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArchiveReport {
    pub archived: usize,
    pub locations: Vec<String>,
}

/// Outcome of a full retention pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetentionReport {
    pub archive: ArchiveReport,
    pub purged: usize,
}

/// Audit queries and retention.
pub struct AuditLogService {
    repository: Arc<dyn AuditLogRepository>,
    archive: ArchiveWriter,
    settings: AuditSettings,
    timeout: Duration,
}

impl AuditLogService {
    #[must_use]
    pub fn new(
        repository: Arc<dyn AuditLogRepository>,
        settings: AuditSettings,
        timeout: Duration,
    ) -> Self {
        Self {
            repository,
            archive: ArchiveWriter::new(settings.archive_dir.clone()),
            settings,
            timeout,
        }
    }

    /// # Errors
    ///
    /// Returns [`AuditError::Repository`] if the lookup fails.
    pub async fn find_by_id(&self, id: AuditLogId) -> Result<Option<AuditLog>, AuditError> {
        Ok(bounded("audit.find_by_id", self.timeout, self.repository.find_by_id(id)).await?)
    }

    /// # Errors
    ///
    /// Returns [`AuditError::NotFound`] if no entry has this id.
    pub async fn find_by_id_or_fail(&self, id: AuditLogId) -> Result<AuditLog, AuditError> {
        self.find_by_id(id).await?.ok_or(AuditError::NotFound { id })
    }

    /// Newest first.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError::Repository`] if the query fails.
    pub async fn find_by_vault(
        &self,
        vault_id: VaultId,
        limit: usize,
    ) -> Result<Vec<AuditLog>, AuditError> {
        Ok(bounded(
            "audit.find_by_vault_id",
            self.timeout,
            self.repository.find_by_vault_id(vault_id, limit),
        )
        .await?)
    }

    /// # Errors
    ///
    /// Returns [`AuditError::Repository`] if the query fails.
    pub async fn find_by_operation(
        &self,
        operation: OperationType,
        limit: usize,
    ) -> Result<Vec<AuditLog>, AuditError> {
        Ok(bounded(
            "audit.find_by_operation",
            self.timeout,
            self.repository.find_by_operation(operation, limit),
        )
        .await?)
    }

    /// # Errors
    ///
    /// Returns [`AuditError::Repository`] if the query fails.
    pub async fn find_by_risk_level(
        &self,
        level: RiskLevel,
        limit: usize,
    ) -> Result<Vec<AuditLog>, AuditError> {
        Ok(bounded(
            "audit.find_by_risk_level",
            self.timeout,
            self.repository.find_by_risk_level(level, limit),
        )
        .await?)
    }

    /// Entries from `ip` with `from <= timestamp < to`.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError::Repository`] if the query fails.
    pub async fn find_by_ip_address(
        &self,
        ip: IpAddr,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<AuditLog>, AuditError> {
        Ok(bounded(
            "audit.find_by_ip_address",
            self.timeout,
            self.repository.find_by_ip_address(ip, from, to),
        )
        .await?)
    }

    /// # Errors
    ///
    /// Returns [`AuditError::Repository`] if the query fails.
    pub async fn find_failed_operations(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<AuditLog>, AuditError> {
        Ok(bounded(
            "audit.find_failed_operations",
            self.timeout,
            self.repository.find_failed_operations(since),
        )
        .await?)
    }

    /// # Errors
    ///
    /// Returns [`AuditError::Repository`] if the query fails.
    pub async fn find_pci_relevant_logs(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<AuditLog>, AuditError> {
        Ok(bounded(
            "audit.find_pci_relevant_logs",
            self.timeout,
            self.repository.find_pci_relevant_logs(from, to),
        )
        .await?)
    }

    /// High and critical entries since `since`.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError::Repository`] if the query fails.
    pub async fn find_high_risk_operations(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<AuditLog>, AuditError> {
        Ok(bounded(
            "audit.find_high_risk_operations",
            self.timeout,
            self.repository.find_high_risk_operations(since),
        )
        .await?)
    }

    /// # Errors
    ///
    /// Returns [`AuditError::Repository`] if the query fails.
    pub async fn count_operations_by_type(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<BTreeMap<OperationType, u64>, AuditError> {
        Ok(bounded(
            "audit.count_operations_by_type",
            self.timeout,
            self.repository.count_operations_by_type(from, to),
        )
        .await?)
    }

    /// Mean `duration_ms`, or `None` if the range is empty.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError::Repository`] if the query fails.
    pub async fn average_processing_time(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Option<f64>, AuditError> {
        Ok(bounded(
            "audit.get_average_processing_time",
            self.timeout,
            self.repository.get_average_processing_time(from, to),
        )
        .await?)
    }

    /// Archive every live entry older than `cutoff`, one file per batch.
    ///
    /// Each batch is written to disk before it is marked archived, so a
    /// failed write leaves the entries live.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError::Archive`] if a file cannot be written, or
    /// [`AuditError::Repository`] if the repository fails.
    pub async fn archive_older_than(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<ArchiveReport, AuditError> {
        let mut report = ArchiveReport::default();
        loop {
            let batch = bounded(
                "audit.find_old_logs_for_archival",
                self.timeout,
                self.repository
                    .find_old_logs_for_archival(cutoff, self.settings.batch_size),
            )
            .await?;
            if batch.is_empty() {
                break;
            }

            let location = self.archive.write_batch(&batch).await?;
            let ids: Vec<AuditLogId> = batch.iter().map(|entry| entry.id).collect();
            let marked = bounded(
                "audit.mark_as_archived",
                self.timeout,
                self.repository.mark_as_archived(&ids, &location, Utc::now()),
            )
            .await?;

            info!(location = %location, entries = marked, "audit batch archived");
            report.archived = report.archived.saturating_add(marked);
            report.locations.push(location);
            if marked == 0 {
                break;
            }
        }
        Ok(report)
    }

    /// Permanently delete archived entries older than `cutoff`. Live entries
    /// are never touched.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError::Repository`] if the repository fails.
    pub async fn purge_archived_before(&self, cutoff: DateTime<Utc>) -> Result<usize, AuditError> {
        let purged = bounded(
            "audit.delete_archived_logs",
            self.timeout,
            self.repository.delete_archived_logs(cutoff),
        )
        .await?;
        if purged > 0 {
            info!(entries = purged, cutoff = %cutoff, "archived audit entries purged");
        }
        Ok(purged)
    }

    /// Archive, then purge, using the configured windows relative to `now`.
    ///
    /// # Errors
    ///
    /// - [`AuditError::InvalidRetention`] if the purge window does not
    ///   exceed the archive window.
    /// - Anything [`archive_older_than`](Self::archive_older_than) or
    ///   [`purge_archived_before`](Self::purge_archived_before) returns.
    pub async fn enforce_retention(&self, now: DateTime<Utc>) -> Result<RetentionReport, AuditError> {
        if self.settings.purge_after_days <= self.settings.archive_after_days {
            return Err(AuditError::InvalidRetention {
                reason: format!(
                    "purge window ({} days) must exceed archive window ({} days)",
                    self.settings.purge_after_days, self.settings.archive_after_days
                ),
            });
        }
        let archive_cutoff =
            now - chrono::Duration::days(i64::from(self.settings.archive_after_days));
        let purge_cutoff = now - chrono::Duration::days(i64::from(self.settings.purge_after_days));

        let archive = self.archive_older_than(archive_cutoff).await?;
        let purged = self.purge_archived_before(purge_cutoff).await?;
        Ok(RetentionReport { archive, purged })
    }
}

impl fmt::Debug for AuditLogService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuditLogService")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}
