//! Repository contracts and their storage-backed implementations.
//!
//! The services depend only on the traits. The `Storage*` implementations
//! keep JSON records in any [`StorageBackend`]:
//!
//! | Prefix | Record |
//! |--------|--------|
//! | `vaults/{id}` | [`Vault`] |
//! | `vault-names/{name}` | vault id (uniqueness index) |
//! | `tokens/{sha256}` | [`Token`] |
//! | `token-index/{vault_id}/{sha256}` | empty (per-vault index) |
//! | `audit/{id}` | [`AuditLog`] |
//!
//! Conditional writes (`insert`, `save_if_revision`) go through the
//! backend's compare-and-swap, so they are safe under concurrent callers.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokenvault_storage::{BatchOp, StorageBackend};

use crate::audit::{ArchiveState, AuditLog, OperationType};
use crate::error::{RepositoryError, VaultError};
use crate::id::{AuditLogId, VaultId};
use crate::risk::RiskLevel;
use crate::token::{Token, TokenStatus};
use crate::vault::{DataType, GlobalVaultStatistics, Vault, VaultStatus};

const VAULT_PREFIX: &str = "vaults/";
const VAULT_NAME_PREFIX: &str = "vault-names/";
const TOKEN_PREFIX: &str = "tokens/";
const TOKEN_INDEX_PREFIX: &str = "token-index/";
const AUDIT_PREFIX: &str = "audit/";

/// One page of results. Pages start at 1.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total_count: u64,
    pub page: u32,
    pub per_page: u32,
}

impl<T> Page<T> {
    #[must_use]
    pub fn total_pages(&self) -> u64 {
        if self.per_page == 0 {
            return 0;
        }
        self.total_count.div_ceil(u64::from(self.per_page))
    }
}

/// Persistence for vaults.
#[async_trait]
pub trait VaultRepository: Send + Sync {
    async fn find_by_id(&self, id: VaultId) -> Result<Option<Vault>, RepositoryError>;

    /// # Errors
    ///
    /// Returns [`VaultError::NotFound`] if no vault has this id.
    async fn find_by_id_or_fail(&self, id: VaultId) -> Result<Vault, VaultError> {
        self.find_by_id(id)
            .await?
            .ok_or(VaultError::NotFound { vault_id: id })
    }

    async fn find_by_name(&self, name: &str) -> Result<Option<Vault>, RepositoryError>;

    async fn find_by_data_type(&self, data_type: DataType) -> Result<Vec<Vault>, RepositoryError>;

    async fn find_by_status(&self, status: VaultStatus) -> Result<Vec<Vault>, RepositoryError>;

    async fn find_active_vaults(&self) -> Result<Vec<Vault>, RepositoryError> {
        self.find_by_status(VaultStatus::Active).await
    }

    /// Active (or stuck rotating) vaults with `next_rotation_at <= now`.
    async fn find_vaults_needing_key_rotation(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<Vault>, RepositoryError>;

    /// Store a new vault. Returns `false` if its name (or id) is taken.
    async fn insert(&self, vault: &Vault) -> Result<bool, RepositoryError>;

    /// Unconditional upsert.
    async fn save(&self, vault: &Vault) -> Result<(), RepositoryError>;

    /// Store `vault` only if the stored revision equals `expected_revision`.
    async fn save_if_revision(
        &self,
        vault: &Vault,
        expected_revision: u64,
    ) -> Result<bool, RepositoryError>;

    /// Hard delete. Returns whether anything was removed.
    async fn delete(&self, id: VaultId) -> Result<bool, RepositoryError>;

    async fn paginate(&self, page: u32, per_page: u32) -> Result<Page<Vault>, RepositoryError>;

    async fn get_statistics(
        &self,
        now: DateTime<Utc>,
    ) -> Result<GlobalVaultStatistics, RepositoryError>;

    async fn get_total_token_count(&self) -> Result<u64, RepositoryError>;

    async fn exists(&self, id: VaultId) -> Result<bool, RepositoryError>;
}

/// Persistence for token records.
#[async_trait]
pub trait TokenRepository: Send + Sync {
    /// Store a new token. Returns `false` if the hash is already taken.
    async fn insert(&self, token: &Token) -> Result<bool, RepositoryError>;

    async fn find_by_hash(&self, token_hash: &str) -> Result<Option<Token>, RepositoryError>;

    /// Store `token` only if the stored revision equals `expected_revision`.
    async fn save_if_revision(
        &self,
        token: &Token,
        expected_revision: u64,
    ) -> Result<bool, RepositoryError>;

    /// Returns whether anything was removed.
    async fn delete(&self, token_hash: &str) -> Result<bool, RepositoryError>;

    async fn find_by_vault(&self, vault_id: VaultId) -> Result<Vec<Token>, RepositoryError>;

    /// Revoked tokens of `vault_id` revoked before `before`.
    async fn find_revoked_before(
        &self,
        vault_id: VaultId,
        before: DateTime<Utc>,
    ) -> Result<Vec<Token>, RepositoryError> {
        Ok(self
            .find_by_vault(vault_id)
            .await?
            .into_iter()
            .filter(|t| t.status == TokenStatus::Revoked && t.revoked_at.is_some_and(|at| at < before))
            .collect())
    }
}

/// Persistence for audit entries.
///
/// Time ranges are half-open: `from <= timestamp < to`.
#[async_trait]
pub trait AuditLogRepository: Send + Sync {
    async fn save(&self, entry: &AuditLog) -> Result<(), RepositoryError>;

    async fn find_by_id(&self, id: AuditLogId) -> Result<Option<AuditLog>, RepositoryError>;

    /// Newest first, at most `limit`.
    async fn find_by_vault_id(
        &self,
        vault_id: VaultId,
        limit: usize,
    ) -> Result<Vec<AuditLog>, RepositoryError>;

    /// Newest first, at most `limit`.
    async fn find_by_operation(
        &self,
        operation: OperationType,
        limit: usize,
    ) -> Result<Vec<AuditLog>, RepositoryError>;

    /// Newest first, at most `limit`.
    async fn find_by_risk_level(
        &self,
        level: RiskLevel,
        limit: usize,
    ) -> Result<Vec<AuditLog>, RepositoryError>;

    async fn find_by_ip_address(
        &self,
        ip: IpAddr,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<AuditLog>, RepositoryError>;

    async fn find_failed_operations(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<AuditLog>, RepositoryError>;

    async fn find_pci_relevant_logs(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<AuditLog>, RepositoryError>;

    /// High and critical entries since `since`.
    async fn find_high_risk_operations(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<AuditLog>, RepositoryError>;

    async fn count_operations_by_type(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<BTreeMap<OperationType, u64>, RepositoryError>;

    async fn get_average_processing_time(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Option<f64>, RepositoryError>;

    /// Live entries with `timestamp < before`, oldest first, at most `limit`.
    async fn find_old_logs_for_archival(
        &self,
        before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<AuditLog>, RepositoryError>;

    /// Set archival metadata on live entries; nothing else changes.
    /// Returns how many were marked.
    async fn mark_as_archived(
        &self,
        ids: &[AuditLogId],
        location: &str,
        archived_at: DateTime<Utc>,
    ) -> Result<usize, RepositoryError>;

    /// Delete archived entries with `timestamp < before`. Live entries are
    /// skipped. Returns how many were deleted.
    async fn delete_archived_logs(&self, before: DateTime<Utc>) -> Result<usize, RepositoryError>;
}

fn encode<T: Serialize>(entity: &'static str, value: &T) -> Result<Vec<u8>, RepositoryError> {
    serde_json::to_vec(value).map_err(|e| RepositoryError::Serialization {
        entity,
        reason: e.to_string(),
    })
}

fn decode<T: DeserializeOwned>(entity: &'static str, bytes: &[u8]) -> Result<T, RepositoryError> {
    serde_json::from_slice(bytes).map_err(|e| RepositoryError::Serialization {
        entity,
        reason: e.to_string(),
    })
}

/// Load every record under `prefix`. Keys removed mid-scan are skipped.
async fn load_all<T: DeserializeOwned>(
    storage: &dyn StorageBackend,
    entity: &'static str,
    prefix: &str,
) -> Result<Vec<T>, RepositoryError> {
    let mut out = Vec::new();
    for key in storage.list(prefix).await? {
        if let Some(bytes) = storage.get(&key).await? {
            out.push(decode(entity, &bytes)?);
        }
    }
    Ok(out)
}

/// Swap in `next` if the stored record still carries `expected_revision`.
async fn swap_if_revision<T: Serialize + DeserializeOwned>(
    storage: &dyn StorageBackend,
    entity: &'static str,
    key: &str,
    next: &T,
    expected_revision: u64,
    revision_of: fn(&T) -> u64,
) -> Result<bool, RepositoryError> {
    let Some(current_bytes) = storage.get(key).await? else {
        return Ok(false);
    };
    let current: T = decode(entity, &current_bytes)?;
    if revision_of(&current) != expected_revision {
        return Ok(false);
    }
    let next_bytes = encode(entity, next)?;
    Ok(storage
        .compare_and_swap(key, Some(&current_bytes), &next_bytes)
        .await?)
}

/// [`VaultRepository`] over a [`StorageBackend`].
pub struct StorageVaultRepository {
    storage: Arc<dyn StorageBackend>,
}

impl StorageVaultRepository {
    #[must_use]
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self { storage }
    }

    fn key(id: VaultId) -> String {
        format!("{VAULT_PREFIX}{id}")
    }

    fn name_key(name: &str) -> String {
        format!("{VAULT_NAME_PREFIX}{name}")
    }

    /// All vaults, oldest first.
    async fn all(&self) -> Result<Vec<Vault>, RepositoryError> {
        let mut vaults: Vec<Vault> = load_all(self.storage.as_ref(), "vault", VAULT_PREFIX).await?;
        vaults.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(vaults)
    }

    async fn filtered(&self, keep: impl Fn(&Vault) -> bool + Send) -> Result<Vec<Vault>, RepositoryError> {
        Ok(self.all().await?.into_iter().filter(|v| keep(v)).collect())
    }
}

#[async_trait]
impl VaultRepository for StorageVaultRepository {
    async fn find_by_id(&self, id: VaultId) -> Result<Option<Vault>, RepositoryError> {
        self.storage
            .get(&Self::key(id))
            .await?
            .map(|bytes| decode("vault", &bytes))
            .transpose()
    }

    async fn find_by_name(&self, name: &str) -> Result<Option<Vault>, RepositoryError> {
        let Some(id_bytes) = self.storage.get(&Self::name_key(name)).await? else {
            return Ok(None);
        };
        let id = String::from_utf8(id_bytes)
            .ok()
            .and_then(|s| VaultId::parse(&s).ok())
            .ok_or_else(|| RepositoryError::Serialization {
                entity: "vault name index",
                reason: format!("corrupt entry for '{name}'"),
            })?;
        self.find_by_id(id).await
    }

    async fn find_by_data_type(&self, data_type: DataType) -> Result<Vec<Vault>, RepositoryError> {
        self.filtered(|v| v.data_type == data_type).await
    }

    async fn find_by_status(&self, status: VaultStatus) -> Result<Vec<Vault>, RepositoryError> {
        self.filtered(|v| v.status == status).await
    }

    async fn find_vaults_needing_key_rotation(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<Vault>, RepositoryError> {
        self.filtered(|v| v.needs_rotation(now)).await
    }

    async fn insert(&self, vault: &Vault) -> Result<bool, RepositoryError> {
        let name_key = Self::name_key(&vault.name);
        if !self
            .storage
            .compare_and_swap(&name_key, None, vault.id.to_string().as_bytes())
            .await?
        {
            return Ok(false);
        }

        let stored = match encode("vault", vault) {
            Ok(bytes) => self
                .storage
                .compare_and_swap(&Self::key(vault.id), None, &bytes)
                .await
                .map_err(RepositoryError::from),
            Err(e) => Err(e),
        };
        match stored {
            Ok(true) => Ok(true),
            other => {
                self.storage.delete(&name_key).await?;
                other
            }
        }
    }

    async fn save(&self, vault: &Vault) -> Result<(), RepositoryError> {
        let bytes = encode("vault", vault)?;
        self.storage
            .write_batch(vec![
                BatchOp::put(Self::key(vault.id), bytes),
                BatchOp::put(Self::name_key(&vault.name), vault.id.to_string().into_bytes()),
            ])
            .await?;
        Ok(())
    }

    async fn save_if_revision(
        &self,
        vault: &Vault,
        expected_revision: u64,
    ) -> Result<bool, RepositoryError> {
        swap_if_revision(
            self.storage.as_ref(),
            "vault",
            &Self::key(vault.id),
            vault,
            expected_revision,
            |v: &Vault| v.revision,
        )
        .await
    }

    async fn delete(&self, id: VaultId) -> Result<bool, RepositoryError> {
        let Some(vault) = self.find_by_id(id).await? else {
            return Ok(false);
        };
        self.storage
            .write_batch(vec![
                BatchOp::delete(Self::key(id)),
                BatchOp::delete(Self::name_key(&vault.name)),
            ])
            .await?;
        Ok(true)
    }

    async fn paginate(&self, page: u32, per_page: u32) -> Result<Page<Vault>, RepositoryError> {
        let all = self.all().await?;
        let total_count = u64::try_from(all.len()).unwrap_or(u64::MAX);
        let skip = usize::try_from(page.saturating_sub(1))
            .unwrap_or(usize::MAX)
            .saturating_mul(usize::try_from(per_page).unwrap_or(usize::MAX));
        let items = all
            .into_iter()
            .skip(skip)
            .take(usize::try_from(per_page).unwrap_or(usize::MAX))
            .collect();
        Ok(Page {
            items,
            total_count,
            page,
            per_page,
        })
    }

    async fn get_statistics(
        &self,
        now: DateTime<Utc>,
    ) -> Result<GlobalVaultStatistics, RepositoryError> {
        let mut stats = GlobalVaultStatistics::default();
        for vault in self.all().await? {
            stats.total_vaults = stats.total_vaults.saturating_add(1);
            let count = stats.by_status.entry(vault.status).or_insert(0);
            *count = count.saturating_add(1);
            stats.total_tokens = stats.total_tokens.saturating_add(vault.token_count);
            if vault.needs_rotation(now) {
                stats.due_for_rotation = stats.due_for_rotation.saturating_add(1);
            }
            stats.last_rotation_at = stats.last_rotation_at.max(vault.last_rotated_at);
        }
        Ok(stats)
    }

    async fn get_total_token_count(&self) -> Result<u64, RepositoryError> {
        Ok(self
            .all()
            .await?
            .iter()
            .fold(0u64, |sum, v| sum.saturating_add(v.token_count)))
    }

    async fn exists(&self, id: VaultId) -> Result<bool, RepositoryError> {
        Ok(self.storage.exists(&Self::key(id)).await?)
    }
}

impl std::fmt::Debug for StorageVaultRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageVaultRepository").finish_non_exhaustive()
    }
}

/// [`TokenRepository`] over a [`StorageBackend`].
pub struct StorageTokenRepository {
    storage: Arc<dyn StorageBackend>,
}

impl StorageTokenRepository {
    #[must_use]
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self { storage }
    }

    fn key(token_hash: &str) -> String {
        format!("{TOKEN_PREFIX}{token_hash}")
    }

    fn index_prefix(vault_id: VaultId) -> String {
        format!("{TOKEN_INDEX_PREFIX}{vault_id}/")
    }

    fn index_key(vault_id: VaultId, token_hash: &str) -> String {
        format!("{}{token_hash}", Self::index_prefix(vault_id))
    }
}

#[async_trait]
impl TokenRepository for StorageTokenRepository {
    async fn insert(&self, token: &Token) -> Result<bool, RepositoryError> {
        let key = Self::key(&token.token_hash);
        let bytes = encode("token", token)?;
        if !self.storage.compare_and_swap(&key, None, &bytes).await? {
            return Ok(false);
        }
        if let Err(e) = self
            .storage
            .put(&Self::index_key(token.vault_id, &token.token_hash), &[])
            .await
        {
            self.storage.delete(&key).await?;
            return Err(e.into());
        }
        Ok(true)
    }

    async fn find_by_hash(&self, token_hash: &str) -> Result<Option<Token>, RepositoryError> {
        self.storage
            .get(&Self::key(token_hash))
            .await?
            .map(|bytes| decode("token", &bytes))
            .transpose()
    }

    async fn save_if_revision(
        &self,
        token: &Token,
        expected_revision: u64,
    ) -> Result<bool, RepositoryError> {
        swap_if_revision(
            self.storage.as_ref(),
            "token",
            &Self::key(&token.token_hash),
            token,
            expected_revision,
            |t: &Token| t.revision,
        )
        .await
    }

    async fn delete(&self, token_hash: &str) -> Result<bool, RepositoryError> {
        let Some(token) = self.find_by_hash(token_hash).await? else {
            return Ok(false);
        };
        self.storage
            .write_batch(vec![
                BatchOp::delete(Self::key(token_hash)),
                BatchOp::delete(Self::index_key(token.vault_id, token_hash)),
            ])
            .await?;
        Ok(true)
    }

    async fn find_by_vault(&self, vault_id: VaultId) -> Result<Vec<Token>, RepositoryError> {
        let prefix = Self::index_prefix(vault_id);
        let mut tokens = Vec::new();
        for index_key in self.storage.list(&prefix).await? {
            let Some(hash) = index_key.strip_prefix(&prefix) else {
                continue;
            };
            if let Some(token) = self.find_by_hash(hash).await? {
                tokens.push(token);
            }
        }
        Ok(tokens)
    }
}

impl std::fmt::Debug for StorageTokenRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageTokenRepository").finish_non_exhaustive()
    }
}

/// [`AuditLogRepository`] over a [`StorageBackend`].
pub struct StorageAuditLogRepository {
    storage: Arc<dyn StorageBackend>,
}

impl StorageAuditLogRepository {
    #[must_use]
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self { storage }
    }

    fn key(id: AuditLogId) -> String {
        format!("{AUDIT_PREFIX}{id}")
    }

    /// Matching entries, oldest first.
    async fn matching(
        &self,
        keep: impl Fn(&AuditLog) -> bool + Send,
    ) -> Result<Vec<AuditLog>, RepositoryError> {
        let mut entries: Vec<AuditLog> = load_all(self.storage.as_ref(), "audit log", AUDIT_PREFIX)
            .await?
            .into_iter()
            .filter(|e| keep(e))
            .collect();
        entries.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.id.cmp(&b.id)));
        Ok(entries)
    }

    async fn newest(
        &self,
        limit: usize,
        keep: impl Fn(&AuditLog) -> bool + Send,
    ) -> Result<Vec<AuditLog>, RepositoryError> {
        let mut entries = self.matching(keep).await?;
        entries.reverse();
        entries.truncate(limit);
        Ok(entries)
    }
}

fn in_range(entry: &AuditLog, from: DateTime<Utc>, to: DateTime<Utc>) -> bool {
    entry.timestamp >= from && entry.timestamp < to
}

#[async_trait]
impl AuditLogRepository for StorageAuditLogRepository {
    async fn save(&self, entry: &AuditLog) -> Result<(), RepositoryError> {
        let bytes = encode("audit log", entry)?;
        self.storage.put(&Self::key(entry.id), &bytes).await?;
        Ok(())
    }

    async fn find_by_id(&self, id: AuditLogId) -> Result<Option<AuditLog>, RepositoryError> {
        self.storage
            .get(&Self::key(id))
            .await?
            .map(|bytes| decode("audit log", &bytes))
            .transpose()
    }

    async fn find_by_vault_id(
        &self,
        vault_id: VaultId,
        limit: usize,
    ) -> Result<Vec<AuditLog>, RepositoryError> {
        self.newest(limit, |e| e.vault_id == Some(vault_id)).await
    }

    async fn find_by_operation(
        &self,
        operation: OperationType,
        limit: usize,
    ) -> Result<Vec<AuditLog>, RepositoryError> {
        self.newest(limit, |e| e.operation == operation).await
    }

    async fn find_by_risk_level(
        &self,
        level: RiskLevel,
        limit: usize,
    ) -> Result<Vec<AuditLog>, RepositoryError> {
        self.newest(limit, |e| e.risk_level == level).await
    }

    async fn find_by_ip_address(
        &self,
        ip: IpAddr,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<AuditLog>, RepositoryError> {
        self.matching(|e| e.ip_address == Some(ip) && in_range(e, from, to))
            .await
    }

    async fn find_failed_operations(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<AuditLog>, RepositoryError> {
        self.matching(|e| !e.success && e.timestamp >= since).await
    }

    async fn find_pci_relevant_logs(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<AuditLog>, RepositoryError> {
        self.matching(|e| e.pci_relevant && in_range(e, from, to)).await
    }

    async fn find_high_risk_operations(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<AuditLog>, RepositoryError> {
        self.matching(|e| e.risk_level.is_high() && e.timestamp >= since)
            .await
    }

    async fn count_operations_by_type(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<BTreeMap<OperationType, u64>, RepositoryError> {
        let mut counts = BTreeMap::new();
        for entry in self.matching(|e| in_range(e, from, to)).await? {
            let count = counts.entry(entry.operation).or_insert(0u64);
            *count = count.saturating_add(1);
        }
        Ok(counts)
    }

    #[allow(clippy::cast_precision_loss)]
    async fn get_average_processing_time(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Option<f64>, RepositoryError> {
        let entries = self.matching(|e| in_range(e, from, to)).await?;
        if entries.is_empty() {
            return Ok(None);
        }
        let total = entries
            .iter()
            .fold(0u64, |sum, e| sum.saturating_add(e.duration_ms));
        Ok(Some(total as f64 / entries.len() as f64))
    }

    async fn find_old_logs_for_archival(
        &self,
        before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<AuditLog>, RepositoryError> {
        let mut entries = self
            .matching(|e| !e.is_archived() && e.timestamp < before)
            .await?;
        entries.truncate(limit);
        Ok(entries)
    }

    async fn mark_as_archived(
        &self,
        ids: &[AuditLogId],
        location: &str,
        archived_at: DateTime<Utc>,
    ) -> Result<usize, RepositoryError> {
        let mut marked = 0usize;
        for id in ids {
            let key = Self::key(*id);
            let Some(current_bytes) = self.storage.get(&key).await? else {
                continue;
            };
            let mut entry: AuditLog = decode("audit log", &current_bytes)?;
            if entry.is_archived() {
                continue;
            }
            entry.archive = ArchiveState::Archived {
                location: location.to_owned(),
                archived_at,
            };
            let next = encode("audit log", &entry)?;
            if self
                .storage
                .compare_and_swap(&key, Some(&current_bytes), &next)
                .await?
            {
                marked = marked.saturating_add(1);
            }
        }
        Ok(marked)
    }

    async fn delete_archived_logs(&self, before: DateTime<Utc>) -> Result<usize, RepositoryError> {
        let doomed = self
            .matching(|e| e.is_archived() && e.timestamp < before)
            .await?;
        if doomed.is_empty() {
            return Ok(0);
        }
        let count = doomed.len();
        self.storage
            .write_batch(doomed.iter().map(|e| BatchOp::delete(Self::key(e.id))).collect())
            .await?;
        Ok(count)
    }
}

impl std::fmt::Debug for StorageAuditLogRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageAuditLogRepository").finish_non_exhaustive()
    }
}
