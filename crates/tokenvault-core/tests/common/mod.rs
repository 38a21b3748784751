#![allow(clippy::unwrap_used, dead_code)]

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokenvault_core::audit::{AUDIT_HMAC_INFO, AuditLog, AuditLogService, AuditLogger, OperationType};
use tokenvault_core::barrier::Barrier;
use tokenvault_core::context::RequestContext;
use tokenvault_core::crypto::EncryptionKey;
use tokenvault_core::encryption::{EncryptionService, envelope_service};
use tokenvault_core::error::RepositoryError;
use tokenvault_core::id::{AuditLogId, VaultId};
use tokenvault_core::repository::{
    AuditLogRepository, Page, StorageAuditLogRepository, StorageTokenRepository,
    StorageVaultRepository, TokenRepository, VaultRepository,
};
use tokenvault_core::risk::{DefaultRiskPolicy, RiskLevel};
use tokenvault_core::settings::{AuditSettings, TokenizationSettings, VaultSettings};
use tokenvault_core::token::DefaultTokenGenerator;
use tokenvault_core::tokenization::TokenizationService;
use tokenvault_core::vault::{
    DataType, GlobalVaultStatistics, NewVault, Vault, VaultService, VaultStatus,
};
use tokenvault_storage::{MemoryBackend, StorageBackend};

/// Audit repository that can be switched into failing every write.
pub struct FlakyAuditRepository {
    inner: StorageAuditLogRepository,
    failing: AtomicBool,
}

impl FlakyAuditRepository {
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self {
            inner: StorageAuditLogRepository::new(storage),
            failing: AtomicBool::new(false),
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl AuditLogRepository for FlakyAuditRepository {
    async fn save(&self, entry: &AuditLog) -> Result<(), RepositoryError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(RepositoryError::Timeout {
                operation: "audit.save",
                timeout_ms: 0,
            });
        }
        self.inner.save(entry).await
    }

    async fn find_by_id(&self, id: AuditLogId) -> Result<Option<AuditLog>, RepositoryError> {
        self.inner.find_by_id(id).await
    }

    async fn find_by_vault_id(
        &self,
        vault_id: VaultId,
        limit: usize,
    ) -> Result<Vec<AuditLog>, RepositoryError> {
        self.inner.find_by_vault_id(vault_id, limit).await
    }

    async fn find_by_operation(
        &self,
        operation: OperationType,
        limit: usize,
    ) -> Result<Vec<AuditLog>, RepositoryError> {
        self.inner.find_by_operation(operation, limit).await
    }

    async fn find_by_risk_level(
        &self,
        level: RiskLevel,
        limit: usize,
    ) -> Result<Vec<AuditLog>, RepositoryError> {
        self.inner.find_by_risk_level(level, limit).await
    }

    async fn find_by_ip_address(
        &self,
        ip: IpAddr,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<AuditLog>, RepositoryError> {
        self.inner.find_by_ip_address(ip, from, to).await
    }

    async fn find_failed_operations(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<AuditLog>, RepositoryError> {
        self.inner.find_failed_operations(since).await
    }

    async fn find_pci_relevant_logs(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<AuditLog>, RepositoryError> {
        self.inner.find_pci_relevant_logs(from, to).await
    }

    async fn find_high_risk_operations(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<AuditLog>, RepositoryError> {
        self.inner.find_high_risk_operations(since).await
    }

    async fn count_operations_by_type(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<BTreeMap<OperationType, u64>, RepositoryError> {
        self.inner.count_operations_by_type(from, to).await
    }

    async fn get_average_processing_time(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Option<f64>, RepositoryError> {
        self.inner.get_average_processing_time(from, to).await
    }

    async fn find_old_logs_for_archival(
        &self,
        before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<AuditLog>, RepositoryError> {
        self.inner.find_old_logs_for_archival(before, limit).await
    }

    async fn mark_as_archived(
        &self,
        ids: &[AuditLogId],
        location: &str,
        archived_at: DateTime<Utc>,
    ) -> Result<usize, RepositoryError> {
        self.inner.mark_as_archived(ids, location, archived_at).await
    }

    async fn delete_archived_logs(&self, before: DateTime<Utc>) -> Result<usize, RepositoryError> {
        self.inner.delete_archived_logs(before).await
    }
}

/// Vault repository that can fail lookups, or retire a vault from under the
/// next conditional save as a concurrent writer would.
pub struct ScriptedVaultRepository {
    inner: StorageVaultRepository,
    retire_before_save: AtomicBool,
    failing_lookups: AtomicBool,
}

impl ScriptedVaultRepository {
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self {
            inner: StorageVaultRepository::new(storage),
            retire_before_save: AtomicBool::new(false),
            failing_lookups: AtomicBool::new(false),
        }
    }

    pub fn set_failing_lookups(&self, failing: bool) {
        self.failing_lookups.store(failing, Ordering::SeqCst);
    }

    pub fn retire_before_next_save(&self) {
        self.retire_before_save.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl VaultRepository for ScriptedVaultRepository {
    async fn find_by_id(&self, id: VaultId) -> Result<Option<Vault>, RepositoryError> {
        if self.failing_lookups.load(Ordering::SeqCst) {
            return Err(RepositoryError::Timeout {
                operation: "vault.find_by_id",
                timeout_ms: 0,
            });
        }
        self.inner.find_by_id(id).await
    }

    async fn find_by_name(&self, name: &str) -> Result<Option<Vault>, RepositoryError> {
        self.inner.find_by_name(name).await
    }

    async fn find_by_data_type(&self, data_type: DataType) -> Result<Vec<Vault>, RepositoryError> {
        self.inner.find_by_data_type(data_type).await
    }

    async fn find_by_status(&self, status: VaultStatus) -> Result<Vec<Vault>, RepositoryError> {
        self.inner.find_by_status(status).await
    }

    async fn find_vaults_needing_key_rotation(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<Vault>, RepositoryError> {
        self.inner.find_vaults_needing_key_rotation(now).await
    }

    async fn insert(&self, vault: &Vault) -> Result<bool, RepositoryError> {
        self.inner.insert(vault).await
    }

    async fn save(&self, vault: &Vault) -> Result<(), RepositoryError> {
        self.inner.save(vault).await
    }

    async fn save_if_revision(
        &self,
        vault: &Vault,
        expected_revision: u64,
    ) -> Result<bool, RepositoryError> {
        if self.retire_before_save.swap(false, Ordering::SeqCst) {
            if let Some(mut stored) = self.inner.find_by_id(vault.id).await? {
                let revision = stored.revision;
                stored.status = VaultStatus::Retired;
                stored.deleted_at = Some(Utc::now());
                stored.revision = revision + 1;
                assert!(self.inner.save_if_revision(&stored, revision).await?);
            }
        }
        self.inner.save_if_revision(vault, expected_revision).await
    }

    async fn delete(&self, id: VaultId) -> Result<bool, RepositoryError> {
        self.inner.delete(id).await
    }

    async fn paginate(&self, page: u32, per_page: u32) -> Result<Page<Vault>, RepositoryError> {
        self.inner.paginate(page, per_page).await
    }

    async fn get_statistics(
        &self,
        now: DateTime<Utc>,
    ) -> Result<GlobalVaultStatistics, RepositoryError> {
        self.inner.get_statistics(now).await
    }

    async fn get_total_token_count(&self) -> Result<u64, RepositoryError> {
        self.inner.get_total_token_count().await
    }

    async fn exists(&self, id: VaultId) -> Result<bool, RepositoryError> {
        self.inner.exists(id).await
    }
}

pub struct Harness {
    pub vault_repo: Arc<ScriptedVaultRepository>,
    pub audit_repo: Arc<FlakyAuditRepository>,
    pub token_repo: Arc<dyn TokenRepository>,
    pub encryption: Arc<dyn EncryptionService>,
    pub vaults: Arc<VaultService>,
    pub tokens: Arc<TokenizationService>,
    pub logs: AuditLogService,
    pub hmac_key: EncryptionKey,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_settings(TokenizationSettings::default(), AuditSettings::default()).await
    }

    pub async fn with_settings(tokenization: TokenizationSettings, audit: AuditSettings) -> Self {
        let storage: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
        let barrier = Arc::new(Barrier::unsealed(
            Arc::clone(&storage),
            EncryptionKey::generate(),
        ));
        let hmac_key = barrier.derive_key(AUDIT_HMAC_INFO).await.unwrap();
        let timeout = Duration::from_secs(5);

        let audit_repo = Arc::new(FlakyAuditRepository::new(Arc::clone(&storage)));
        let logger = Arc::new(AuditLogger::new(
            Arc::clone(&audit_repo) as Arc<dyn AuditLogRepository>,
            Arc::new(DefaultRiskPolicy::new(tokenization.detokenize_burst_threshold)),
            barrier.derive_key(AUDIT_HMAC_INFO).await.unwrap(),
            timeout,
        ));
        let encryption = envelope_service(Arc::clone(&barrier));
        let token_repo: Arc<dyn TokenRepository> =
            Arc::new(StorageTokenRepository::new(Arc::clone(&storage)));
        let vault_repo = Arc::new(ScriptedVaultRepository::new(Arc::clone(&storage)));
        let vaults = Arc::new(VaultService::new(
            Arc::clone(&vault_repo) as Arc<dyn VaultRepository>,
            Arc::clone(&token_repo),
            Arc::clone(&encryption),
            Arc::clone(&logger),
            VaultSettings::default(),
            timeout,
        ));
        let tokens = Arc::new(TokenizationService::new(
            Arc::clone(&vaults),
            Arc::clone(&token_repo),
            Arc::clone(&encryption),
            logger,
            Arc::new(DefaultTokenGenerator::new(tokenization.token_format)),
            tokenization,
        ));
        let logs = AuditLogService::new(
            Arc::clone(&audit_repo) as Arc<dyn AuditLogRepository>,
            audit,
            timeout,
        );

        Self {
            vault_repo,
            audit_repo,
            token_repo,
            encryption,
            vaults,
            tokens,
            logs,
            hmac_key,
        }
    }

    pub async fn vault(&self, name: &str, data_type: DataType, limit: Option<u64>) -> Vault {
        self.vaults
            .create(
                NewVault {
                    name: name.to_owned(),
                    data_type,
                    token_limit: limit,
                    key_rotation_interval_days: None,
                },
                &ctx(),
            )
            .await
            .unwrap()
    }

    /// Every stored audit entry for `operation`, newest first.
    pub async fn entries(&self, operation: OperationType) -> Vec<AuditLog> {
        self.logs.find_by_operation(operation, usize::MAX).await.unwrap()
    }
}

pub fn ctx() -> RequestContext {
    RequestContext::new()
        .with_ip("10.0.0.7".parse().unwrap())
        .with_actor("payments-api")
}
