//! Shared application state for the `TokenVault` daemon.
//!
//! A single [`AppState`] is constructed at startup and shared with the
//! background workers via `Arc`. Construction goes leaves first: storage,
//! barrier, keyrings and encryption, repositories, audit, then the vault and
//! tokenization services.

use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};

use tokenvault_core::audit::{AUDIT_HMAC_INFO, AuditLogService, AuditLogger};
use tokenvault_core::audit_file::FileAuditSink;
use tokenvault_core::barrier::Barrier;
use tokenvault_core::crypto::EncryptionKey;
use tokenvault_core::encryption::envelope_service;
use tokenvault_core::repository::{
    AuditLogRepository, StorageAuditLogRepository, StorageTokenRepository,
    StorageVaultRepository, TokenRepository,
};
use tokenvault_core::risk::DefaultRiskPolicy;
use tokenvault_core::settings::CoreSettings;
use tokenvault_core::token::DefaultTokenGenerator;
use tokenvault_core::tokenization::TokenizationService;
use tokenvault_core::vault::VaultService;
use tokenvault_storage::{MemoryBackend, StorageBackend};

use crate::config::{ServerConfig, StorageBackendType};

/// Services shared by the daemon's workers.
pub struct AppState {
    /// The key barrier; holds the master key.
    pub barrier: Arc<Barrier>,
    /// Vault lifecycle and key rotation.
    pub vaults: Arc<VaultService>,
    /// Tokenize, detokenize and token lifecycle.
    pub tokens: Arc<TokenizationService>,
    /// Audit queries and retention.
    pub audit: Arc<AuditLogService>,
}

impl AppState {
    /// Validate settings, open storage, load the master key and wire the
    /// services.
    ///
    /// # Errors
    ///
    /// Fails on invalid settings, an unopenable backend, or a missing or
    /// malformed master key for persistent storage.
    pub async fn build(config: &ServerConfig) -> anyhow::Result<Self> {
        config.core.validate().context("invalid core settings")?;
        let storage = open_storage(&config.storage_backend)?;
        let master_key = load_master_key(config)?;
        Self::assemble(storage, master_key, &config.core).await
    }

    /// Wire the services over an already opened backend.
    ///
    /// # Errors
    ///
    /// Fails if the audit HMAC key cannot be derived.
    pub async fn assemble(
        storage: Arc<dyn StorageBackend>,
        master_key: EncryptionKey,
        settings: &CoreSettings,
    ) -> anyhow::Result<Self> {
        let timeout = settings.tokenization.repository_timeout;
        let barrier = Arc::new(Barrier::unsealed(Arc::clone(&storage), master_key));
        let hmac_key = barrier
            .derive_key(AUDIT_HMAC_INFO)
            .await
            .context("failed to derive audit HMAC key")?;

        let audit_repo: Arc<dyn AuditLogRepository> =
            Arc::new(StorageAuditLogRepository::new(Arc::clone(&storage)));
        let mut logger = AuditLogger::new(
            Arc::clone(&audit_repo),
            Arc::new(DefaultRiskPolicy::new(
                settings.tokenization.detokenize_burst_threshold,
            )),
            hmac_key,
            timeout,
        );
        if let Some(ref path) = settings.audit.mirror_file {
            logger = logger.with_sink(Arc::new(FileAuditSink::new(path)));
            info!(path = %path.display(), "file audit mirror registered");
        }
        let logger = Arc::new(logger);

        let encryption = envelope_service(Arc::clone(&barrier));
        let tokens_repo: Arc<dyn TokenRepository> =
            Arc::new(StorageTokenRepository::new(Arc::clone(&storage)));
        let vaults = Arc::new(VaultService::new(
            Arc::new(StorageVaultRepository::new(storage)),
            Arc::clone(&tokens_repo),
            Arc::clone(&encryption),
            Arc::clone(&logger),
            settings.vault.clone(),
            timeout,
        ));
        let tokens = Arc::new(TokenizationService::new(
            Arc::clone(&vaults),
            tokens_repo,
            encryption,
            logger,
            Arc::new(DefaultTokenGenerator::new(settings.tokenization.token_format)),
            settings.tokenization.clone(),
        ));
        let audit = Arc::new(AuditLogService::new(audit_repo, settings.audit.clone(), timeout));

        Ok(Self {
            barrier,
            vaults,
            tokens,
            audit,
        })
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState").finish_non_exhaustive()
    }
}

fn open_storage(backend: &StorageBackendType) -> anyhow::Result<Arc<dyn StorageBackend>> {
    let storage: Arc<dyn StorageBackend> = match backend {
        StorageBackendType::Memory => {
            info!("using in-memory storage (data will not persist)");
            Arc::new(MemoryBackend::new())
        }
        #[cfg(feature = "rocksdb-backend")]
        StorageBackendType::RocksDb { path } => {
            info!(path = %path, "using RocksDB storage");
            Arc::new(
                tokenvault_storage::RocksDbBackend::open(path)
                    .context("failed to open RocksDB storage")?,
            )
        }
        #[cfg(not(feature = "rocksdb-backend"))]
        StorageBackendType::RocksDb { .. } => {
            anyhow::bail!("RocksDB backend requested but feature 'rocksdb-backend' is not enabled");
        }
        #[cfg(feature = "redb-backend")]
        StorageBackendType::Redb { path } => {
            info!(path = %path, "using redb storage");
            Arc::new(
                tokenvault_storage::RedbBackend::open(path).context("failed to open redb storage")?,
            )
        }
        #[cfg(not(feature = "redb-backend"))]
        StorageBackendType::Redb { .. } => {
            anyhow::bail!("redb backend requested but feature 'redb-backend' is not enabled");
        }
    };
    Ok(storage)
}

/// Persistent storage needs the operator's key; in-memory storage gets a
/// throwaway one.
fn load_master_key(config: &ServerConfig) -> anyhow::Result<EncryptionKey> {
    match config.master_key.as_deref() {
        Some(hex) => EncryptionKey::from_hex(hex.trim())
            .context("TOKENVAULT_MASTER_KEY must be 64 hex characters"),
        None if config.storage_backend.is_persistent() => {
            anyhow::bail!("TOKENVAULT_MASTER_KEY is required for persistent storage")
        }
        None => {
            warn!("no master key configured, using an ephemeral key for in-memory storage");
            Ok(EncryptionKey::generate())
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::collections::HashMap;

    use tokenvault_core::context::RequestContext;
    use tokenvault_core::vault::{DataType, NewVault};

    use super::*;

    fn config(vars: &[(&str, &str)]) -> ServerConfig {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        ServerConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[tokio::test]
    async fn memory_state_round_trips_a_token() {
        let state = AppState::build(&config(&[])).await.unwrap();
        let ctx = RequestContext::new().with_actor("test");
        let vault = state
            .vaults
            .create(
                NewVault {
                    name: "cards".to_owned(),
                    data_type: DataType::CardNumber,
                    token_limit: None,
                    key_rotation_interval_days: None,
                },
                &ctx,
            )
            .await
            .unwrap();

        let issued = state.tokens.tokenize(vault.id, b"4111111111111111", &ctx).await.unwrap();
        let plaintext = state.tokens.detokenize(&issued.token, &ctx).await.unwrap();
        assert_eq!(plaintext.as_slice(), b"4111111111111111");
        assert_eq!(state.audit.find_by_vault(vault.id, 10).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn persistent_storage_requires_master_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db").display().to_string();
        let result = AppState::build(&config(&[
            ("TOKENVAULT_STORAGE", "rocksdb"),
            ("TOKENVAULT_STORAGE_PATH", &path),
        ]))
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn malformed_master_key_is_rejected() {
        let result = AppState::build(&config(&[("TOKENVAULT_MASTER_KEY", "not-hex")])).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn invalid_settings_are_rejected() {
        let result = AppState::build(&config(&[
            ("TOKENVAULT_AUDIT_ARCHIVE_AFTER_DAYS", "30"),
            ("TOKENVAULT_AUDIT_PURGE_AFTER_DAYS", "10"),
        ]))
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn mirror_file_receives_entries() {
        let dir = tempfile::tempdir().unwrap();
        let mirror = dir.path().join("audit.jsonl");
        let mirror_str = mirror.display().to_string();
        let state = AppState::build(&config(&[("TOKENVAULT_AUDIT_FILE", &mirror_str)]))
            .await
            .unwrap();
        state
            .vaults
            .create(
                NewVault {
                    name: "emails".to_owned(),
                    data_type: DataType::Email,
                    token_limit: None,
                    key_rotation_interval_days: None,
                },
                &RequestContext::new(),
            )
            .await
            .unwrap();

        let contents = std::fs::read_to_string(&mirror).unwrap();
        assert_eq!(contents.lines().count(), 1);
    }
}
