//! Server configuration for `TokenVault`.
//!
//! Loads configuration from environment variables with sensible defaults.
//! All settings can be overridden via `TOKENVAULT_*` environment variables.
//! Unparseable values fall back to the default; the assembled core settings
//! are validated once at startup.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tokenvault_core::settings::{AuditSettings, CoreSettings, TokenizationSettings, VaultSettings};
use tokenvault_core::token::TokenFormat;

/// Server configuration.
#[derive(Clone)]
pub struct ServerConfig {
    /// Storage backend type.
    pub storage_backend: StorageBackendType,
    /// Log level filter (e.g., `info`, `debug`, `warn`).
    pub log_level: String,
    /// Hex-encoded 256-bit master key. Required for persistent storage.
    pub master_key: Option<String>,
    /// Whether to skip `mlock` (for development without root/`CAP_IPC_LOCK`).
    pub disable_mlock: bool,
    /// Seconds between key-rotation sweeps.
    pub rotation_sweep_interval_secs: u64,
    /// Seconds between audit retention passes.
    pub retention_interval_secs: u64,
    /// Settings handed to the core services.
    pub core: CoreSettings,
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("storage_backend", &self.storage_backend)
            .field("log_level", &self.log_level)
            .field("master_key", &self.master_key.as_ref().map(|_| "[REDACTED]"))
            .field("disable_mlock", &self.disable_mlock)
            .field("rotation_sweep_interval_secs", &self.rotation_sweep_interval_secs)
            .field("retention_interval_secs", &self.retention_interval_secs)
            .field("core", &self.core)
            .finish()
    }
}

/// Supported storage backend types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageBackendType {
    /// In-memory (development only, data lost on restart).
    Memory,
    /// `RocksDB` persistent storage.
    RocksDb { path: String },
    /// Redb persistent storage.
    Redb { path: String },
}

impl StorageBackendType {
    #[must_use]
    pub fn is_persistent(&self) -> bool {
        !matches!(self, Self::Memory)
    }
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    lookup(key).and_then(|v| v.trim().parse().ok())
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `TOKENVAULT_STORAGE`: `memory`, `rocksdb`, or `redb` (default: `memory`)
    /// - `TOKENVAULT_STORAGE_PATH`: path for persistent backends (default: `./data`)
    /// - `TOKENVAULT_LOG_LEVEL`: log filter (default: `info`)
    /// - `TOKENVAULT_MASTER_KEY`: hex master key (64 hex chars)
    /// - `TOKENVAULT_DISABLE_MLOCK`: skip `mlockall` for dev environments (default: `false`)
    /// - `TOKENVAULT_ROTATION_SWEEP_INTERVAL`: seconds between rotation sweeps (default: `3600`)
    /// - `TOKENVAULT_RETENTION_INTERVAL`: seconds between retention passes (default: `86400`)
    /// - `TOKENVAULT_KEY_ROTATION_DAYS`: rotation interval for new vaults (default: `90`)
    /// - `TOKENVAULT_DEFAULT_TOKEN_LIMIT`: token limit for new vaults (default: `1000000`)
    /// - `TOKENVAULT_TOKEN_FORMAT`: `random`, `format_preserving` or
    ///   `format_preserving:<n>` (default: `random`)
    /// - `TOKENVAULT_TOKEN_TTL_SECS`: token lifetime, `0` or unset for none
    /// - `TOKENVAULT_TOKEN_GENERATION_ATTEMPTS`: collision retries (default: `5`)
    /// - `TOKENVAULT_REPOSITORY_TIMEOUT_MS`: default repository bound (default: `5000`)
    /// - `TOKENVAULT_DETOKENIZE_BURST_THRESHOLD`: detokenizes per window (default: `10`)
    /// - `TOKENVAULT_DETOKENIZE_BURST_WINDOW_SECS`: burst window (default: `60`)
    /// - `TOKENVAULT_AUDIT_ARCHIVE_AFTER_DAYS`: (default: `365`)
    /// - `TOKENVAULT_AUDIT_PURGE_AFTER_DAYS`: (default: `2555`)
    /// - `TOKENVAULT_AUDIT_ARCHIVE_DIR`: (default: `./audit-archive`)
    /// - `TOKENVAULT_AUDIT_BATCH_SIZE`: entries per archive file (default: `1000`)
    /// - `TOKENVAULT_AUDIT_FILE`: JSON-lines mirror of every entry (optional)
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env), reading from `lookup`.
    #[must_use]
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let flag = |key: &str| lookup(key).is_some_and(|v| v == "true" || v == "1");

        let storage_path = lookup("TOKENVAULT_STORAGE_PATH").unwrap_or_else(|| "./data".to_owned());
        let storage_backend = match lookup("TOKENVAULT_STORAGE")
            .unwrap_or_else(|| "memory".to_owned())
            .to_lowercase()
            .as_str()
        {
            "rocksdb" => StorageBackendType::RocksDb { path: storage_path },
            "redb" => StorageBackendType::Redb { path: storage_path },
            _ => StorageBackendType::Memory,
        };

        let vault_defaults = VaultSettings::default();
        let vault = VaultSettings {
            key_rotation_interval_days: parsed(&lookup, "TOKENVAULT_KEY_ROTATION_DAYS")
                .unwrap_or(vault_defaults.key_rotation_interval_days),
            default_token_limit: parsed(&lookup, "TOKENVAULT_DEFAULT_TOKEN_LIMIT")
                .unwrap_or(vault_defaults.default_token_limit),
        };

        let token_defaults = TokenizationSettings::default();
        let tokenization = TokenizationSettings {
            token_format: lookup("TOKENVAULT_TOKEN_FORMAT")
                .and_then(|v| TokenFormat::parse(v.trim()))
                .unwrap_or(token_defaults.token_format),
            token_ttl: parsed(&lookup, "TOKENVAULT_TOKEN_TTL_SECS")
                .filter(|secs: &u64| *secs > 0)
                .map(Duration::from_secs),
            max_generation_attempts: parsed(&lookup, "TOKENVAULT_TOKEN_GENERATION_ATTEMPTS")
                .unwrap_or(token_defaults.max_generation_attempts),
            repository_timeout: parsed(&lookup, "TOKENVAULT_REPOSITORY_TIMEOUT_MS")
                .map_or(token_defaults.repository_timeout, Duration::from_millis),
            detokenize_burst_threshold: parsed(&lookup, "TOKENVAULT_DETOKENIZE_BURST_THRESHOLD")
                .unwrap_or(token_defaults.detokenize_burst_threshold),
            detokenize_burst_window: parsed(&lookup, "TOKENVAULT_DETOKENIZE_BURST_WINDOW_SECS")
                .map_or(token_defaults.detokenize_burst_window, Duration::from_secs),
        };

        let audit_defaults = AuditSettings::default();
        let audit = AuditSettings {
            archive_after_days: parsed(&lookup, "TOKENVAULT_AUDIT_ARCHIVE_AFTER_DAYS")
                .unwrap_or(audit_defaults.archive_after_days),
            purge_after_days: parsed(&lookup, "TOKENVAULT_AUDIT_PURGE_AFTER_DAYS")
                .unwrap_or(audit_defaults.purge_after_days),
            archive_dir: lookup("TOKENVAULT_AUDIT_ARCHIVE_DIR")
                .map_or(audit_defaults.archive_dir, PathBuf::from),
            batch_size: parsed(&lookup, "TOKENVAULT_AUDIT_BATCH_SIZE").unwrap_or(audit_defaults.batch_size),
            mirror_file: lookup("TOKENVAULT_AUDIT_FILE").map(PathBuf::from),
        };

        Self {
            storage_backend,
            log_level: lookup("TOKENVAULT_LOG_LEVEL").unwrap_or_else(|| "info".to_owned()),
            master_key: lookup("TOKENVAULT_MASTER_KEY").filter(|k| !k.trim().is_empty()),
            disable_mlock: flag("TOKENVAULT_DISABLE_MLOCK"),
            rotation_sweep_interval_secs: parsed(&lookup, "TOKENVAULT_ROTATION_SWEEP_INTERVAL")
                .filter(|secs: &u64| *secs > 0)
                .unwrap_or(3600),
            retention_interval_secs: parsed(&lookup, "TOKENVAULT_RETENTION_INTERVAL")
                .filter(|secs: &u64| *secs > 0)
                .unwrap_or(86_400),
            core: CoreSettings {
                vault,
                tokenization,
                audit,
            },
        }
    }
}
