//! Core settings.
//!
//! Built once at process start (see `tokenvault-server`'s `ServerConfig`)
//! and shared read-only afterwards.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::SettingsError;
use crate::token::TokenFormat;

/// Vault-wide defaults.
#[derive(Debug, Clone)]
pub struct VaultSettings {
    /// Days between scheduled key rotations for new vaults.
    pub key_rotation_interval_days: u32,
    /// Token limit applied when a create request does not set one.
    pub default_token_limit: u64,
}

impl Default for VaultSettings {
    fn default() -> Self {
        Self {
            key_rotation_interval_days: 90,
            default_token_limit: 1_000_000,
        }
    }
}

/// Tokenization behaviour.
#[derive(Debug, Clone)]
pub struct TokenizationSettings {
    pub token_format: TokenFormat,
    /// Tokens expire this long after issue. `None` means never.
    pub token_ttl: Option<Duration>,
    /// Attempts to find an unused token value before giving up.
    pub max_generation_attempts: u8,
    /// Default bound on each repository call.
    pub repository_timeout: Duration,
    /// Detokenizes of one token inside the window above which access is high risk.
    pub detokenize_burst_threshold: u32,
    pub detokenize_burst_window: Duration,
}

impl Default for TokenizationSettings {
    fn default() -> Self {
        Self {
            token_format: TokenFormat::Random,
            token_ttl: None,
            max_generation_attempts: 5,
            repository_timeout: Duration::from_secs(5),
            detokenize_burst_threshold: 10,
            detokenize_burst_window: Duration::from_secs(60),
        }
    }
}

/// Audit retention and archival.
#[derive(Debug, Clone)]
pub struct AuditSettings {
    /// Live entries older than this are archived.
    pub archive_after_days: u32,
    /// Archived entries older than this are deleted.
    pub purge_after_days: u32,
    /// Directory receiving JSON-lines archive files.
    pub archive_dir: PathBuf,
    /// Entries per archive file.
    pub batch_size: usize,
    /// Optional JSON-lines mirror of every entry as it is written.
    pub mirror_file: Option<PathBuf>,
}

impl Default for AuditSettings {
    fn default() -> Self {
        Self {
            archive_after_days: 365,
            purge_after_days: 2555,
            archive_dir: PathBuf::from("./audit-archive"),
            batch_size: 1000,
            mirror_file: None,
        }
    }
}

/// All settings consumed by the core services.
#[derive(Debug, Clone, Default)]
pub struct CoreSettings {
    pub vault: VaultSettings,
    pub tokenization: TokenizationSettings,
    pub audit: AuditSettings,
}

impl CoreSettings {
    /// Reject settings the services cannot run with.
    ///
    /// # Errors
    ///
    /// Returns [`SettingsError::Invalid`] naming the first offending field.
    pub fn validate(&self) -> Result<(), SettingsError> {
        let invalid = |field: &'static str, reason: &str| {
            Err(SettingsError::Invalid {
                field,
                reason: reason.to_owned(),
            })
        };

        if self.vault.key_rotation_interval_days == 0 {
            return invalid("vault.key_rotation_interval_days", "must be at least 1");
        }
        if self.vault.default_token_limit == 0 {
            return invalid("vault.default_token_limit", "must be at least 1");
        }
        if let TokenFormat::FormatPreserving { keep_last } = self.tokenization.token_format {
            if keep_last > 8 {
                return invalid("tokenization.token_format", "keep_last may be at most 8");
            }
        }
        if self.tokenization.max_generation_attempts == 0 {
            return invalid("tokenization.max_generation_attempts", "must be at least 1");
        }
        if self.tokenization.repository_timeout.is_zero() {
            return invalid("tokenization.repository_timeout", "must be non-zero");
        }
        if self.tokenization.token_ttl.is_some_and(|ttl| ttl.is_zero()) {
            return invalid("tokenization.token_ttl", "must be non-zero when set");
        }
        if self.tokenization.detokenize_burst_threshold == 0 {
            return invalid("tokenization.detokenize_burst_threshold", "must be at least 1");
        }
        if self.tokenization.detokenize_burst_window.is_zero() {
            return invalid("tokenization.detokenize_burst_window", "must be non-zero");
        }
        if self.audit.archive_after_days == 0 {
            return invalid("audit.archive_after_days", "must be at least 1");
        }
        if self.audit.purge_after_days <= self.audit.archive_after_days {
            return invalid(
                "audit.purge_after_days",
                "must be longer than audit.archive_after_days",
            );
        }
        if self.audit.batch_size == 0 {
            return invalid("audit.batch_size", "must be at least 1");
        }
        Ok(())
    }
}
