//! Error types for `tokenvault-core`.
//!
//! One `thiserror` enum per domain. Every enum implements [`DomainError`],
//! which exposes a stable [`ErrorCode`] and a structured [`ErrorContext`]
//! so callers can match on the kind of failure and audit entries can record
//! the same code the caller saw.
//!
//! Messages and context carry identifiers only (vault ids, token references,
//! key versions). Plaintext and key material never appear here.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use tokenvault_storage::StorageError;

use crate::id::{AuditLogId, VaultId};
use crate::token::TokenStatus;
use crate::vault::VaultStatus;

/// Structured, non-sensitive error context.
pub type ErrorContext = BTreeMap<&'static str, String>;

/// Stable machine-readable error code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidArgument,
    VaultNotFound,
    VaultAlreadyExists,
    VaultNotActive,
    VaultTokenLimitExceeded,
    InvalidStatusTransition,
    TokenNotFound,
    TokenNotActive,
    TokenNotUsable,
    TokenCannotBeRevoked,
    TokenGenerationFailed,
    AuditLogNotFound,
    AuditWriteFailed,
    AuditArchiveFailed,
    EncryptionFailed,
    RepositoryUnavailable,
    RepositoryTimeout,
    RepositoryConflict,
    InvalidConfiguration,
}

impl ErrorCode {
    /// The wire form of the code, e.g. `VAULT_NOT_FOUND`.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InvalidArgument => "INVALID_ARGUMENT",
            Self::VaultNotFound => "VAULT_NOT_FOUND",
            Self::VaultAlreadyExists => "VAULT_ALREADY_EXISTS",
            Self::VaultNotActive => "VAULT_NOT_ACTIVE",
            Self::VaultTokenLimitExceeded => "VAULT_TOKEN_LIMIT_EXCEEDED",
            Self::InvalidStatusTransition => "INVALID_STATUS_TRANSITION",
            Self::TokenNotFound => "TOKEN_NOT_FOUND",
            Self::TokenNotActive => "TOKEN_NOT_ACTIVE",
            Self::TokenNotUsable => "TOKEN_NOT_USABLE",
            Self::TokenCannotBeRevoked => "TOKEN_CANNOT_BE_REVOKED",
            Self::TokenGenerationFailed => "TOKEN_GENERATION_FAILED",
            Self::AuditLogNotFound => "AUDIT_LOG_NOT_FOUND",
            Self::AuditWriteFailed => "AUDIT_WRITE_FAILED",
            Self::AuditArchiveFailed => "AUDIT_ARCHIVE_FAILED",
            Self::EncryptionFailed => "ENCRYPTION_FAILED",
            Self::RepositoryUnavailable => "REPOSITORY_UNAVAILABLE",
            Self::RepositoryTimeout => "REPOSITORY_TIMEOUT",
            Self::RepositoryConflict => "REPOSITORY_CONFLICT",
            Self::InvalidConfiguration => "INVALID_CONFIGURATION",
        }
    }

    /// Whether the caller can act on this error (not-found and
    /// state-conflict kinds) as opposed to an infrastructure failure.
    #[must_use]
    pub const fn is_caller_recoverable(self) -> bool {
        !matches!(
            self,
            Self::AuditWriteFailed
                | Self::AuditArchiveFailed
                | Self::EncryptionFailed
                | Self::RepositoryUnavailable
                | Self::RepositoryTimeout
                | Self::RepositoryConflict
                | Self::InvalidConfiguration
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Common surface of every domain error.
pub trait DomainError: std::error::Error {
    /// The stable code for this error.
    fn code(&self) -> ErrorCode;

    /// Identifiers describing where the error happened.
    fn context(&self) -> ErrorContext {
        ErrorContext::new()
    }
}

fn ctx<const N: usize>(pairs: [(&'static str, String); N]) -> ErrorContext {
    pairs.into_iter().collect()
}

/// Errors from cryptographic primitives.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// AES-256-GCM encryption failed.
    #[error("encryption failed: {reason}")]
    Encryption { reason: String },

    /// AES-256-GCM decryption failed (wrong key, wrong AAD, corrupted or
    /// tampered ciphertext).
    #[error("decryption failed: {reason}")]
    Decryption { reason: String },

    /// HKDF key derivation failed.
    #[error("key derivation failed for context '{context}': {reason}")]
    KeyDerivation { context: String, reason: String },

    /// Ciphertext is too short to contain a valid nonce + tag.
    #[error("ciphertext too short: expected at least {expected} bytes, got {actual}")]
    CiphertextTooShort { expected: usize, actual: usize },

    /// Key bytes had the wrong length.
    #[error("invalid key length: expected {expected} bytes, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },
}

impl DomainError for CryptoError {
    fn code(&self) -> ErrorCode {
        ErrorCode::EncryptionFailed
    }
}

/// Errors from the key barrier.
#[derive(Debug, thiserror::Error)]
pub enum BarrierError {
    /// The barrier is sealed; no key material can be read or written.
    #[error("key barrier is sealed")]
    Sealed,

    /// A cryptographic operation within the barrier failed.
    #[error("barrier crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// The underlying storage backend returned an error.
    #[error("barrier storage error: {0}")]
    Storage(#[from] StorageError),
}

impl DomainError for BarrierError {
    fn code(&self) -> ErrorCode {
        match self {
            Self::Sealed | Self::Crypto(_) => ErrorCode::EncryptionFailed,
            Self::Storage(_) => ErrorCode::RepositoryUnavailable,
        }
    }
}

/// Errors constructing identity values.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdError {
    /// The string is not a hyphenated UUID.
    #[error("invalid {kind}: '{value}' is not a hyphenated UUID")]
    Invalid { kind: &'static str, value: String },
}

impl DomainError for IdError {
    fn code(&self) -> ErrorCode {
        ErrorCode::InvalidArgument
    }

    fn context(&self) -> ErrorContext {
        match self {
            Self::Invalid { kind, value } => ctx([("kind", (*kind).to_owned()), ("value", value.clone())]),
        }
    }
}

/// Errors from repository implementations.
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    /// The storage backend failed.
    #[error("repository storage error: {0}")]
    Storage(#[from] StorageError),

    /// A record could not be serialized or deserialized.
    #[error("{entity} serialization failed: {reason}")]
    Serialization { entity: &'static str, reason: String },

    /// The caller-supplied timeout elapsed.
    #[error("repository call '{operation}' timed out after {timeout_ms}ms")]
    Timeout { operation: &'static str, timeout_ms: u64 },

    /// An optimistic update lost the race too many times.
    #[error("{entity} '{id}' was concurrently modified ({attempts} attempts)")]
    Conflict {
        entity: &'static str,
        id: String,
        attempts: u32,
    },
}

impl DomainError for RepositoryError {
    fn code(&self) -> ErrorCode {
        match self {
            Self::Storage(_) | Self::Serialization { .. } => ErrorCode::RepositoryUnavailable,
            Self::Timeout { .. } => ErrorCode::RepositoryTimeout,
            Self::Conflict { .. } => ErrorCode::RepositoryConflict,
        }
    }

    fn context(&self) -> ErrorContext {
        match self {
            Self::Storage(_) => ErrorContext::new(),
            Self::Serialization { entity, .. } => ctx([("entity", (*entity).to_owned())]),
            Self::Timeout {
                operation,
                timeout_ms,
            } => ctx([
                ("operation", (*operation).to_owned()),
                ("timeout_ms", timeout_ms.to_string()),
            ]),
            Self::Conflict {
                entity,
                id,
                attempts,
            } => ctx([
                ("entity", (*entity).to_owned()),
                ("id", id.clone()),
                ("attempts", attempts.to_string()),
            ]),
        }
    }
}

/// Errors from the encryption service.
#[derive(Debug, thiserror::Error)]
pub enum EncryptionError {
    /// A primitive failed (bad key, corrupted ciphertext).
    #[error("encryption primitive failed: {0}")]
    Crypto(#[from] CryptoError),

    /// The key barrier failed or is sealed.
    #[error("key barrier failed: {0}")]
    Barrier(#[from] BarrierError),

    /// No keyring exists for the vault.
    #[error("no keyring for vault {vault_id}")]
    KeyringNotFound { vault_id: VaultId },

    /// A keyring already exists for the vault.
    #[error("keyring already exists for vault {vault_id}")]
    KeyringExists { vault_id: VaultId },

    /// The payload references a key version the keyring does not hold.
    #[error("unknown key version {version} for vault {vault_id}")]
    UnknownKeyVersion { vault_id: VaultId, version: u32 },

    /// The payload's key version has been retired from decryption.
    #[error("key version {version} for vault {vault_id} is below minimum {min_version}")]
    KeyVersionRetired {
        vault_id: VaultId,
        version: u32,
        min_version: u32,
    },

    /// The payload is malformed.
    #[error("invalid encrypted payload: {reason}")]
    InvalidPayload { reason: String },

    /// Keyring (de)serialization failed.
    #[error("keyring serialization failed: {reason}")]
    Serialization { reason: String },
}

impl DomainError for EncryptionError {
    fn code(&self) -> ErrorCode {
        match self {
            Self::Barrier(e) => e.code(),
            _ => ErrorCode::EncryptionFailed,
        }
    }

    fn context(&self) -> ErrorContext {
        match self {
            Self::KeyringNotFound { vault_id } | Self::KeyringExists { vault_id } => {
                ctx([("vault_id", vault_id.to_string())])
            }
            Self::UnknownKeyVersion { vault_id, version } => ctx([
                ("vault_id", vault_id.to_string()),
                ("key_version", version.to_string()),
            ]),
            Self::KeyVersionRetired {
                vault_id,
                version,
                min_version,
            } => ctx([
                ("vault_id", vault_id.to_string()),
                ("key_version", version.to_string()),
                ("min_key_version", min_version.to_string()),
            ]),
            _ => ErrorContext::new(),
        }
    }
}

/// Errors from vault operations.
#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    /// No vault with this id.
    #[error("vault not found: {vault_id}")]
    NotFound { vault_id: VaultId },

    /// No vault with this name.
    #[error("vault not found by name: {name}")]
    NameNotFound { name: String },

    /// The vault name is taken.
    #[error("vault name already in use: {name}")]
    AlreadyExists { name: String },

    /// The vault's status does not permit the operation.
    #[error("vault {vault_id} is {status}, operation requires an active vault")]
    NotActive {
        vault_id: VaultId,
        status: VaultStatus,
    },

    /// The vault's token counter has reached its limit.
    #[error("vault {vault_id} has reached its token limit of {limit}")]
    TokenLimitExceeded { vault_id: VaultId, limit: u64 },

    /// The requested status change is not allowed.
    #[error("vault {vault_id} cannot move from {from} to {to}")]
    InvalidStatusTransition {
        vault_id: VaultId,
        from: VaultStatus,
        to: VaultStatus,
    },

    /// A create/update request is invalid.
    #[error("invalid vault request: {reason}")]
    InvalidArgument { reason: String },

    #[error(transparent)]
    Id(#[from] IdError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    Encryption(#[from] EncryptionError),

    #[error(transparent)]
    Audit(#[from] AuditError),
}

impl DomainError for VaultError {
    fn code(&self) -> ErrorCode {
        match self {
            Self::NotFound { .. } | Self::NameNotFound { .. } => ErrorCode::VaultNotFound,
            Self::AlreadyExists { .. } => ErrorCode::VaultAlreadyExists,
            Self::NotActive { .. } => ErrorCode::VaultNotActive,
            Self::TokenLimitExceeded { .. } => ErrorCode::VaultTokenLimitExceeded,
            Self::InvalidStatusTransition { .. } => ErrorCode::InvalidStatusTransition,
            Self::InvalidArgument { .. } => ErrorCode::InvalidArgument,
            Self::Id(e) => e.code(),
            Self::Repository(e) => e.code(),
            Self::Encryption(e) => e.code(),
            Self::Audit(e) => e.code(),
        }
    }

    fn context(&self) -> ErrorContext {
        match self {
            Self::NotFound { vault_id } => ctx([("vault_id", vault_id.to_string())]),
            Self::NameNotFound { name } | Self::AlreadyExists { name } => {
                ctx([("name", name.clone())])
            }
            Self::NotActive { vault_id, status } => ctx([
                ("vault_id", vault_id.to_string()),
                ("status", status.to_string()),
            ]),
            Self::TokenLimitExceeded { vault_id, limit } => ctx([
                ("vault_id", vault_id.to_string()),
                ("limit", limit.to_string()),
            ]),
            Self::InvalidStatusTransition { vault_id, from, to } => ctx([
                ("vault_id", vault_id.to_string()),
                ("from", from.to_string()),
                ("to", to.to_string()),
            ]),
            Self::InvalidArgument { .. } => ErrorContext::new(),
            Self::Id(e) => e.context(),
            Self::Repository(e) => e.context(),
            Self::Encryption(e) => e.context(),
            Self::Audit(e) => e.context(),
        }
    }
}

/// Errors from tokenization operations.
#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    /// No token with this value.
    #[error("token not found: {token_ref}")]
    NotFound { token_ref: String },

    /// The token is suspended.
    #[error("token {token_ref} is {status}")]
    NotActive {
        token_ref: String,
        status: TokenStatus,
    },

    /// The token can never be used again (revoked or expired).
    #[error("token {token_ref} is not usable: {reason}")]
    NotUsable {
        token_ref: String,
        reason: &'static str,
    },

    /// The token is already revoked.
    #[error("token {token_ref} is already revoked")]
    CannotBeRevoked { token_ref: String },

    /// The requested lifecycle change is not allowed.
    #[error("token {token_ref} cannot move from {from} to {to}")]
    InvalidTransition {
        token_ref: String,
        from: TokenStatus,
        to: TokenStatus,
    },

    /// No unique token value could be generated.
    #[error("could not generate a unique token after {attempts} attempts")]
    GenerationFailed { attempts: u8 },

    /// The request is malformed (e.g. empty plaintext).
    #[error("invalid tokenization request: {reason}")]
    InvalidArgument { reason: String },

    #[error(transparent)]
    Vault(#[from] VaultError),

    #[error(transparent)]
    Encryption(#[from] EncryptionError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    Audit(#[from] AuditError),
}

impl DomainError for TokenError {
    fn code(&self) -> ErrorCode {
        match self {
            Self::NotFound { .. } => ErrorCode::TokenNotFound,
            Self::NotActive { .. } => ErrorCode::TokenNotActive,
            Self::NotUsable { .. } => ErrorCode::TokenNotUsable,
            Self::CannotBeRevoked { .. } => ErrorCode::TokenCannotBeRevoked,
            Self::InvalidTransition { .. } => ErrorCode::InvalidStatusTransition,
            Self::GenerationFailed { .. } => ErrorCode::TokenGenerationFailed,
            Self::InvalidArgument { .. } => ErrorCode::InvalidArgument,
            Self::Vault(e) => e.code(),
            Self::Encryption(e) => e.code(),
            Self::Repository(e) => e.code(),
            Self::Audit(e) => e.code(),
        }
    }

    fn context(&self) -> ErrorContext {
        match self {
            Self::NotFound { token_ref } | Self::CannotBeRevoked { token_ref } => {
                ctx([("token_ref", token_ref.clone())])
            }
            Self::NotActive { token_ref, status } => ctx([
                ("token_ref", token_ref.clone()),
                ("status", status.to_string()),
            ]),
            Self::NotUsable { token_ref, reason } => ctx([
                ("token_ref", token_ref.clone()),
                ("reason", (*reason).to_owned()),
            ]),
            Self::InvalidTransition {
                token_ref,
                from,
                to,
            } => ctx([
                ("token_ref", token_ref.clone()),
                ("from", from.to_string()),
                ("to", to.to_string()),
            ]),
            Self::GenerationFailed { attempts } => ctx([("attempts", attempts.to_string())]),
            Self::InvalidArgument { .. } => ErrorContext::new(),
            Self::Vault(e) => e.context(),
            Self::Encryption(e) => e.context(),
            Self::Repository(e) => e.context(),
            Self::Audit(e) => e.context(),
        }
    }
}

/// Errors from audit logging.
#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    /// No audit entry with this id.
    #[error("audit log not found: {id}")]
    NotFound { id: AuditLogId },

    /// The durable audit write failed; the business operation must fail.
    #[error("audit write failed (fail-closed): {reason}")]
    WriteFailed { reason: String },

    /// A mirror sink failed.
    #[error("audit sink '{name}' failed: {reason}")]
    SinkFailure { name: String, reason: String },

    /// Serialization of an audit entry failed.
    #[error("audit serialization failed: {reason}")]
    Serialization { reason: String },

    /// Writing an archive batch failed; nothing was marked archived.
    #[error("audit archive to '{location}' failed: {reason}")]
    Archive { location: String, reason: String },

    /// Retention cutoffs are inconsistent.
    #[error("invalid audit retention: {reason}")]
    InvalidRetention { reason: String },

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

impl DomainError for AuditError {
    fn code(&self) -> ErrorCode {
        match self {
            Self::NotFound { .. } => ErrorCode::AuditLogNotFound,
            Self::WriteFailed { .. } | Self::SinkFailure { .. } | Self::Serialization { .. } => {
                ErrorCode::AuditWriteFailed
            }
            Self::Archive { .. } => ErrorCode::AuditArchiveFailed,
            Self::InvalidRetention { .. } => ErrorCode::InvalidArgument,
            Self::Repository(e) => e.code(),
        }
    }

    fn context(&self) -> ErrorContext {
        match self {
            Self::NotFound { id } => ctx([("audit_log_id", id.to_string())]),
            Self::SinkFailure { name, .. } => ctx([("sink", name.clone())]),
            Self::Archive { location, .. } => ctx([("location", location.clone())]),
            Self::Repository(e) => e.context(),
            _ => ErrorContext::new(),
        }
    }
}

/// Errors validating settings.
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    /// A field has an unusable value.
    #[error("invalid setting '{field}': {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl DomainError for SettingsError {
    fn code(&self) -> ErrorCode {
        ErrorCode::InvalidConfiguration
    }

    fn context(&self) -> ErrorContext {
        match self {
            Self::Invalid { field, .. } => ctx([("field", (*field).to_owned())]),
        }
    }
}
