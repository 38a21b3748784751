//! Vaults: named containers for one kind of sensitive data.
//!
//! A vault owns a keyring (see [`crate::keyring`]), a token counter with a
//! hard limit, and a rotation schedule. Vaults are never hard-deleted by the
//! service: deleting one retires it and stamps `deleted_at`.
//!
//! # Concurrency
//!
//! - The token counter is only changed through revision-checked
//!   compare-and-swap, so concurrent tokenizations cannot push it past the
//!   limit.
//! - Each vault has a rotation guard. Tokenize and detokenize hold it shared;
//!   key rotation holds it exclusively, so no token is written under a key
//!   version that is being replaced.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use tracing::{error, info, warn};

use crate::audit::{AuditEvent, AuditLogger, OperationType};
use crate::context::{RequestContext, bounded};
use crate::encryption::EncryptionService;
use crate::error::{DomainError, RepositoryError, VaultError};
use crate::id::VaultId;
use crate::repository::{Page, TokenRepository, VaultRepository};
use crate::settings::VaultSettings;

/// Compare-and-swap attempts before a counter update reports a conflict.
pub const MAX_CAS_ATTEMPTS: u32 = 16;

/// Longest accepted vault name.
const MAX_NAME_LEN: usize = 128;

/// Kind of sensitive data a vault holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    CardNumber,
    CardSecurityCode,
    BankAccount,
    NationalId,
    Email,
    Phone,
    Generic,
}

impl DataType {
    /// Whether entries touching this data are PCI-relevant.
    #[must_use]
    pub const fn is_pci(self) -> bool {
        matches!(self, Self::CardNumber | Self::CardSecurityCode)
    }
}

/// Lifecycle state of a vault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VaultStatus {
    Active,
    /// Access frozen; recoverable.
    Locked,
    /// Key rotation in progress.
    Rotating,
    /// Terminal.
    Retired,
}

impl VaultStatus {
    /// Whether the lifecycle allows moving from `self` to `to`.
    #[must_use]
    pub const fn can_transition_to(self, to: Self) -> bool {
        matches!(
            (self, to),
            (Self::Active, Self::Locked | Self::Rotating | Self::Retired)
                | (Self::Locked, Self::Active | Self::Retired)
                | (Self::Rotating, Self::Active)
        )
    }
}

impl fmt::Display for VaultStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Active => "active",
            Self::Locked => "locked",
            Self::Rotating => "rotating",
            Self::Retired => "retired",
        })
    }
}

/// A vault record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vault {
    pub id: VaultId,
    pub name: String,
    pub data_type: DataType,
    pub status: VaultStatus,
    pub token_count: u64,
    pub token_limit: u64,
    /// Mirrors the keyring's latest version.
    pub key_version: u32,
    pub key_rotation_interval_days: u32,
    pub next_rotation_at: DateTime<Utc>,
    pub last_rotated_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
    /// Bumped on every update; guards concurrent writers.
    pub revision: u64,
}

impl Vault {
    #[must_use]
    pub fn has_capacity(&self) -> bool {
        self.token_count < self.token_limit
    }

    #[must_use]
    pub fn needs_rotation(&self, now: DateTime<Utc>) -> bool {
        matches!(self.status, VaultStatus::Active | VaultStatus::Rotating)
            && self.next_rotation_at <= now
    }

    /// `token_count / token_limit`, in `[0, 1]`.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn utilization(&self) -> f64 {
        if self.token_limit == 0 {
            return 1.0;
        }
        self.token_count as f64 / self.token_limit as f64
    }

    fn rotation_due_after(&self, from: DateTime<Utc>) -> DateTime<Utc> {
        from + chrono::Duration::days(i64::from(self.key_rotation_interval_days))
    }

    fn touched(mut self) -> Self {
        self.updated_at = Utc::now();
        self.revision = self.revision.saturating_add(1);
        self
    }
}

/// Request to create a vault.
#[derive(Debug, Clone)]
pub struct NewVault {
    pub name: String,
    pub data_type: DataType,
    /// Defaults to the configured token limit.
    pub token_limit: Option<u64>,
    /// Defaults to the configured rotation interval.
    pub key_rotation_interval_days: Option<u32>,
}

/// Per-vault statistics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VaultStatistics {
    pub vault_id: VaultId,
    pub status: VaultStatus,
    pub token_count: u64,
    pub token_limit: u64,
    pub utilization: f64,
    pub key_version: u32,
    pub last_rotated_at: Option<DateTime<Utc>>,
    pub next_rotation_at: DateTime<Utc>,
}

impl From<&Vault> for VaultStatistics {
    fn from(vault: &Vault) -> Self {
        Self {
            vault_id: vault.id,
            status: vault.status,
            token_count: vault.token_count,
            token_limit: vault.token_limit,
            utilization: vault.utilization(),
            key_version: vault.key_version,
            last_rotated_at: vault.last_rotated_at,
            next_rotation_at: vault.next_rotation_at,
        }
    }
}

/// Statistics across all vaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GlobalVaultStatistics {
    pub total_vaults: u64,
    pub by_status: HashMap<VaultStatus, u64>,
    pub total_tokens: u64,
    pub due_for_rotation: u64,
    pub last_rotation_at: Option<DateTime<Utc>>,
}

/// Result of a key rotation.
#[derive(Debug, Clone, PartialEq)]
pub struct RotationOutcome {
    pub vault: Vault,
    pub previous_version: u32,
    pub new_version: u32,
    pub rewrapped: usize,
}

/// Per-vault rotation guards.
#[derive(Debug, Default)]
pub struct VaultGuards {
    guards: Mutex<HashMap<VaultId, Arc<RwLock<()>>>>,
}

impl VaultGuards {
    async fn guard(&self, vault_id: VaultId) -> Arc<RwLock<()>> {
        self.guards
            .lock()
            .await
            .entry(vault_id)
            .or_default()
            .clone()
    }

    /// Shared access: tokenize and detokenize.
    pub async fn shared(&self, vault_id: VaultId) -> OwnedRwLockReadGuard<()> {
        self.guard(vault_id).await.read_owned().await
    }

    /// Exclusive access: key rotation.
    pub async fn exclusive(&self, vault_id: VaultId) -> OwnedRwLockWriteGuard<()> {
        self.guard(vault_id).await.write_owned().await
    }
}

/// Vault operations.
pub struct VaultService {
    vaults: Arc<dyn VaultRepository>,
    tokens: Arc<dyn TokenRepository>,
    encryption: Arc<dyn EncryptionService>,
    audit: Arc<AuditLogger>,
    guards: VaultGuards,
    settings: VaultSettings,
    timeout: Duration,
}

impl VaultService {
    #[must_use]
    pub fn new(
        vaults: Arc<dyn VaultRepository>,
        tokens: Arc<dyn TokenRepository>,
        encryption: Arc<dyn EncryptionService>,
        audit: Arc<AuditLogger>,
        settings: VaultSettings,
        timeout: Duration,
    ) -> Self {
        Self {
            vaults,
            tokens,
            encryption,
            audit,
            guards: VaultGuards::default(),
            settings,
            timeout,
        }
    }

    #[must_use]
    pub fn guards(&self) -> &VaultGuards {
        &self.guards
    }

    #[must_use]
    pub fn default_timeout(&self) -> Duration {
        self.timeout
    }

    /// Audit a failure and hand the error back. The original error wins if
    /// the audit write also fails.
    async fn fail(&self, event: AuditEvent, err: VaultError) -> VaultError {
        if let Err(audit_err) = self.audit.failure(event, err.code()).await {
            error!(error = %audit_err, code = %err.code(), "failure audit could not be written");
        }
        err
    }

    /// Create a vault and its keyring.
    ///
    /// # Errors
    ///
    /// - [`VaultError::InvalidArgument`] for an empty or overlong name or a
    ///   zero limit or interval.
    /// - [`VaultError::AlreadyExists`] if the name is taken.
    /// - [`VaultError::Audit`] if the creation could not be audited; the
    ///   vault record is removed again.
    pub async fn create(&self, request: NewVault, ctx: &RequestContext) -> Result<Vault, VaultError> {
        let event = AuditEvent::start(OperationType::CreateVault, ctx)
            .detail("data_type", format!("{:?}", request.data_type));
        match self.create_inner(request, ctx).await {
            Ok(vault) => {
                let event = event.vault(&vault);
                if let Err(e) = self.audit.success(event).await {
                    if let Err(undo) = self.vaults.delete(vault.id).await {
                        error!(vault_id = %vault.id, error = %undo, "could not remove unaudited vault");
                    }
                    return Err(e.into());
                }
                info!(vault_id = %vault.id, name = %vault.name, "vault created");
                Ok(vault)
            }
            Err(e) => Err(self.fail(event, e).await),
        }
    }

    async fn create_inner(&self, request: NewVault, ctx: &RequestContext) -> Result<Vault, VaultError> {
        let name = request.name.trim().to_owned();
        if name.is_empty() || name.len() > MAX_NAME_LEN {
            return Err(VaultError::InvalidArgument {
                reason: format!("name must be 1 to {MAX_NAME_LEN} characters"),
            });
        }
        let token_limit = request.token_limit.unwrap_or(self.settings.default_token_limit);
        let interval = request
            .key_rotation_interval_days
            .unwrap_or(self.settings.key_rotation_interval_days);
        if token_limit == 0 || interval == 0 {
            return Err(VaultError::InvalidArgument {
                reason: "token limit and rotation interval must be positive".to_owned(),
            });
        }

        let timeout = ctx.timeout_or(self.timeout);
        if bounded("vault.find_by_name", timeout, self.vaults.find_by_name(&name))
            .await?
            .is_some()
        {
            return Err(VaultError::AlreadyExists { name });
        }

        let id = VaultId::new();
        let key_version = self.encryption.create_keyring(id).await?;
        let now = Utc::now();
        let vault = Vault {
            id,
            name,
            data_type: request.data_type,
            status: VaultStatus::Active,
            token_count: 0,
            token_limit,
            key_version,
            key_rotation_interval_days: interval,
            next_rotation_at: now + chrono::Duration::days(i64::from(interval)),
            last_rotated_at: None,
            created_at: now,
            updated_at: now,
            deleted_at: None,
            revision: 0,
        };

        if !bounded("vault.insert", timeout, self.vaults.insert(&vault)).await? {
            return Err(VaultError::AlreadyExists { name: vault.name });
        }
        Ok(vault)
    }

    /// # Errors
    ///
    /// Returns [`VaultError::Repository`] if the lookup fails.
    pub async fn find_by_id(&self, id: VaultId) -> Result<Option<Vault>, VaultError> {
        Ok(bounded("vault.find_by_id", self.timeout, self.vaults.find_by_id(id)).await?)
    }

    /// # Errors
    ///
    /// Returns [`VaultError::NotFound`] if no vault has this id.
    pub async fn find_by_id_or_fail(&self, id: VaultId) -> Result<Vault, VaultError> {
        self.find_by_id(id)
            .await?
            .ok_or(VaultError::NotFound { vault_id: id })
    }

    /// Parse `id` and look the vault up.
    ///
    /// # Errors
    ///
    /// - [`VaultError::Id`] if `id` is not a UUID.
    /// - [`VaultError::NotFound`] if no vault has this id.
    pub async fn find_by_id_str(&self, id: &str) -> Result<Vault, VaultError> {
        self.find_by_id_or_fail(VaultId::parse(id)?).await
    }

    /// # Errors
    ///
    /// Returns [`VaultError::Repository`] if the lookup fails.
    pub async fn find_by_name(&self, name: &str) -> Result<Option<Vault>, VaultError> {
        Ok(bounded("vault.find_by_name", self.timeout, self.vaults.find_by_name(name)).await?)
    }

    /// # Errors
    ///
    /// Returns [`VaultError::NameNotFound`] if no vault has this name.
    pub async fn find_by_name_or_fail(&self, name: &str) -> Result<Vault, VaultError> {
        self.find_by_name(name)
            .await?
            .ok_or_else(|| VaultError::NameNotFound {
                name: name.to_owned(),
            })
    }

    /// # Errors
    ///
    /// Returns [`VaultError::Repository`] if the query fails.
    pub async fn find_by_data_type(&self, data_type: DataType) -> Result<Vec<Vault>, VaultError> {
        Ok(bounded(
            "vault.find_by_data_type",
            self.timeout,
            self.vaults.find_by_data_type(data_type),
        )
        .await?)
    }

    /// # Errors
    ///
    /// Returns [`VaultError::Repository`] if the query fails.
    pub async fn find_by_status(&self, status: VaultStatus) -> Result<Vec<Vault>, VaultError> {
        Ok(bounded("vault.find_by_status", self.timeout, self.vaults.find_by_status(status)).await?)
    }

    /// # Errors
    ///
    /// Returns [`VaultError::Repository`] if the query fails.
    pub async fn list_active(&self) -> Result<Vec<Vault>, VaultError> {
        Ok(bounded("vault.find_active_vaults", self.timeout, self.vaults.find_active_vaults()).await?)
    }

    /// Vaults whose rotation is due at `now`.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::Repository`] if the query fails.
    pub async fn find_needing_rotation(&self, now: DateTime<Utc>) -> Result<Vec<Vault>, VaultError> {
        Ok(bounded(
            "vault.find_vaults_needing_key_rotation",
            self.timeout,
            self.vaults.find_vaults_needing_key_rotation(now),
        )
        .await?)
    }

    /// # Errors
    ///
    /// Returns [`VaultError::InvalidArgument`] for page 0 or `per_page` 0.
    pub async fn paginate(&self, page: u32, per_page: u32) -> Result<Page<Vault>, VaultError> {
        if page == 0 || per_page == 0 {
            return Err(VaultError::InvalidArgument {
                reason: "page and per_page start at 1".to_owned(),
            });
        }
        Ok(bounded("vault.paginate", self.timeout, self.vaults.paginate(page, per_page)).await?)
    }

    /// # Errors
    ///
    /// Returns [`VaultError::NotFound`] if no vault has this id.
    pub async fn statistics(&self, id: VaultId) -> Result<VaultStatistics, VaultError> {
        Ok(VaultStatistics::from(&self.find_by_id_or_fail(id).await?))
    }

    /// # Errors
    ///
    /// Returns [`VaultError::Repository`] if the query fails.
    pub async fn global_statistics(&self) -> Result<GlobalVaultStatistics, VaultError> {
        Ok(bounded("vault.get_statistics", self.timeout, self.vaults.get_statistics(Utc::now())).await?)
    }

    /// # Errors
    ///
    /// Returns [`VaultError::Repository`] if the query fails.
    pub async fn total_token_count(&self) -> Result<u64, VaultError> {
        Ok(bounded(
            "vault.get_total_token_count",
            self.timeout,
            self.vaults.get_total_token_count(),
        )
        .await?)
    }

    /// # Errors
    ///
    /// Returns [`VaultError::Repository`] if the query fails.
    pub async fn exists(&self, id: VaultId) -> Result<bool, VaultError> {
        Ok(bounded("vault.exists", self.timeout, self.vaults.exists(id)).await?)
    }

    /// Move a vault to `to`.
    ///
    /// Moving to the current status is a no-op. `rotating` is entered and
    /// left only by [`rotate_key`](Self::rotate_key).
    ///
    /// # Errors
    ///
    /// - [`VaultError::NotFound`] if no vault has this id.
    /// - [`VaultError::InvalidStatusTransition`] for a disallowed move.
    /// - [`VaultError::Audit`] if the change could not be audited; the
    ///   previous status is restored.
    pub async fn update_status(
        &self,
        id: VaultId,
        to: VaultStatus,
        ctx: &RequestContext,
    ) -> Result<Vault, VaultError> {
        self.change_status(id, to, ctx, OperationType::UpdateVaultStatus).await
    }

    /// Retire a vault and stamp `deleted_at`. Existing tokens stay
    /// detokenizable.
    ///
    /// # Errors
    ///
    /// Same as [`update_status`](Self::update_status).
    pub async fn soft_delete(&self, id: VaultId, ctx: &RequestContext) -> Result<Vault, VaultError> {
        self.change_status(id, VaultStatus::Retired, ctx, OperationType::DeleteVault)
            .await
    }

    async fn change_status(
        &self,
        id: VaultId,
        to: VaultStatus,
        ctx: &RequestContext,
        operation: OperationType,
    ) -> Result<Vault, VaultError> {
        let event = AuditEvent::start(operation, ctx)
            .vault_id(id)
            .detail("to", to);
        let current = match self.find_by_id_or_fail(id).await {
            Ok(vault) => vault,
            Err(e) => return Err(self.fail(event, e).await),
        };
        let event = event.vault(&current).detail("from", current.status);

        let manual_rotation = to == VaultStatus::Rotating || current.status == VaultStatus::Rotating;
        if current.status != to && (manual_rotation || !current.status.can_transition_to(to)) {
            let err = VaultError::InvalidStatusTransition {
                vault_id: id,
                from: current.status,
                to,
            };
            return Err(self.fail(event, err).await);
        }
        let soft_delete = operation == OperationType::DeleteVault;
        if current.status == to && !(soft_delete && current.deleted_at.is_none()) {
            self.audit.success(event.detail("unchanged", true)).await?;
            return Ok(current);
        }

        let previous = current.status;
        let updated = match self
            .update_with(id, |vault| {
                if vault.status != previous {
                    return Err(VaultError::InvalidStatusTransition {
                        vault_id: id,
                        from: vault.status,
                        to,
                    });
                }
                vault.status = to;
                if soft_delete {
                    vault.deleted_at = Some(Utc::now());
                }
                Ok(())
            })
            .await
        {
            Ok(vault) => vault,
            Err(e) => return Err(self.fail(event, e).await),
        };

        if let Err(e) = self.audit.success(event).await {
            let restored = self
                .update_with(id, |vault| {
                    vault.status = previous;
                    if soft_delete {
                        vault.deleted_at = None;
                    }
                    Ok(())
                })
                .await;
            if let Err(undo) = restored {
                error!(vault_id = %id, error = %undo, "could not restore vault status after audit failure");
            }
            return Err(e.into());
        }

        info!(vault_id = %id, from = %previous, to = %to, "vault status changed");
        Ok(updated)
    }

    /// Count one more token against the vault, enforcing status and limit.
    ///
    /// # Errors
    ///
    /// - [`VaultError::NotActive`] unless the vault is active.
    /// - [`VaultError::TokenLimitExceeded`] when the counter is at its limit.
    /// - [`VaultError::Repository`] with a conflict if the CAS keeps losing.
    pub async fn reserve_token(&self, id: VaultId, timeout: Duration) -> Result<Vault, VaultError> {
        self.update_with_timeout(id, timeout, |vault| {
            if vault.status != VaultStatus::Active {
                return Err(VaultError::NotActive {
                    vault_id: vault.id,
                    status: vault.status,
                });
            }
            if !vault.has_capacity() {
                return Err(VaultError::TokenLimitExceeded {
                    vault_id: vault.id,
                    limit: vault.token_limit,
                });
            }
            vault.token_count = vault.token_count.saturating_add(1);
            Ok(())
        })
        .await
    }

    /// Give `count` token slots back, whatever the vault's status.
    ///
    /// # Errors
    ///
    /// Same as [`reserve_token`](Self::reserve_token), minus the status and
    /// limit checks.
    pub async fn release_tokens(
        &self,
        id: VaultId,
        count: u64,
        timeout: Duration,
    ) -> Result<Vault, VaultError> {
        self.update_with_timeout(id, timeout, |vault| {
            vault.token_count = vault.token_count.saturating_sub(count);
            Ok(())
        })
        .await
    }

    async fn update_with<F>(&self, id: VaultId, apply: F) -> Result<Vault, VaultError>
    where
        F: Fn(&mut Vault) -> Result<(), VaultError> + Send + Sync,
    {
        self.update_with_timeout(id, self.timeout, apply).await
    }

    /// Read-modify-write a vault under its revision.
    async fn update_with_timeout<F>(
        &self,
        id: VaultId,
        timeout: Duration,
        apply: F,
    ) -> Result<Vault, VaultError>
    where
        F: Fn(&mut Vault) -> Result<(), VaultError> + Send + Sync,
    {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let current = bounded("vault.find_by_id", timeout, self.vaults.find_by_id(id))
                .await?
                .ok_or(VaultError::NotFound { vault_id: id })?;
            let mut next = current.clone();
            apply(&mut next)?;
            let next = next.touched();
            if bounded(
                "vault.save_if_revision",
                timeout,
                self.vaults.save_if_revision(&next, current.revision),
            )
            .await?
            {
                return Ok(next);
            }
        }
        Err(RepositoryError::Conflict {
            entity: "vault",
            id: id.to_string(),
            attempts: MAX_CAS_ATTEMPTS,
        }
        .into())
    }

    /// Rotate the vault's key and rewrap every token's data key onto it.
    ///
    /// Holds the vault's exclusive guard throughout, so tokenize and
    /// detokenize wait. Stored ciphertext bodies are not touched. Older key
    /// versions are retired once the rotation has been audited.
    ///
    /// A vault left `rotating` by an interrupted rotation may be rotated
    /// again. Only a vault still `rotating` when the rewrap finishes is
    /// returned to `active`; a status written meanwhile is kept.
    ///
    /// # Errors
    ///
    /// - [`VaultError::NotActive`] unless the vault is active or rotating
    ///   when rotation starts.
    /// - [`VaultError::Encryption`] or [`VaultError::Repository`] if rotation
    ///   or rewrapping fails; a `rotating` vault returns to `active`.
    /// - [`VaultError::Audit`] if the rotation could not be audited. The new
    ///   key stays in place since rotation does not lose data, and older
    ///   versions stay usable.
    pub async fn rotate_key(&self, id: VaultId, ctx: &RequestContext) -> Result<RotationOutcome, VaultError> {
        let event = AuditEvent::start(OperationType::RotateKey, ctx).vault_id(id);
        let timeout = ctx.timeout_or(self.timeout);
        let _exclusive = self.guards.exclusive(id).await;

        let vault = match bounded("vault.find_by_id", timeout, self.vaults.find_by_id(id)).await {
            Ok(Some(vault)) => vault,
            Ok(None) => return Err(self.fail(event, VaultError::NotFound { vault_id: id }).await),
            Err(e) => return Err(self.fail(event, e.into()).await),
        };
        let event = event.vault(&vault);
        let previous_version = vault.key_version;

        let begin = self
            .update_with_timeout(id, timeout, |v| match v.status {
                VaultStatus::Active | VaultStatus::Rotating => {
                    v.status = VaultStatus::Rotating;
                    Ok(())
                }
                status => Err(VaultError::NotActive { vault_id: id, status }),
            })
            .await;
        if let Err(e) = begin {
            return Err(self.fail(event, e).await);
        }

        let (new_version, rewrapped) = match self.rotate_and_rewrap(id, timeout).await {
            Ok(done) => done,
            Err(e) => {
                warn!(vault_id = %id, error = %e, "key rotation failed, reactivating vault");
                let current_version = self.encryption.current_version(id).await.ok();
                let restored = self
                    .update_with_timeout(id, timeout, |v| {
                        if v.status == VaultStatus::Rotating {
                            v.status = VaultStatus::Active;
                        }
                        if let Some(version) = current_version {
                            v.key_version = version;
                        }
                        Ok(())
                    })
                    .await;
                if let Err(undo) = restored {
                    error!(vault_id = %id, error = %undo, "could not reactivate vault after failed rotation");
                }
                return Err(self.fail(event, e).await);
            }
        };

        let now = Utc::now();
        let vault = match self
            .update_with_timeout(id, timeout, |v| {
                if v.status == VaultStatus::Rotating {
                    v.status = VaultStatus::Active;
                }
                v.key_version = new_version;
                v.last_rotated_at = Some(now);
                v.next_rotation_at = v.rotation_due_after(now);
                Ok(())
            })
            .await
        {
            Ok(vault) => vault,
            Err(e) => return Err(self.fail(event, e).await),
        };
        if vault.status != VaultStatus::Active {
            warn!(vault_id = %id, status = %vault.status, "vault status changed during key rotation");
        }

        let event = event
            .detail("previous_version", previous_version)
            .detail("new_version", new_version)
            .detail("rewrapped", rewrapped);
        self.audit.success(event).await?;

        if let Err(e) = self.encryption.retire_versions_below(id, new_version).await {
            error!(vault_id = %id, key_version = new_version, error = %e, "could not retire old key versions");
        }
        info!(
            vault_id = %id,
            previous_version,
            key_version = new_version,
            rewrapped,
            "vault key rotated"
        );
        Ok(RotationOutcome {
            vault,
            previous_version,
            new_version,
            rewrapped,
        })
    }

    async fn rotate_and_rewrap(&self, id: VaultId, timeout: Duration) -> Result<(u32, usize), VaultError> {
        let new_version = self.encryption.rotate_key(id).await?;
        let tokens = bounded("token.find_by_vault", timeout, self.tokens.find_by_vault(id)).await?;

        let mut rewrapped = 0usize;
        for mut token in tokens {
            if token.payload.key_version == new_version {
                continue;
            }
            token.payload = self.encryption.rewrap(id, &token.payload).await?;
            let expected = token.revision;
            token.revision = token.revision.saturating_add(1);
            // Tokens cannot change under the exclusive guard except through
            // revoke/suspend, which do not take it; retry once on a lost race.
            if !bounded(
                "token.save_if_revision",
                timeout,
                self.tokens.save_if_revision(&token, expected),
            )
            .await?
            {
                let Some(mut fresh) =
                    bounded("token.find_by_hash", timeout, self.tokens.find_by_hash(&token.token_hash))
                        .await?
                else {
                    continue;
                };
                let expected = fresh.revision;
                fresh.payload = token.payload.clone();
                fresh.revision = fresh.revision.saturating_add(1);
                if !bounded(
                    "token.save_if_revision",
                    timeout,
                    self.tokens.save_if_revision(&fresh, expected),
                )
                .await?
                {
                    return Err(RepositoryError::Conflict {
                        entity: "token",
                        id: fresh.reference().to_owned(),
                        attempts: 2,
                    }
                    .into());
                }
            }
            rewrapped = rewrapped.saturating_add(1);
        }
        Ok((new_version, rewrapped))
    }
}

impl fmt::Debug for VaultService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VaultService")
            .field("settings", &self.settings)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_transitions() {
        use VaultStatus::{Active, Locked, Retired, Rotating};
        assert!(Active.can_transition_to(Locked));
        assert!(Locked.can_transition_to(Active));
        assert!(Active.can_transition_to(Rotating));
        assert!(Rotating.can_transition_to(Active));
        assert!(Locked.can_transition_to(Retired));
        assert!(!Retired.can_transition_to(Active));
        assert!(!Retired.can_transition_to(Locked));
        assert!(!Rotating.can_transition_to(Retired));
        assert!(!Locked.can_transition_to(Rotating));
    }

    #[test]
    fn pci_data_types() {
        assert!(DataType::CardNumber.is_pci());
        assert!(DataType::CardSecurityCode.is_pci());
        assert!(!DataType::Email.is_pci());
        assert!(!DataType::Generic.is_pci());
    }

    #[test]
    fn serde_names_are_snake_case() {
        assert_eq!(
            serde_json::to_string(&DataType::CardSecurityCode).unwrap_or_default(),
            "\"card_security_code\""
        );
        assert_eq!(
            serde_json::to_string(&VaultStatus::Retired).unwrap_or_default(),
            "\"retired\""
        );
    }

    #[tokio::test]
    async fn guards_exclude_writers_while_readers_hold() {
        let guards = Arc::new(VaultGuards::default());
        let id = VaultId::new();
        let shared = guards.shared(id).await;

        let g = guards.clone();
        let writer = tokio::spawn(async move {
            let _w = g.exclusive(id).await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!writer.is_finished());
        drop(shared);
        assert!(writer.await.is_ok());

        // Other vaults are unaffected.
        let _a = guards.exclusive(id).await;
        let _b = guards.shared(VaultId::new()).await;
    }
}
