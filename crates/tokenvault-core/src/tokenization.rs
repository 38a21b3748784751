//! Tokenization Service.
//!
//! Issues, detokenizes and manages tokens against a vault. Every call writes
//! exactly one audit entry, success or failure. A state change whose success
//! entry cannot be written is undone before the call returns
//! [`AuditError::WriteFailed`](crate::error::AuditError::WriteFailed):
//!
//! | Operation | Undo |
//! |-----------|------|
//! | tokenize | delete the token, release the counter slot |
//! | detokenize | withhold the plaintext, roll back the usage record |
//! | revoke / suspend / reactivate | restore the previous status |
//! | purge | re-insert the purged records |

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{error, info, warn};
use zeroize::Zeroizing;

use crate::audit::{AuditEvent, AuditLogger, OperationType};
use crate::context::{RequestContext, bounded};
use crate::encryption::EncryptionService;
use crate::error::{DomainError, RepositoryError, TokenError, VaultError};
use crate::id::VaultId;
use crate::repository::TokenRepository;
use crate::risk::AccessTracker;
use crate::settings::TokenizationSettings;
use crate::token::{Token, TokenGenerator, TokenStatus, hash_prefix, hash_token};
use crate::vault::{MAX_CAS_ATTEMPTS, Vault, VaultService, VaultStatus};

/// Longest accepted revocation reason.
const MAX_REASON_LEN: usize = 256;

/// A freshly issued token. The value is returned once and never stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedToken {
    pub token: String,
    pub vault_id: VaultId,
    pub key_version: u32,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Tokenize, detokenize and lifecycle operations.
pub struct TokenizationService {
    vaults: Arc<VaultService>,
    tokens: Arc<dyn TokenRepository>,
    encryption: Arc<dyn EncryptionService>,
    audit: Arc<AuditLogger>,
    generator: Arc<dyn TokenGenerator>,
    tracker: AccessTracker,
    settings: TokenizationSettings,
}

impl TokenizationService {
    #[must_use]
    pub fn new(
        vaults: Arc<VaultService>,
        tokens: Arc<dyn TokenRepository>,
        encryption: Arc<dyn EncryptionService>,
        audit: Arc<AuditLogger>,
        generator: Arc<dyn TokenGenerator>,
        settings: TokenizationSettings,
    ) -> Self {
        Self {
            tracker: AccessTracker::new(settings.detokenize_burst_window),
            vaults,
            tokens,
            encryption,
            audit,
            generator,
            settings,
        }
    }

    fn timeout(&self, ctx: &RequestContext) -> Duration {
        ctx.timeout_or(self.settings.repository_timeout)
    }

    async fn fail(&self, event: AuditEvent, err: TokenError) -> TokenError {
        let operation = event.operation();
        if let Err(audit_err) = self.audit.failure(event, err.code()).await {
            error!(
                operation = %operation,
                code = %err.code(),
                error = %audit_err,
                "failure audit could not be written"
            );
        }
        err
    }

    async fn load_vault(&self, id: VaultId, timeout: Duration) -> Result<Vault, TokenError> {
        Ok(bounded("vault.find_by_id", timeout, self.vaults.find_by_id_or_fail(id)).await?)
    }

    async fn load_token(
        &self,
        token_hash: &str,
        timeout: Duration,
    ) -> Result<Token, TokenError> {
        bounded("token.find_by_hash", timeout, self.tokens.find_by_hash(token_hash))
            .await?
            .ok_or_else(|| TokenError::NotFound {
                token_ref: hash_prefix(token_hash).to_owned(),
            })
    }

    /// Issue a token for `plaintext` in `vault_id`.
    ///
    /// # Errors
    ///
    /// - [`TokenError::InvalidArgument`] for empty plaintext.
    /// - [`VaultError::NotFound`], [`VaultError::NotActive`] or
    ///   [`VaultError::TokenLimitExceeded`] (wrapped in [`TokenError::Vault`]).
    ///   The counter is not incremented and no token is created.
    /// - [`TokenError::Encryption`] if encryption fails.
    /// - [`TokenError::GenerationFailed`] if no unused value was found.
    /// - [`TokenError::Audit`] if the issue could not be audited; the token
    ///   is deleted and the counter released.
    pub async fn tokenize(
        &self,
        vault_id: VaultId,
        plaintext: &[u8],
        ctx: &RequestContext,
    ) -> Result<IssuedToken, TokenError> {
        let event = AuditEvent::start(OperationType::Tokenize, ctx).vault_id(vault_id);
        let timeout = self.timeout(ctx);

        if plaintext.is_empty() {
            let err = TokenError::InvalidArgument {
                reason: "plaintext must not be empty".to_owned(),
            };
            return Err(self.fail(event, err).await);
        }

        let vault = match self.load_vault(vault_id, timeout).await {
            Ok(vault) => vault,
            Err(e) => return Err(self.fail(event, e).await),
        };
        let event = event.vault(&vault);

        let _shared = self.vaults.guards().shared(vault_id).await;
        if let Err(e) = self.vaults.reserve_token(vault_id, timeout).await {
            return Err(self.fail(event, e.into()).await);
        }

        let (value, record) = match self.issue(vault_id, plaintext, timeout).await {
            Ok(issued) => issued,
            Err(e) => {
                self.release_slot(vault_id, 1, timeout).await;
                return Err(self.fail(event, e).await);
            }
        };

        let event = event
            .token_ref(self.audit.token_ref(&value))
            .detail("key_version", record.payload.key_version);
        if let Err(e) = self.audit.success(event).await {
            match bounded("token.delete", timeout, self.tokens.delete(&record.token_hash)).await {
                Ok(_) => self.release_slot(vault_id, 1, timeout).await,
                Err(undo) => error!(
                    vault_id = %vault_id,
                    token_ref = record.reference(),
                    error = %undo,
                    "could not remove unaudited token"
                ),
            }
            return Err(e.into());
        }

        info!(vault_id = %vault_id, token_ref = record.reference(), "token issued");
        Ok(IssuedToken {
            token: value,
            vault_id,
            key_version: record.payload.key_version,
            expires_at: record.expires_at,
        })
    }

    async fn issue(
        &self,
        vault_id: VaultId,
        plaintext: &[u8],
        timeout: Duration,
    ) -> Result<(String, Token), TokenError> {
        let payload = self.encryption.encrypt(vault_id, plaintext).await?;
        let expires_at = self
            .settings
            .token_ttl
            .and_then(|ttl| chrono::Duration::from_std(ttl).ok())
            .map(|ttl| Utc::now() + ttl);

        let attempts = self.settings.max_generation_attempts;
        for _ in 0..attempts {
            let value = self.generator.generate(plaintext);
            if value.as_bytes() == plaintext {
                continue;
            }
            let record = Token::new(hash_token(&value), vault_id, payload.clone(), expires_at);
            if bounded("token.insert", timeout, self.tokens.insert(&record)).await? {
                return Ok((value, record));
            }
            warn!(vault_id = %vault_id, "token value collision, regenerating");
        }
        Err(TokenError::GenerationFailed { attempts })
    }

    async fn release_slot(&self, vault_id: VaultId, count: u64, timeout: Duration) {
        if let Err(e) = self.vaults.release_tokens(vault_id, count, timeout).await {
            error!(vault_id = %vault_id, count, error = %e, "could not release token counter");
        }
    }

    /// Return the plaintext behind `token`.
    ///
    /// # Errors
    ///
    /// - [`TokenError::NotFound`] if no such token exists.
    /// - [`TokenError::NotActive`] if the token is suspended.
    /// - [`TokenError::NotUsable`] if it is revoked or expired.
    /// - [`VaultError::NotActive`] (wrapped) if the vault is locked.
    /// - [`TokenError::Encryption`] if decryption fails.
    /// - [`TokenError::Audit`] if the access could not be audited; no
    ///   plaintext is returned.
    pub async fn detokenize(
        &self,
        token: &str,
        ctx: &RequestContext,
    ) -> Result<Zeroizing<Vec<u8>>, TokenError> {
        let token_hash = hash_token(token);
        let now = Utc::now();
        let recent = self.tracker.record(&token_hash, now).await;
        let event = AuditEvent::start(OperationType::Detokenize, ctx)
            .token_ref(self.audit.token_ref(token))
            .recent_accesses(recent);
        let timeout = self.timeout(ctx);

        let record = match self.load_token(&token_hash, timeout).await {
            Ok(record) => record,
            Err(e) => return Err(self.fail(event, e).await),
        };
        let event = event.vault_id(record.vault_id);
        let vault = match self.load_vault(record.vault_id, timeout).await {
            Ok(vault) => vault,
            Err(e) => return Err(self.fail(event, e).await),
        };
        let event = event.vault(&vault);
        if vault.status == VaultStatus::Locked {
            let err = VaultError::NotActive {
                vault_id: vault.id,
                status: vault.status,
            };
            return Err(self.fail(event, err.into()).await);
        }

        let _shared = self.vaults.guards().shared(vault.id).await;
        let (plaintext, previous_use) = match self.open(&token_hash, now, timeout).await {
            Ok(opened) => opened,
            Err(e) => return Err(self.fail(event, e).await),
        };

        if let Err(e) = self.audit.success(event).await {
            drop(plaintext);
            let restored = self
                .update_token(&token_hash, timeout, |t| {
                    t.use_count = t.use_count.saturating_sub(1);
                    if t.last_used_at == Some(now) {
                        t.last_used_at = previous_use;
                    }
                    Ok(())
                })
                .await;
            if let Err(undo) = restored {
                error!(
                    token_ref = hash_prefix(&token_hash),
                    error = %undo,
                    "could not roll back token usage after audit failure"
                );
            }
            return Err(e.into());
        }
        if recent > self.settings.detokenize_burst_threshold {
            warn!(
                vault_id = %vault.id,
                token_ref = hash_prefix(&token_hash),
                accesses = recent,
                "detokenize burst"
            );
        }
        Ok(plaintext)
    }

    /// Check, decrypt, then record the use. A concurrent status change
    /// between the read and the usage write is re-checked. Also returns the
    /// previous `last_used_at`.
    async fn open(
        &self,
        token_hash: &str,
        now: DateTime<Utc>,
        timeout: Duration,
    ) -> Result<(Zeroizing<Vec<u8>>, Option<DateTime<Utc>>), TokenError> {
        let record = self.load_token(token_hash, timeout).await?;
        ensure_usable(&record, now)?;
        let plaintext = self.encryption.decrypt(record.vault_id, &record.payload).await?;

        let mut current = record;
        for _ in 0..MAX_CAS_ATTEMPTS {
            let mut next = current.clone();
            next.last_used_at = Some(now);
            next.use_count = next.use_count.saturating_add(1);
            next.revision = next.revision.saturating_add(1);
            if bounded(
                "token.save_if_revision",
                timeout,
                self.tokens.save_if_revision(&next, current.revision),
            )
            .await?
            {
                return Ok((plaintext, current.last_used_at));
            }
            current = self.load_token(token_hash, timeout).await?;
            ensure_usable(&current, now)?;
        }
        Err(RepositoryError::Conflict {
            entity: "token",
            id: hash_prefix(token_hash).to_owned(),
            attempts: MAX_CAS_ATTEMPTS,
        }
        .into())
    }

    /// Revoke `token` permanently.
    ///
    /// # Errors
    ///
    /// - [`TokenError::NotFound`] if no such token exists.
    /// - [`TokenError::CannotBeRevoked`] if it is already revoked; nothing
    ///   changes.
    /// - [`TokenError::Audit`] if the revocation could not be audited; the
    ///   previous status is restored.
    pub async fn revoke(
        &self,
        token: &str,
        reason: &str,
        ctx: &RequestContext,
    ) -> Result<Token, TokenError> {
        let reason = reason.trim();
        if reason.len() > MAX_REASON_LEN {
            let event = AuditEvent::start(OperationType::Revoke, ctx)
                .token_ref(self.audit.token_ref(token));
            let err = TokenError::InvalidArgument {
                reason: format!("revocation reason longer than {MAX_REASON_LEN} bytes"),
            };
            return Err(self.fail(event, err).await);
        }
        let reason = (!reason.is_empty()).then(|| reason.to_owned());
        self.change_status(token, ctx, OperationType::Revoke, TokenStatus::Revoked, reason)
            .await
    }

    /// Suspend an active token.
    ///
    /// # Errors
    ///
    /// - [`TokenError::NotFound`] if no such token exists.
    /// - [`TokenError::InvalidTransition`] unless the token is active.
    /// - [`TokenError::Audit`] if the change could not be audited; the
    ///   previous status is restored.
    pub async fn suspend(&self, token: &str, ctx: &RequestContext) -> Result<Token, TokenError> {
        self.change_status(token, ctx, OperationType::Suspend, TokenStatus::NotActive, None)
            .await
    }

    /// Reactivate a suspended token.
    ///
    /// # Errors
    ///
    /// Same as [`suspend`](Self::suspend), requiring a suspended token.
    pub async fn reactivate(&self, token: &str, ctx: &RequestContext) -> Result<Token, TokenError> {
        self.change_status(token, ctx, OperationType::Reactivate, TokenStatus::Active, None)
            .await
    }

    async fn change_status(
        &self,
        token: &str,
        ctx: &RequestContext,
        operation: OperationType,
        to: TokenStatus,
        reason: Option<String>,
    ) -> Result<Token, TokenError> {
        let token_hash = hash_token(token);
        let event = AuditEvent::start(operation, ctx).token_ref(self.audit.token_ref(token));
        let timeout = self.timeout(ctx);

        let record = match self.load_token(&token_hash, timeout).await {
            Ok(record) => record,
            Err(e) => return Err(self.fail(event, e).await),
        };
        let mut event = event.vault_id(record.vault_id).detail("to", to);
        match bounded("vault.find_by_id", timeout, self.vaults.find_by_id(record.vault_id)).await {
            Ok(Some(vault)) => event = event.vault(&vault),
            Ok(None) => warn!(vault_id = %record.vault_id, "token references a missing vault"),
            Err(e) => warn!(
                vault_id = %record.vault_id,
                error = %e,
                "vault lookup failed, audit entry lacks vault details"
            ),
        }

        let previous = record.status;
        let updated = match self
            .update_token(&token_hash, timeout, |t| {
                if to == TokenStatus::Revoked && t.status == TokenStatus::Revoked {
                    return Err(TokenError::CannotBeRevoked {
                        token_ref: t.reference().to_owned(),
                    });
                }
                if !t.status.can_transition_to(to) {
                    return Err(TokenError::InvalidTransition {
                        token_ref: t.reference().to_owned(),
                        from: t.status,
                        to,
                    });
                }
                t.status = to;
                if to == TokenStatus::Revoked {
                    t.revoked_at = Some(Utc::now());
                    t.revocation_reason.clone_from(&reason);
                }
                Ok(())
            })
            .await
        {
            Ok(token) => token,
            Err(e) => return Err(self.fail(event, e).await),
        };

        let event = event.detail("from", previous);
        if let Err(e) = self.audit.success(event).await {
            let restored = self
                .update_token(&token_hash, timeout, |t| {
                    t.status = previous;
                    if to == TokenStatus::Revoked {
                        t.revoked_at = None;
                        t.revocation_reason = None;
                    }
                    Ok(())
                })
                .await;
            if let Err(undo) = restored {
                error!(
                    token_ref = hash_prefix(&token_hash),
                    error = %undo,
                    "could not restore token status after audit failure"
                );
            }
            return Err(e.into());
        }

        info!(
            vault_id = %updated.vault_id,
            token_ref = updated.reference(),
            from = %previous,
            to = %to,
            "token status changed"
        );
        Ok(updated)
    }

    /// Read-modify-write a token under its revision.
    async fn update_token<F>(
        &self,
        token_hash: &str,
        timeout: Duration,
        apply: F,
    ) -> Result<Token, TokenError>
    where
        F: Fn(&mut Token) -> Result<(), TokenError> + Send + Sync,
    {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let current = self.load_token(token_hash, timeout).await?;
            let mut next = current.clone();
            apply(&mut next)?;
            next.revision = next.revision.saturating_add(1);
            if bounded(
                "token.save_if_revision",
                timeout,
                self.tokens.save_if_revision(&next, current.revision),
            )
            .await?
            {
                return Ok(next);
            }
        }
        Err(RepositoryError::Conflict {
            entity: "token",
            id: hash_prefix(token_hash).to_owned(),
            attempts: MAX_CAS_ATTEMPTS,
        }
        .into())
    }

    /// Permanently delete `vault_id`'s tokens revoked before `before` and
    /// give their counter slots back. Returns how many were purged.
    ///
    /// # Errors
    ///
    /// - [`VaultError::NotFound`] (wrapped) if the vault does not exist.
    /// - [`TokenError::Repository`] if deletion fails.
    /// - [`TokenError::Audit`] if the purge could not be audited; the
    ///   records are re-inserted.
    pub async fn purge_revoked(
        &self,
        vault_id: VaultId,
        before: DateTime<Utc>,
        ctx: &RequestContext,
    ) -> Result<usize, TokenError> {
        let event = AuditEvent::start(OperationType::PurgeTokens, ctx).vault_id(vault_id);
        let timeout = self.timeout(ctx);

        let vault = match self.load_vault(vault_id, timeout).await {
            Ok(vault) => vault,
            Err(e) => return Err(self.fail(event, e).await),
        };
        let event = event.vault(&vault).detail("before", before.to_rfc3339());

        let purged = match self.delete_revoked(vault_id, before, timeout).await {
            Ok(purged) => purged,
            Err(e) => return Err(self.fail(event, e).await),
        };

        let count = purged.len();
        if let Err(e) = self.audit.success(event.detail("purged", count)).await {
            for token in &purged {
                if let Err(undo) = bounded("token.insert", timeout, self.tokens.insert(token)).await {
                    error!(token_ref = token.reference(), error = %undo, "could not restore purged token");
                }
            }
            return Err(e.into());
        }

        if count > 0 {
            self.release_slot(vault_id, u64::try_from(count).unwrap_or(u64::MAX), timeout)
                .await;
            info!(vault_id = %vault_id, purged = count, "revoked tokens purged");
        }
        Ok(count)
    }

    async fn delete_revoked(
        &self,
        vault_id: VaultId,
        before: DateTime<Utc>,
        timeout: Duration,
    ) -> Result<Vec<Token>, TokenError> {
        let candidates = bounded(
            "token.find_revoked_before",
            timeout,
            self.tokens.find_revoked_before(vault_id, before),
        )
        .await?;
        let mut purged = Vec::with_capacity(candidates.len());
        for token in candidates {
            if bounded("token.delete", timeout, self.tokens.delete(&token.token_hash)).await? {
                purged.push(token);
            }
        }
        Ok(purged)
    }
}

impl std::fmt::Debug for TokenizationService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenizationService")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

fn ensure_usable(token: &Token, now: DateTime<Utc>) -> Result<(), TokenError> {
    match token.status {
        TokenStatus::Revoked => Err(TokenError::NotUsable {
            token_ref: token.reference().to_owned(),
            reason: "revoked",
        }),
        TokenStatus::NotActive => Err(TokenError::NotActive {
            token_ref: token.reference().to_owned(),
            status: token.status,
        }),
        TokenStatus::Active if token.is_expired(now) => Err(TokenError::NotUsable {
            token_ref: token.reference().to_owned(),
            reason: "expired",
        }),
        TokenStatus::Active => Ok(()),
    }
}
