#![allow(clippy::unwrap_used)]

mod common;

use std::time::Duration;

use chrono::Utc;
use common::{Harness, ctx};
use tokenvault_core::audit::OperationType;
use tokenvault_core::error::{AuditError, DomainError, ErrorCode, TokenError, VaultError};
use tokenvault_core::id::VaultId;
use tokenvault_core::risk::RiskLevel;
use tokenvault_core::settings::{AuditSettings, TokenizationSettings};
use tokenvault_core::token::{RANDOM_TOKEN_PREFIX, TokenFormat, TokenStatus, hash_token, luhn_valid};
use tokenvault_core::vault::{DataType, VaultStatus};

const CARD: &str = "4111 1111 1111 1111";

#[tokio::test]
async fn tokenize_then_detokenize_returns_plaintext() {
    let h = Harness::new().await;
    let vault = h.vault("cards", DataType::CardNumber, None).await;

    let issued = h.tokens.tokenize(vault.id, CARD.as_bytes(), &ctx()).await.unwrap();
    assert!(issued.token.starts_with(RANDOM_TOKEN_PREFIX));
    assert_eq!(issued.key_version, 1);

    let plaintext = h.tokens.detokenize(&issued.token, &ctx()).await.unwrap();
    assert_eq!(plaintext.as_slice(), CARD.as_bytes());

    let vault = h.vaults.find_by_id_or_fail(vault.id).await.unwrap();
    assert_eq!(vault.token_count, 1);

    let record = h.token_repo.find_by_hash(&hash_token(&issued.token)).await.unwrap().unwrap();
    assert_eq!(record.use_count, 1);
    assert!(record.last_used_at.is_some());
    assert!(!record.payload.ciphertext.contains("4111"));
}

#[tokio::test]
async fn same_plaintext_gets_distinct_tokens() {
    let h = Harness::new().await;
    let vault = h.vault("emails", DataType::Email, None).await;

    let a = h.tokens.tokenize(vault.id, b"alice@example.com", &ctx()).await.unwrap();
    let b = h.tokens.tokenize(vault.id, b"alice@example.com", &ctx()).await.unwrap();
    assert_ne!(a.token, b.token);
}

#[tokio::test]
async fn format_preserving_tokens_keep_shape() {
    let settings = TokenizationSettings {
        token_format: TokenFormat::FormatPreserving { keep_last: 4 },
        ..TokenizationSettings::default()
    };
    let h = Harness::with_settings(settings, AuditSettings::default()).await;
    let vault = h.vault("cards", DataType::CardNumber, None).await;

    let issued = h.tokens.tokenize(vault.id, CARD.as_bytes(), &ctx()).await.unwrap();
    assert_eq!(issued.token.len(), CARD.len());
    assert!(issued.token.ends_with("1111"));
    assert_ne!(issued.token, CARD);
    let digits: Vec<u8> = issued
        .token
        .bytes()
        .filter(u8::is_ascii_digit)
        .collect();
    assert!(!luhn_valid(&digits));

    let plaintext = h.tokens.detokenize(&issued.token, &ctx()).await.unwrap();
    assert_eq!(plaintext.as_slice(), CARD.as_bytes());
}

#[tokio::test]
async fn empty_plaintext_is_rejected_and_audited() {
    let h = Harness::new().await;
    let vault = h.vault("generic", DataType::Generic, None).await;

    let err = h.tokens.tokenize(vault.id, b"", &ctx()).await.unwrap_err();
    assert!(matches!(err, TokenError::InvalidArgument { .. }));

    let entries = h.entries(OperationType::Tokenize).await;
    assert_eq!(entries.len(), 1);
    assert!(!entries[0].success);
    assert_eq!(entries[0].error_code, Some(ErrorCode::InvalidArgument));
    assert_eq!(h.vaults.find_by_id_or_fail(vault.id).await.unwrap().token_count, 0);
}

#[tokio::test]
async fn unknown_vault_is_not_found() {
    let h = Harness::new().await;
    let err = h.tokens.tokenize(VaultId::new(), b"x", &ctx()).await.unwrap_err();
    assert!(matches!(err, TokenError::Vault(VaultError::NotFound { .. })));
    assert_eq!(err.code(), ErrorCode::VaultNotFound);
}

#[tokio::test]
async fn token_limit_is_never_exceeded() {
    let h = Harness::new().await;
    let vault = h.vault("small", DataType::Phone, Some(2)).await;

    h.tokens.tokenize(vault.id, b"555-0100", &ctx()).await.unwrap();
    h.tokens.tokenize(vault.id, b"555-0101", &ctx()).await.unwrap();
    let err = h.tokens.tokenize(vault.id, b"555-0102", &ctx()).await.unwrap_err();
    assert!(matches!(
        err,
        TokenError::Vault(VaultError::TokenLimitExceeded { limit: 2, .. })
    ));

    let vault = h.vaults.find_by_id_or_fail(vault.id).await.unwrap();
    assert_eq!(vault.token_count, 2);
    assert_eq!(h.token_repo.find_by_vault(vault.id).await.unwrap().len(), 2);
}

#[tokio::test]
async fn concurrent_tokenize_respects_limit() {
    let h = Harness::new().await;
    let vault = h.vault("race", DataType::Generic, Some(5)).await;

    let mut tasks = Vec::new();
    for i in 0..20 {
        let tokens = std::sync::Arc::clone(&h.tokens);
        tasks.push(tokio::spawn(async move {
            tokens
                .tokenize(vault.id, format!("value-{i}").as_bytes(), &ctx())
                .await
        }));
    }
    let mut issued = 0;
    for task in tasks {
        if task.await.unwrap().is_ok() {
            issued += 1;
        }
    }

    assert_eq!(issued, 5);
    let vault = h.vaults.find_by_id_or_fail(vault.id).await.unwrap();
    assert_eq!(vault.token_count, 5);
    assert_eq!(h.token_repo.find_by_vault(vault.id).await.unwrap().len(), 5);
}

#[tokio::test]
async fn locked_vault_blocks_tokenize_and_detokenize() {
    let h = Harness::new().await;
    let vault = h.vault("cards", DataType::CardNumber, None).await;
    let issued = h.tokens.tokenize(vault.id, CARD.as_bytes(), &ctx()).await.unwrap();

    h.vaults.update_status(vault.id, VaultStatus::Locked, &ctx()).await.unwrap();

    let err = h.tokens.tokenize(vault.id, CARD.as_bytes(), &ctx()).await.unwrap_err();
    assert!(matches!(err, TokenError::Vault(VaultError::NotActive { .. })));
    let err = h.tokens.detokenize(&issued.token, &ctx()).await.unwrap_err();
    assert!(matches!(err, TokenError::Vault(VaultError::NotActive { .. })));
}

#[tokio::test]
async fn retired_vault_still_detokenizes() {
    let h = Harness::new().await;
    let vault = h.vault("legacy", DataType::BankAccount, None).await;
    let issued = h.tokens.tokenize(vault.id, b"DE89370400440532013000", &ctx()).await.unwrap();

    h.vaults.soft_delete(vault.id, &ctx()).await.unwrap();

    let plaintext = h.tokens.detokenize(&issued.token, &ctx()).await.unwrap();
    assert_eq!(plaintext.as_slice(), b"DE89370400440532013000");
    assert!(h.tokens.tokenize(vault.id, b"x", &ctx()).await.is_err());
}

#[tokio::test]
async fn unknown_token_is_not_found() {
    let h = Harness::new().await;
    let err = h.tokens.detokenize("tok_doesnotexist", &ctx()).await.unwrap_err();
    assert!(matches!(err, TokenError::NotFound { .. }));
    assert!(!err.to_string().contains("tok_doesnotexist"));
}

#[tokio::test]
async fn revoke_twice_fails_and_revoked_token_is_unusable() {
    let h = Harness::new().await;
    let vault = h.vault("cards", DataType::CardNumber, None).await;
    let issued = h.tokens.tokenize(vault.id, CARD.as_bytes(), &ctx()).await.unwrap();

    let revoked = h.tokens.revoke(&issued.token, "card replaced", &ctx()).await.unwrap();
    assert_eq!(revoked.status, TokenStatus::Revoked);
    assert!(revoked.revoked_at.is_some());
    assert_eq!(revoked.revocation_reason.as_deref(), Some("card replaced"));

    let err = h.tokens.revoke(&issued.token, "again", &ctx()).await.unwrap_err();
    assert!(matches!(err, TokenError::CannotBeRevoked { .. }));

    let err = h.tokens.detokenize(&issued.token, &ctx()).await.unwrap_err();
    assert!(matches!(err, TokenError::NotUsable { reason: "revoked", .. }));

    let record = h.token_repo.find_by_hash(&hash_token(&issued.token)).await.unwrap().unwrap();
    assert_eq!(record.revocation_reason.as_deref(), Some("card replaced"));
}

#[tokio::test]
async fn suspend_and_reactivate() {
    let h = Harness::new().await;
    let vault = h.vault("ids", DataType::NationalId, None).await;
    let issued = h.tokens.tokenize(vault.id, b"123-45-6789", &ctx()).await.unwrap();

    h.tokens.suspend(&issued.token, &ctx()).await.unwrap();
    let err = h.tokens.detokenize(&issued.token, &ctx()).await.unwrap_err();
    assert!(matches!(
        err,
        TokenError::NotActive {
            status: TokenStatus::NotActive,
            ..
        }
    ));
    let err = h.tokens.suspend(&issued.token, &ctx()).await.unwrap_err();
    assert!(matches!(err, TokenError::InvalidTransition { .. }));

    h.tokens.reactivate(&issued.token, &ctx()).await.unwrap();
    assert!(h.tokens.detokenize(&issued.token, &ctx()).await.is_ok());

    h.tokens.revoke(&issued.token, "", &ctx()).await.unwrap();
    let err = h.tokens.reactivate(&issued.token, &ctx()).await.unwrap_err();
    assert!(matches!(err, TokenError::InvalidTransition { .. }));
}

#[tokio::test]
async fn expired_token_is_unusable() {
    let settings = TokenizationSettings {
        token_ttl: Some(Duration::ZERO),
        ..TokenizationSettings::default()
    };
    let h = Harness::with_settings(settings, AuditSettings::default()).await;
    let vault = h.vault("short", DataType::Generic, None).await;
    let issued = h.tokens.tokenize(vault.id, b"ephemeral", &ctx()).await.unwrap();
    assert!(issued.expires_at.is_some());

    let err = h.tokens.detokenize(&issued.token, &ctx()).await.unwrap_err();
    assert!(matches!(err, TokenError::NotUsable { reason: "expired", .. }));
}

#[tokio::test]
async fn purge_removes_revoked_and_frees_capacity() {
    let h = Harness::new().await;
    let vault = h.vault("purge", DataType::Generic, Some(2)).await;
    let a = h.tokens.tokenize(vault.id, b"a", &ctx()).await.unwrap();
    let b = h.tokens.tokenize(vault.id, b"b", &ctx()).await.unwrap();
    h.tokens.revoke(&a.token, "done", &ctx()).await.unwrap();

    let purged = h
        .tokens
        .purge_revoked(vault.id, Utc::now() + chrono::Duration::seconds(1), &ctx())
        .await
        .unwrap();
    assert_eq!(purged, 1);

    let vault = h.vaults.find_by_id_or_fail(vault.id).await.unwrap();
    assert_eq!(vault.token_count, 1);
    assert!(h.tokens.detokenize(&b.token, &ctx()).await.is_ok());
    assert!(matches!(
        h.tokens.detokenize(&a.token, &ctx()).await.unwrap_err(),
        TokenError::NotFound { .. }
    ));
    h.tokens.tokenize(vault.id, b"c", &ctx()).await.unwrap();
}

#[tokio::test]
async fn every_call_writes_exactly_one_entry() {
    let h = Harness::new().await;
    let vault = h.vault("cards", DataType::CardNumber, None).await;
    let issued = h.tokens.tokenize(vault.id, CARD.as_bytes(), &ctx()).await.unwrap();
    h.tokens.detokenize(&issued.token, &ctx()).await.unwrap();
    h.tokens.detokenize("tok_missing", &ctx()).await.unwrap_err();
    h.tokens.revoke(&issued.token, "lost", &ctx()).await.unwrap();
    h.tokens.revoke(&issued.token, "lost", &ctx()).await.unwrap_err();

    assert_eq!(h.entries(OperationType::Tokenize).await.len(), 1);
    assert_eq!(h.entries(OperationType::Detokenize).await.len(), 2);
    let revokes = h.entries(OperationType::Revoke).await;
    assert_eq!(revokes.len(), 2);
    assert_eq!(revokes.iter().filter(|e| e.success).count(), 1);
    assert!(
        revokes
            .iter()
            .any(|e| e.error_code == Some(ErrorCode::TokenCannotBeRevoked))
    );
}

#[tokio::test]
async fn audit_entries_hold_no_plaintext_or_token() {
    let h = Harness::new().await;
    let vault = h.vault("cards", DataType::CardNumber, None).await;
    let issued = h.tokens.tokenize(vault.id, CARD.as_bytes(), &ctx()).await.unwrap();
    h.tokens.detokenize(&issued.token, &ctx()).await.unwrap();

    for entry in h.logs.find_by_vault(vault.id, 100).await.unwrap() {
        let json = serde_json::to_string(&entry).unwrap();
        assert!(!json.contains("4111"));
        assert!(!json.contains(&issued.token));
        assert!(entry.pci_relevant);
        assert_eq!(entry.actor.as_deref(), Some("payments-api"));
    }

    let detokenize = &h.entries(OperationType::Detokenize).await[0];
    let token_ref = detokenize.token_ref.as_deref().unwrap();
    assert_eq!(token_ref.len(), 64);
    assert_ne!(token_ref, hash_token(&issued.token));
    assert_eq!(detokenize.risk_level, RiskLevel::Medium);
}

#[tokio::test]
async fn detokenize_burst_is_high_risk() {
    let settings = TokenizationSettings {
        detokenize_burst_threshold: 3,
        ..TokenizationSettings::default()
    };
    let h = Harness::with_settings(settings, AuditSettings::default()).await;
    let vault = h.vault("emails", DataType::Email, None).await;
    let issued = h.tokens.tokenize(vault.id, b"bob@example.com", &ctx()).await.unwrap();

    for _ in 0..4 {
        h.tokens.detokenize(&issued.token, &ctx()).await.unwrap();
    }
    let entries = h.entries(OperationType::Detokenize).await;
    assert_eq!(entries[0].risk_level, RiskLevel::High);
    assert_eq!(entries[3].risk_level, RiskLevel::Medium);

    let high = h
        .logs
        .find_high_risk_operations(Utc::now() - chrono::Duration::minutes(1))
        .await
        .unwrap();
    let bursts: Vec<_> = high
        .iter()
        .filter(|e| e.operation == OperationType::Detokenize)
        .collect();
    assert_eq!(bursts.len(), 1);
}

#[tokio::test]
async fn tokenize_is_undone_when_audit_fails() {
    let h = Harness::new().await;
    let vault = h.vault("cards", DataType::CardNumber, None).await;

    h.audit_repo.set_failing(true);
    let err = h.tokens.tokenize(vault.id, CARD.as_bytes(), &ctx()).await.unwrap_err();
    assert!(matches!(err, TokenError::Audit(AuditError::WriteFailed { .. })));
    assert_eq!(err.code(), ErrorCode::AuditWriteFailed);

    let vault = h.vaults.find_by_id_or_fail(vault.id).await.unwrap();
    assert_eq!(vault.token_count, 0);
    assert!(h.token_repo.find_by_vault(vault.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn detokenize_withholds_plaintext_when_audit_fails() {
    let h = Harness::new().await;
    let vault = h.vault("cards", DataType::CardNumber, None).await;
    let issued = h.tokens.tokenize(vault.id, CARD.as_bytes(), &ctx()).await.unwrap();

    h.audit_repo.set_failing(true);
    let err = h.tokens.detokenize(&issued.token, &ctx()).await.unwrap_err();
    assert!(matches!(err, TokenError::Audit(_)));

    let record = h.token_repo.find_by_hash(&hash_token(&issued.token)).await.unwrap().unwrap();
    assert_eq!(record.use_count, 0);
    assert!(record.last_used_at.is_none());

    h.audit_repo.set_failing(false);
    assert!(h.tokens.detokenize(&issued.token, &ctx()).await.is_ok());
    let record = h.token_repo.find_by_hash(&hash_token(&issued.token)).await.unwrap().unwrap();
    assert_eq!(record.use_count, 1);
    assert!(record.last_used_at.is_some());
}

#[tokio::test]
async fn suspend_is_audited_when_vault_lookup_fails() {
    let h = Harness::new().await;
    let vault = h.vault("cards", DataType::CardNumber, None).await;
    let issued = h.tokens.tokenize(vault.id, CARD.as_bytes(), &ctx()).await.unwrap();

    h.vault_repo.set_failing_lookups(true);
    let suspended = h.tokens.suspend(&issued.token, &ctx()).await.unwrap();
    assert_eq!(suspended.status, TokenStatus::NotActive);
    h.vault_repo.set_failing_lookups(false);

    let entries = h.entries(OperationType::Suspend).await;
    assert_eq!(entries.len(), 1);
    assert!(entries[0].success);
    assert_eq!(entries[0].vault_id, Some(vault.id));
    assert!(!entries[0].pci_relevant);
}

#[tokio::test]
async fn revoke_is_undone_when_audit_fails() {
    let h = Harness::new().await;
    let vault = h.vault("cards", DataType::CardNumber, None).await;
    let issued = h.tokens.tokenize(vault.id, CARD.as_bytes(), &ctx()).await.unwrap();

    h.audit_repo.set_failing(true);
    let err = h.tokens.revoke(&issued.token, "fraud", &ctx()).await.unwrap_err();
    assert!(matches!(err, TokenError::Audit(_)));

    let record = h.token_repo.find_by_hash(&hash_token(&issued.token)).await.unwrap().unwrap();
    assert_eq!(record.status, TokenStatus::Active);
    assert!(record.revoked_at.is_none());
    assert!(record.revocation_reason.is_none());
}

#[tokio::test]
async fn purge_is_undone_when_audit_fails() {
    let h = Harness::new().await;
    let vault = h.vault("purge", DataType::Generic, None).await;
    let issued = h.tokens.tokenize(vault.id, b"a", &ctx()).await.unwrap();
    h.tokens.revoke(&issued.token, "", &ctx()).await.unwrap();

    h.audit_repo.set_failing(true);
    let err = h
        .tokens
        .purge_revoked(vault.id, Utc::now() + chrono::Duration::seconds(1), &ctx())
        .await
        .unwrap_err();
    assert!(matches!(err, TokenError::Audit(_)));

    assert!(h.token_repo.find_by_hash(&hash_token(&issued.token)).await.unwrap().is_some());
    assert_eq!(h.vaults.find_by_id_or_fail(vault.id).await.unwrap().token_count, 1);
}
