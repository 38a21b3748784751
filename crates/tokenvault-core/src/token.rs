//! Token entity, lifecycle rules and token-value generation.
//!
//! # Security model
//!
//! - Token values are never stored. Records are keyed by `SHA-256(token)`;
//!   the caller presents the token and we hash it for lookup.
//! - Random tokens carry 32 base62 characters (~190 bits) from the OS CSPRNG.
//! - Format-preserving tokens keep the input's length, separators and last
//!   few digits, randomise the rest, never pass the Luhn check and never
//!   equal the input, so a token cannot be mistaken for a real card number.
//! - Revocation is terminal. Revoked records are kept (not erased) until an
//!   explicit purge, so audit entries keep pointing at something.

use std::fmt;

use chrono::{DateTime, Utc};
use rand::Rng;
use rand::distributions::Alphanumeric;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

use crate::crypto;
use crate::encryption::EncryptedPayload;
use crate::id::VaultId;

/// Prefix of random-format tokens.
pub const RANDOM_TOKEN_PREFIX: &str = "tok_";

/// Length of the random part of a random-format token.
const RANDOM_TOKEN_LEN: usize = 32;

/// Fresh draws tried before a format-preserving token falls back to random.
const FORMAT_PRESERVING_DRAWS: usize = 16;

/// Lifecycle state of a token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenStatus {
    Active,
    /// Suspended; can be reactivated.
    NotActive,
    /// Terminal.
    Revoked,
}

impl TokenStatus {
    /// Whether the lifecycle allows moving from `self` to `to`.
    #[must_use]
    pub const fn can_transition_to(self, to: Self) -> bool {
        matches!(
            (self, to),
            (Self::Active, Self::NotActive)
                | (Self::NotActive, Self::Active)
                | (Self::Active | Self::NotActive, Self::Revoked)
        )
    }
}

impl fmt::Display for TokenStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Active => "active",
            Self::NotActive => "not_active",
            Self::Revoked => "revoked",
        })
    }
}

/// A stored token record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Token {
    /// SHA-256 of the token value (hex). This is the storage key.
    pub token_hash: String,
    pub vault_id: VaultId,
    pub payload: EncryptedPayload,
    pub status: TokenStatus,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub use_count: u64,
    pub revoked_at: Option<DateTime<Utc>>,
    pub revocation_reason: Option<String>,
    /// Bumped on every update; guards concurrent writers.
    pub revision: u64,
}

impl Token {
    /// A fresh active token record.
    #[must_use]
    pub fn new(
        token_hash: String,
        vault_id: VaultId,
        payload: EncryptedPayload,
        expires_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            token_hash,
            vault_id,
            payload,
            status: TokenStatus::Active,
            created_at: Utc::now(),
            last_used_at: None,
            expires_at,
            use_count: 0,
            revoked_at: None,
            revocation_reason: None,
            revision: 0,
        }
    }

    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    /// Short, non-reversible reference for logs and error context.
    #[must_use]
    pub fn reference(&self) -> &str {
        hash_prefix(&self.token_hash)
    }
}

/// SHA-256 storage key of a token value.
#[must_use]
pub fn hash_token(token: &str) -> String {
    crypto::sha256_hex(token.as_bytes())
}

/// First 8 characters of a token hash.
#[must_use]
pub fn hash_prefix(token_hash: &str) -> &str {
    token_hash.get(..8).unwrap_or(token_hash)
}

/// How token values are shaped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenFormat {
    /// `tok_` followed by 32 base62 characters.
    Random,
    /// Same shape as a numeric input, keeping its last `keep_last` digits.
    FormatPreserving { keep_last: u8 },
}

impl TokenFormat {
    /// Parse `random`, `format_preserving` or `format_preserving:<n>`.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "random" => Some(Self::Random),
            "format_preserving" => Some(Self::FormatPreserving { keep_last: 4 }),
            other => other
                .strip_prefix("format_preserving:")
                .and_then(|n| n.parse().ok())
                .map(|keep_last| Self::FormatPreserving { keep_last }),
        }
    }
}

/// Pluggable token-value policy.
pub trait TokenGenerator: Send + Sync {
    /// Produce a candidate token for `plaintext`. Uniqueness is checked by
    /// the caller.
    fn generate(&self, plaintext: &[u8]) -> String;
}

/// Default generator driven by [`TokenFormat`].
#[derive(Debug, Clone, Copy)]
pub struct DefaultTokenGenerator {
    format: TokenFormat,
}

impl DefaultTokenGenerator {
    #[must_use]
    pub const fn new(format: TokenFormat) -> Self {
        Self { format }
    }

    fn random() -> String {
        let body: String = OsRng
            .sample_iter(&Alphanumeric)
            .take(RANDOM_TOKEN_LEN)
            .map(char::from)
            .collect();
        format!("{RANDOM_TOKEN_PREFIX}{body}")
    }

    fn format_preserving(plaintext: &[u8], keep_last: usize) -> Option<String> {
        let input = std::str::from_utf8(plaintext).ok()?;
        if !input
            .bytes()
            .all(|b| b.is_ascii_digit() || b == b' ' || b == b'-')
        {
            return None;
        }
        let digits: Vec<u8> = input.bytes().filter(u8::is_ascii_digit).collect();
        // Too short to hide anything.
        if digits.len() < keep_last.saturating_add(4) {
            return None;
        }
        let randomised = digits.len().saturating_sub(keep_last);

        for _ in 0..FORMAT_PRESERVING_DRAWS {
            let mut candidate = digits.clone();
            for digit in candidate.iter_mut().take(randomised) {
                *digit = b'0'.saturating_add(OsRng.gen_range(0..10));
            }
            if candidate != digits && !luhn_valid(&candidate) {
                return Some(reshape(input, &candidate));
            }
        }
        None
    }
}

impl TokenGenerator for DefaultTokenGenerator {
    fn generate(&self, plaintext: &[u8]) -> String {
        match self.format {
            TokenFormat::Random => Self::random(),
            TokenFormat::FormatPreserving { keep_last } => {
                Self::format_preserving(plaintext, usize::from(keep_last))
                    .unwrap_or_else(Self::random)
            }
        }
    }
}

/// Put `digits` back into the separator layout of `template`.
fn reshape(template: &str, digits: &[u8]) -> String {
    let mut next = digits.iter();
    template
        .bytes()
        .map(|b| {
            if b.is_ascii_digit() {
                next.next().copied().map_or('0', char::from)
            } else {
                char::from(b)
            }
        })
        .collect()
}

/// Luhn mod-10 check over ASCII digits.
#[must_use]
pub fn luhn_valid(digits: &[u8]) -> bool {
    let sum: u32 = digits
        .iter()
        .rev()
        .enumerate()
        .map(|(i, b)| {
            let d = u32::from(b.saturating_sub(b'0'));
            if i % 2 == 1 {
                let doubled = d.saturating_mul(2);
                if doubled > 9 { doubled.saturating_sub(9) } else { doubled }
            } else {
                d
            }
        })
        .sum();
    sum % 10 == 0
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const CARD: &str = "4111 1111 1111 1111";

    #[test]
    fn lifecycle_rules() {
        use TokenStatus::{Active, NotActive, Revoked};
        assert!(Active.can_transition_to(NotActive));
        assert!(NotActive.can_transition_to(Active));
        assert!(Active.can_transition_to(Revoked));
        assert!(NotActive.can_transition_to(Revoked));
        assert!(!Revoked.can_transition_to(Active));
        assert!(!Revoked.can_transition_to(Revoked));
        assert!(!Active.can_transition_to(Active));
    }

    #[test]
    fn random_tokens_have_prefix_and_base62_body() {
        let token = DefaultTokenGenerator::new(TokenFormat::Random).generate(b"anything");
        let body = token.strip_prefix(RANDOM_TOKEN_PREFIX).unwrap();
        assert_eq!(body.len(), 32);
        assert!(body.bytes().all(|b| b.is_ascii_alphanumeric()));
    }

    #[test]
    fn format_preserving_keeps_shape_and_last_digits() {
        let generator = DefaultTokenGenerator::new(TokenFormat::FormatPreserving { keep_last: 4 });
        for _ in 0..50 {
            let token = generator.generate(CARD.as_bytes());
            assert_eq!(token.len(), CARD.len());
            assert_ne!(token, CARD);
            assert!(token.ends_with("1111"));
            assert_eq!(
                token.char_indices().filter(|(_, c)| *c == ' ').map(|(i, _)| i).collect::<Vec<_>>(),
                vec![4, 9, 14]
            );
            let digits: Vec<u8> = token.bytes().filter(u8::is_ascii_digit).collect();
            assert!(!luhn_valid(&digits));
        }
    }

    #[test]
    fn format_preserving_falls_back_to_random_for_unsuitable_input() {
        let generator = DefaultTokenGenerator::new(TokenFormat::FormatPreserving { keep_last: 4 });
        assert!(generator.generate(b"alice@example.com").starts_with(RANDOM_TOKEN_PREFIX));
        assert!(generator.generate(b"123").starts_with(RANDOM_TOKEN_PREFIX));
    }

    #[test]
    fn luhn_reference_values() {
        assert!(luhn_valid(b"4111111111111111"));
        assert!(luhn_valid(b"79927398713"));
        assert!(!luhn_valid(b"79927398710"));
    }

    #[test]
    fn token_format_parsing() {
        assert_eq!(TokenFormat::parse("random"), Some(TokenFormat::Random));
        assert_eq!(
            TokenFormat::parse("format_preserving"),
            Some(TokenFormat::FormatPreserving { keep_last: 4 })
        );
        assert_eq!(
            TokenFormat::parse("FORMAT_PRESERVING:6"),
            Some(TokenFormat::FormatPreserving { keep_last: 6 })
        );
        assert_eq!(TokenFormat::parse("uuid"), None);
    }

    #[test]
    fn expiry_and_reference() {
        let mut token = Token::new(
            hash_token("tok_x"),
            VaultId::new(),
            EncryptedPayload {
                key_version: 1,
                wrapped_key: String::new(),
                ciphertext: String::new(),
            },
            None,
        );
        assert!(!token.is_expired(Utc::now()));
        token.expires_at = Some(Utc::now() - chrono::Duration::seconds(1));
        assert!(token.is_expired(Utc::now()));
        assert_eq!(token.reference().len(), 8);
    }
}
