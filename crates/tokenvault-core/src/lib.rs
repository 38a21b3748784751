//! Core library for `TokenVault`.
//!
//! Contains the encryption barrier, per-vault keyrings with envelope
//! encryption, the vault and token lifecycles, token generation, risk
//! scoring, and the fail-closed audit trail. This crate depends on
//! `tokenvault-storage` for the storage backend trait and knows nothing about
//! how it is exposed to callers.
//!
//! The entry points are [`vault::VaultService`],
//! [`tokenization::TokenizationService`] and [`audit::AuditLogService`].

pub mod audit;
pub mod audit_file;
pub mod barrier;
pub mod context;
pub mod crypto;
pub mod encryption;
pub mod error;
pub mod id;
pub mod keyring;
pub mod repository;
pub mod risk;
pub mod settings;
pub mod token;
pub mod tokenization;
pub mod vault;
