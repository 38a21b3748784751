//! `TokenVault` daemon.
//!
//! Wires the core library and a storage backend into a running process:
//! environment configuration, process hardening, service construction, and
//! the key-rotation and audit-retention background workers.

pub mod config;
pub mod hardening;
pub mod state;
pub mod workers;
