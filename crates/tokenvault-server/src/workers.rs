//! Background workers: scheduled key rotation and audit retention.
//!
//! Each worker ticks on a fixed interval until the shutdown channel fires.
//! If storage is unreachable, the tick's scan is retried with exponential
//! backoff (1s, 2s, 4s) before giving up until the next tick. Consecutive
//! failed ticks escalate from `warn!` to `error!`.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use tokenvault_core::audit::{AuditLogService, RetentionReport};
use tokenvault_core::context::RequestContext;
use tokenvault_core::vault::{Vault, VaultService};

use crate::state::AppState;

/// Maximum retries per tick when the storage backend is unreachable.
const SCAN_MAX_RETRIES: u32 = 3;

/// Failed ticks in a row before the worker logs at error level.
const ESCALATE_AFTER: u32 = 5;

/// Actor label recorded on audit entries written by the rotation sweep.
pub const ROTATION_ACTOR: &str = "key-rotation-sweep";

/// Outcome of rotating the vaults found due.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub due: usize,
    pub rotated: usize,
    pub failed: usize,
}

#[derive(Debug, Default)]
struct FailureStreak(u32);

impl FailureStreak {
    fn reset(&mut self) {
        self.0 = 0;
    }

    fn record(&mut self, worker: &'static str, err: &str) {
        self.0 = self.0.saturating_add(1);
        if self.0 >= ESCALATE_AFTER {
            error!(
                worker,
                error = %err,
                consecutive_failures = self.0,
                "scan persistently failing, storage may be down"
            );
        } else {
            warn!(
                worker,
                error = %err,
                consecutive_failures = self.0,
                retries = SCAN_MAX_RETRIES,
                "scan failed after retries, will retry next tick"
            );
        }
    }
}

/// Sleep for the backoff of `attempt`. Returns `false` if shutdown was
/// signalled first.
async fn backoff(attempt: u32, shutdown: &mut watch::Receiver<bool>) -> bool {
    let delay = Duration::from_secs(1u64 << attempt);
    tokio::select! {
        () = tokio::time::sleep(delay) => true,
        _ = shutdown.changed() => false,
    }
}

/// Rotate each vault in `due`. One vault failing does not stop the rest.
pub async fn rotate_due_vaults(vaults: &VaultService, due: Vec<Vault>) -> SweepReport {
    let ctx = RequestContext::new().with_actor(ROTATION_ACTOR);
    let mut report = SweepReport {
        due: due.len(),
        ..SweepReport::default()
    };
    for vault in due {
        match vaults.rotate_key(vault.id, &ctx).await {
            Ok(outcome) => {
                report.rotated = report.rotated.saturating_add(1);
                debug!(
                    vault_id = %vault.id,
                    key_version = outcome.new_version,
                    rewrapped = outcome.rewrapped,
                    "scheduled rotation complete"
                );
            }
            Err(e) => {
                report.failed = report.failed.saturating_add(1);
                warn!(vault_id = %vault.id, error = %e, "scheduled rotation failed");
            }
        }
    }
    report
}

/// Attempt the due-vault scan with backoff. Returns:
/// - `Ok(Some(vaults))` on success
/// - `Ok(None)` if shutdown was signalled during retry
/// - `Err(last_error)` if all retries were exhausted
async fn scan_due(
    vaults: &VaultService,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<Option<Vec<Vault>>, String> {
    let mut last_err = String::new();
    for attempt in 0..=SCAN_MAX_RETRIES {
        match vaults.find_needing_rotation(Utc::now()).await {
            Ok(due) => return Ok(Some(due)),
            Err(e) => {
                last_err = e.to_string();
                if attempt == SCAN_MAX_RETRIES {
                    break;
                }
                debug!(attempt, error = %e, "rotation scan failed, retrying");
                if !backoff(attempt, shutdown).await {
                    return Ok(None);
                }
            }
        }
    }
    Err(last_err)
}

/// Periodically rotate every vault whose rotation is due.
pub async fn key_rotation_worker(
    vaults: Arc<VaultService>,
    mut shutdown: watch::Receiver<bool>,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    let mut streak = FailureStreak::default();
    info!(interval_secs = interval.as_secs(), "key rotation worker started");

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match scan_due(&vaults, &mut shutdown).await {
                    Ok(None) => break,
                    Ok(Some(due)) if due.is_empty() => streak.reset(),
                    Ok(Some(due)) => {
                        streak.reset();
                        let report = rotate_due_vaults(&vaults, due).await;
                        info!(
                            due = report.due,
                            rotated = report.rotated,
                            failed = report.failed,
                            "key rotation sweep complete"
                        );
                    }
                    Err(e) => streak.record("key_rotation", &e),
                }
            }
            _ = shutdown.changed() => break,
        }
    }
    info!("key rotation worker shutting down");
}

async fn retention_pass(
    audit: &AuditLogService,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<Option<RetentionReport>, String> {
    let mut last_err = String::new();
    for attempt in 0..=SCAN_MAX_RETRIES {
        match audit.enforce_retention(Utc::now()).await {
            Ok(report) => return Ok(Some(report)),
            Err(e) => {
                last_err = e.to_string();
                if attempt == SCAN_MAX_RETRIES {
                    break;
                }
                debug!(attempt, error = %e, "audit retention failed, retrying");
                if !backoff(attempt, shutdown).await {
                    return Ok(None);
                }
            }
        }
    }
    Err(last_err)
}

/// Periodically archive aged audit entries and purge expired archives.
pub async fn audit_retention_worker(
    audit: Arc<AuditLogService>,
    mut shutdown: watch::Receiver<bool>,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    let mut streak = FailureStreak::default();
    info!(interval_secs = interval.as_secs(), "audit retention worker started");

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match retention_pass(&audit, &mut shutdown).await {
                    Ok(None) => break,
                    Ok(Some(report)) => {
                        streak.reset();
                        if report.archive.archived > 0 || report.purged > 0 {
                            info!(
                                archived = report.archive.archived,
                                files = report.archive.locations.len(),
                                purged = report.purged,
                                "audit retention pass complete"
                            );
                        }
                    }
                    Err(e) => streak.record("audit_retention", &e),
                }
            }
            _ = shutdown.changed() => break,
        }
    }
    info!("audit retention worker shutting down");
}

/// The daemon's running workers and their shared shutdown channel.
pub struct Workers {
    shutdown: watch::Sender<bool>,
    handles: Vec<(&'static str, JoinHandle<()>)>,
}

impl Workers {
    /// Spawn the key-rotation and audit-retention workers.
    pub fn spawn(state: &AppState, rotation_every: Duration, retention_every: Duration) -> Self {
        let (shutdown, rx) = watch::channel(false);
        let handles = vec![
            (
                "key_rotation",
                tokio::spawn(key_rotation_worker(
                    Arc::clone(&state.vaults),
                    rx.clone(),
                    rotation_every,
                )),
            ),
            (
                "audit_retention",
                tokio::spawn(audit_retention_worker(
                    Arc::clone(&state.audit),
                    rx,
                    retention_every,
                )),
            ),
        ];
        Self { shutdown, handles }
    }

    /// Signal shutdown and wait up to `grace` for each worker. Returns how
    /// many stopped cleanly.
    pub async fn stop(self, grace: Duration) -> usize {
        self.shutdown.send_replace(true);
        let mut stopped = 0;
        for (name, handle) in self.handles {
            match tokio::time::timeout(grace, handle).await {
                Ok(Ok(())) => stopped += 1,
                Ok(Err(e)) => warn!(worker = name, error = %e, "worker task failed"),
                Err(_) => warn!(worker = name, "worker did not stop in time"),
            }
        }
        stopped
    }
}

impl std::fmt::Debug for Workers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<_> = self.handles.iter().map(|(name, _)| *name).collect();
        f.debug_struct("Workers").field("workers", &names).finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use tokenvault_core::crypto::EncryptionKey;
    use tokenvault_core::settings::CoreSettings;
    use tokenvault_core::vault::{DataType, NewVault};
    use tokenvault_storage::MemoryBackend;

    use super::*;

    async fn state() -> AppState {
        AppState::assemble(
            Arc::new(MemoryBackend::new()),
            EncryptionKey::generate(),
            &CoreSettings::default(),
        )
        .await
        .unwrap()
    }

    async fn vault(state: &AppState, name: &str) -> Vault {
        state
            .vaults
            .create(
                NewVault {
                    name: name.to_owned(),
                    data_type: DataType::Generic,
                    token_limit: None,
                    key_rotation_interval_days: Some(1),
                },
                &RequestContext::new(),
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn sweep_rotates_due_vaults() {
        let state = state().await;
        let a = vault(&state, "a").await;
        let b = vault(&state, "b").await;
        state.tokens.tokenize(a.id, b"secret", &RequestContext::new()).await.unwrap();

        let later = Utc::now() + chrono::Duration::days(2);
        let due = state.vaults.find_needing_rotation(later).await.unwrap();
        let report = rotate_due_vaults(&state.vaults, due).await;
        assert_eq!(
            report,
            SweepReport {
                due: 2,
                rotated: 2,
                failed: 0
            }
        );
        for id in [a.id, b.id] {
            assert_eq!(state.vaults.find_by_id_or_fail(id).await.unwrap().key_version, 2);
        }
    }

    #[tokio::test]
    async fn sweep_continues_past_failures() {
        let state = state().await;
        let a = vault(&state, "a").await;
        let b = vault(&state, "b").await;
        let ctx = RequestContext::new();
        state
            .vaults
            .update_status(a.id, tokenvault_core::vault::VaultStatus::Locked, &ctx)
            .await
            .unwrap();

        let report = rotate_due_vaults(&state.vaults, vec![a, b]).await;
        assert_eq!(report.rotated, 1);
        assert_eq!(report.failed, 1);
    }

    #[tokio::test]
    async fn workers_stop_on_shutdown() {
        let state = state().await;
        let workers = Workers::spawn(&state, Duration::from_secs(3600), Duration::from_secs(3600));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(workers.stop(Duration::from_secs(5)).await, 2);
    }
}
