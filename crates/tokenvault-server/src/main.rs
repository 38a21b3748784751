//! `TokenVault` daemon entry point.

use std::time::Duration;

use tracing::{info, warn};

use tokenvault_server::config::ServerConfig;
use tokenvault_server::hardening;
use tokenvault_server::state::AppState;
use tokenvault_server::workers::Workers;

/// How long each worker gets to finish its current tick on shutdown.
const WORKER_GRACE: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ServerConfig::from_env();

    // No key material may be loaded before this point.
    let hardening_warnings = hardening::apply(config.disable_mlock);

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level)),
        )
        .json()
        .init();
    for warning in &hardening_warnings {
        warn!(warning = %warning, "process hardening incomplete");
    }

    info!(config = ?config, "TokenVault starting");
    let state = AppState::build(&config).await?;
    let workers = Workers::spawn(
        &state,
        Duration::from_secs(config.rotation_sweep_interval_secs),
        Duration::from_secs(config.retention_interval_secs),
    );
    info!("TokenVault running");

    let signal = shutdown_signal().await;
    info!(signal, "shutdown signal received, stopping workers");
    let stopped = workers.stop(WORKER_GRACE).await;

    state.barrier.seal().await;
    info!(workers_stopped = stopped, "TokenVault stopped");
    Ok(())
}

/// Resolve on SIGINT or SIGTERM, returning which one arrived.
async fn shutdown_signal() -> &'static str {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => tokio::select! {
                _ = tokio::signal::ctrl_c() => "SIGINT",
                _ = term.recv() => "SIGTERM",
            },
            Err(_) => {
                tokio::signal::ctrl_c().await.ok();
                "SIGINT"
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.ok();
        "ctrl-c"
    }
}
