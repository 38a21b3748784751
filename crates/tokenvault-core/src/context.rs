//! Request-scoped caller context.

use std::future::Future;
use std::net::IpAddr;
use std::time::Duration;

use crate::error::RepositoryError;

/// Who is calling, from where, and how long their repository calls may take.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub ip_address: Option<IpAddr>,
    /// Free-form caller label (service name, user id). Never sensitive data.
    pub actor: Option<String>,
    /// Per-call bound; the service default applies when `None`.
    pub timeout: Option<Duration>,
}

impl RequestContext {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_ip(mut self, ip: IpAddr) -> Self {
        self.ip_address = Some(ip);
        self
    }

    #[must_use]
    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// The effective bound: the caller's if set, otherwise `default`.
    #[must_use]
    pub fn timeout_or(&self, default: Duration) -> Duration {
        self.timeout.unwrap_or(default)
    }
}

/// Run a repository future under `timeout`.
///
/// # Errors
///
/// Returns [`RepositoryError::Timeout`] naming `operation` when the bound
/// elapses, otherwise whatever the future returns.
pub async fn bounded<T, E, F>(operation: &'static str, timeout: Duration, fut: F) -> Result<T, E>
where
    F: Future<Output = Result<T, E>>,
    E: From<RepositoryError>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(E::from(RepositoryError::Timeout {
            operation,
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        })),
    }
}
