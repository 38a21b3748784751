//! Risk classification for audit entries.
//!
//! The scoring function is a policy: [`RiskScorer`] is the seam, and
//! [`DefaultRiskPolicy`] is what the services use unless told otherwise.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::audit::OperationType;

/// Severity attached to every audit entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    /// One level up, saturating at `Critical`.
    #[must_use]
    pub const fn raised(self) -> Self {
        match self {
            Self::Low => Self::Medium,
            Self::Medium => Self::High,
            Self::High | Self::Critical => Self::Critical,
        }
    }

    /// High or critical.
    #[must_use]
    pub const fn is_high(self) -> bool {
        matches!(self, Self::High | Self::Critical)
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        })
    }
}

/// What the scorer sees about an operation.
#[derive(Debug, Clone, Copy)]
pub struct RiskInput {
    pub operation: OperationType,
    pub success: bool,
    /// Accesses of the same token inside the burst window, this one included.
    pub recent_accesses: u32,
}

/// Pluggable risk policy.
pub trait RiskScorer: Send + Sync {
    fn score(&self, input: &RiskInput) -> RiskLevel;
}

/// Baseline by operation, one level up on failure, bursts are high.
#[derive(Debug, Clone, Copy)]
pub struct DefaultRiskPolicy {
    burst_threshold: u32,
}

impl DefaultRiskPolicy {
    #[must_use]
    pub const fn new(burst_threshold: u32) -> Self {
        Self { burst_threshold }
    }
}

impl RiskScorer for DefaultRiskPolicy {
    fn score(&self, input: &RiskInput) -> RiskLevel {
        let base = match input.operation {
            OperationType::Tokenize => RiskLevel::Low,
            OperationType::Detokenize
            | OperationType::Revoke
            | OperationType::Suspend
            | OperationType::Reactivate => RiskLevel::Medium,
            OperationType::RotateKey
            | OperationType::CreateVault
            | OperationType::UpdateVaultStatus
            | OperationType::DeleteVault
            | OperationType::PurgeTokens => RiskLevel::High,
        };

        let burst = input.operation == OperationType::Detokenize
            && input.recent_accesses > self.burst_threshold;
        let level = if burst { base.max(RiskLevel::High) } else { base };

        if input.success { level } else { level.raised() }
    }
}

/// Sliding-window counter of detokenize calls per token.
#[derive(Debug)]
pub struct AccessTracker {
    window: Duration,
    seen: Mutex<HashMap<String, VecDeque<DateTime<Utc>>>>,
}

/// Tracked tokens above which stale entries are swept on every record.
const SWEEP_THRESHOLD: usize = 10_000;

impl AccessTracker {
    #[must_use]
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            seen: Mutex::new(HashMap::new()),
        }
    }

    /// Record an access to `key` at `now` and return how many accesses fall
    /// inside the window, this one included.
    pub async fn record(&self, key: &str, now: DateTime<Utc>) -> u32 {
        let window = chrono::Duration::from_std(self.window).unwrap_or(chrono::Duration::MAX);
        let cutoff = now.checked_sub_signed(window).unwrap_or(DateTime::<Utc>::MIN_UTC);

        let mut seen = self.seen.lock().await;
        if seen.len() > SWEEP_THRESHOLD {
            seen.retain(|_, hits| hits.back().is_some_and(|last| *last > cutoff));
        }

        let hits = seen.entry(key.to_owned()).or_default();
        while hits.front().is_some_and(|first| *first <= cutoff) {
            hits.pop_front();
        }
        hits.push_back(now);
        u32::try_from(hits.len()).unwrap_or(u32::MAX)
    }
}
