use super::{AgentId, BeadId, DispatchId, ProjectId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Capability/cost class of a worker provider.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    #[default]
    Fast,
    Balanced,
    Premium,
}

impl Tier {
    pub const LADDER: [Self; 3] = [Self::Fast, Self::Balanced, Self::Premium];

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Fast => "fast",
            Self::Balanced => "balanced",
            Self::Premium => "premium",
        }
    }

    /// Next rung up the ladder, `None` at the top.
    #[must_use]
    pub const fn next(&self) -> Option<Self> {
        match self {
            Self::Fast => Some(Self::Balanced),
            Self::Balanced => Some(Self::Premium),
            Self::Premium => None,
        }
    }

    /// Escalate one rung, staying at premium once there.
    #[must_use]
    pub const fn escalate(&self) -> Self {
        match self.next() {
            Some(next) => next,
            None => *self,
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for Tier {
    type Error = String;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "fast" => Ok(Self::Fast),
            "balanced" => Ok(Self::Balanced),
            "premium" => Ok(Self::Premium),
            _ => Err(format!("Unknown tier: {value}")),
        }
    }
}

/// Lifecycle value shared by a dispatch's `status` and `stage` columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchStatus {
    Dispatched,
    Running,
    Completed,
    Failed,
    Cancelled,
    Interrupted,
    PendingRetry,
    Retried,
}

impl DispatchStatus {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Dispatched => "dispatched",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Interrupted => "interrupted",
            Self::PendingRetry => "pending_retry",
            Self::Retried => "retried",
        }
    }

    /// At most one active dispatch may exist per bead.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        matches!(self, Self::Dispatched | Self::Running | Self::PendingRetry)
    }

    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        !self.is_active()
    }

    /// Statuses that extend a consecutive-failure streak.
    #[must_use]
    pub const fn is_failure_like(&self) -> bool {
        matches!(
            self,
            Self::Failed | Self::Cancelled | Self::Interrupted | Self::PendingRetry | Self::Retried
        )
    }
}

impl fmt::Display for DispatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for DispatchStatus {
    type Error = String;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "dispatched" => Ok(Self::Dispatched),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            "interrupted" => Ok(Self::Interrupted),
            "pending_retry" => Ok(Self::PendingRetry),
            "retried" => Ok(Self::Retried),
            _ => Err(format!("Unknown dispatch status: {value}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    Timeout,
    ProcessError,
    ProviderRejected,
    DispatchError,
    SessionMissing,
    LeaseExpired,
    Cancelled,
    Unknown,
}

impl FailureCategory {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::ProcessError => "process_error",
            Self::ProviderRejected => "provider_rejected",
            Self::DispatchError => "dispatch_error",
            Self::SessionMissing => "session_missing",
            Self::LeaseExpired => "lease_expired",
            Self::Cancelled => "cancelled",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl From<&str> for FailureCategory {
    fn from(value: &str) -> Self {
        match value {
            "timeout" => Self::Timeout,
            "process_error" => Self::ProcessError,
            "provider_rejected" => Self::ProviderRejected,
            "dispatch_error" => Self::DispatchError,
            "session_missing" => Self::SessionMissing,
            "lease_expired" => Self::LeaseExpired,
            "cancelled" => Self::Cancelled,
            _ => Self::Unknown,
        }
    }
}

/// One attempt to execute a bead. Rows are append-only per bead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dispatch {
    pub id: DispatchId,
    pub bead_id: BeadId,
    pub project: ProjectId,
    pub agent_id: AgentId,
    pub provider: String,
    pub tier: Tier,
    pub handle: Option<i64>,
    pub session_name: Option<String>,
    pub status: DispatchStatus,
    pub stage: DispatchStatus,
    pub labels: Vec<String>,
    pub workdir: String,
    pub prompt: String,
    pub dispatched_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub duration_s: Option<f64>,
    pub retries: u32,
    pub escalated_from_tier: Option<Tier>,
    pub failure_category: Option<FailureCategory>,
    pub failure_summary: Option<String>,
    pub pr_url: Option<String>,
    pub pr_number: Option<i64>,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cost_usd: f64,
}

impl Dispatch {
    #[must_use]
    pub const fn is_active(&self) -> bool {
        self.status.is_active()
    }

    /// Seconds since dispatch at `now`.
    #[must_use]
    pub fn age_secs(&self, now: DateTime<Utc>) -> i64 {
        (now - self.dispatched_at).num_seconds()
    }
}
