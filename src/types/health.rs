//! Health event types surfaced by the health monitor and retry engine.
//!
//! Only quarantine is meant to reach a human-facing channel; the other kinds
//! are recorded for reporting.

use super::{BeadId, DispatchId, ProjectId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of health event recorded in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthEventKind {
    /// Consecutive-failure streak reached the threshold; needs a human.
    Quarantine,
    /// A running dispatch's session was confirmed gone.
    StuckDispatchKilled,
    /// A claim lease stopped heartbeating and was reclaimed.
    LeaseReclaimed,
    /// The external dispatcher could not start a worker.
    DispatchError,
    /// An expired lease was kept because its worker's liveness is unknown.
    LeaseUnverified,
}

impl HealthEventKind {
    /// Get string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Quarantine => "quarantine",
            Self::StuckDispatchKilled => "stuck_dispatch_killed",
            Self::LeaseReclaimed => "lease_reclaimed",
            Self::DispatchError => "dispatch_error",
            Self::LeaseUnverified => "lease_unverified",
        }
    }

    /// Whether this event requires external intervention.
    #[must_use]
    pub const fn requires_intervention(&self) -> bool {
        matches!(self, Self::Quarantine)
    }
}

impl fmt::Display for HealthEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for HealthEventKind {
    type Error = String;

    fn try_from(value: &str) -> Result<Self, String> {
        match value {
            "quarantine" => Ok(Self::Quarantine),
            "stuck_dispatch_killed" => Ok(Self::StuckDispatchKilled),
            "lease_reclaimed" => Ok(Self::LeaseReclaimed),
            "dispatch_error" => Ok(Self::DispatchError),
            "lease_unverified" => Ok(Self::LeaseUnverified),
            _ => Err(format!("Unknown health event kind: {value}")),
        }
    }
}

/// A recorded health event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthEvent {
    pub id: i64,
    pub kind: HealthEventKind,
    pub project: Option<ProjectId>,
    pub bead_id: Option<BeadId>,
    pub dispatch_id: Option<DispatchId>,
    pub details: String,
    pub created_at: DateTime<Utc>,
}
