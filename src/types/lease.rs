use super::{BeadId, DispatchId, ProjectId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Exclusive ownership token for one bead id, fleet-wide.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimLease {
    pub bead_id: BeadId,
    pub project: ProjectId,
    pub workspace: String,
    pub holder: String,
    pub dispatch_id: Option<DispatchId>,
    pub claimed_at: DateTime<Utc>,
    pub heartbeat_at: DateTime<Utc>,
}

impl ClaimLease {
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>, threshold: chrono::Duration) -> bool {
        now - self.heartbeat_at > threshold
    }
}
