use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Singleton approval switch; dispatch is allowed only while a plan is active.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionPlanGate {
    pub plan_id: String,
    pub approved_by: String,
    pub approved_at: DateTime<Utc>,
    pub activated_at: DateTime<Utc>,
}

impl ExecutionPlanGate {
    #[must_use]
    pub fn is_open(&self) -> bool {
        !self.plan_id.trim().is_empty()
    }
}
