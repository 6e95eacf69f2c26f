use crate::labels::Labels;
use crate::types::{AgentId, BeadId, DispatchId, ProjectId, StageAssignment, Tier};
use crate::workflow::WorkflowDefinition;

/// Everything written atomically when the scheduler launches one attempt.
#[derive(Debug, Clone)]
pub struct SchedulerDispatchRecord {
    pub bead_id: BeadId,
    pub project: ProjectId,
    pub agent_id: AgentId,
    pub provider: String,
    pub tier: Tier,
    pub handle: Option<i64>,
    pub session_name: Option<String>,
    pub prompt: String,
    pub workdir: String,
    pub labels: Labels,
    pub stage: Option<StageAssignment>,
    pub retries: u32,
    pub escalated_from_tier: Option<Tier>,
    /// The pending-retry row this attempt replaces; it is marked `retried` in
    /// the same transaction.
    pub retry_of: Option<DispatchId>,
}

impl SchedulerDispatchRecord {
    /// Labels as stored: caller labels plus the stage label, if any.
    #[must_use]
    pub fn stored_labels(&self) -> Labels {
        self.stage.as_ref().map_or_else(
            || self.labels.clone(),
            |stage| self.labels.clone().with_stage(&stage.stage),
        )
    }
}

/// Token accounting reported by a finished worker.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DispatchUsage {
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cost_usd: f64,
}

/// Caps for the strict quota reservation. A `None` cap leaves that window
/// unconstrained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowCap {
    pub since_ms: i64,
    pub cap: Option<u64>,
}

/// Stage move written together with a successful completion.
#[derive(Debug, Clone, Copy)]
pub enum StageTransition<'a> {
    Advance(&'a WorkflowDefinition),
    Revert {
        workflow: &'a WorkflowDefinition,
        to_stage: &'a str,
    },
}
