mod bead;
mod dispatch;
mod gate;
mod health;
mod identifiers;
mod lease;
mod stage;
mod usage;

pub use bead::{parse_stage_label, stage_label, Bead, BeadStatus, STAGE_LABEL_PREFIX};
pub use dispatch::{Dispatch, DispatchStatus, FailureCategory, Tier};
pub use gate::ExecutionPlanGate;
pub use health::{HealthEvent, HealthEventKind};
pub use identifiers::{AgentId, BeadId, DispatchId, ProjectId};
pub use lease::ClaimLease;
pub use stage::{BeadStage, StageAssignment, StageHistoryEntry, StageStatus};
pub use usage::UsageEvent;
