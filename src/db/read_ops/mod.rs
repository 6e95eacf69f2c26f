mod dispatch_queries;
mod gate_queries;
mod health_queries;
mod lease_queries;
mod stage_queries;
mod types;
mod usage_queries;

pub use types::{Allocation, UsageCounts};
pub(crate) use types::{
    BeadStageRow, DispatchRow, GateRow, HealthEventRow, LeaseRow, StageHistoryRow,
};
