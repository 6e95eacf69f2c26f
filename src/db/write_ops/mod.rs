mod dispatch_ops;
mod gate_ops;
mod health_ops;
mod helpers;
mod lease_ops;
mod stage_ops;
mod types;
mod usage_ops;

pub use types::{DispatchUsage, SchedulerDispatchRecord, StageTransition, WindowCap};
