pub mod claims;
pub mod config;
pub mod db;
pub mod diagnostics;
pub mod error;
pub mod health;
pub mod labels;
pub mod liveness;
pub mod ports;
pub mod prompts;
pub mod rate_limiter;
pub mod retry;
pub mod scheduler;
pub mod types;
pub mod workflow;

pub use claims::ClaimLeaseManager;
pub use config::{ConfigHandle, SchedulerConfig};
pub use db::SwarmDb;
pub use error::{Result, SwarmError};
pub use health::{HealthMonitor, HealthReport};
pub use rate_limiter::RateLimiter;
pub use retry::{RetryDecision, RetryEngine, RetryPolicy};
pub use scheduler::{CompletionResult, DispatchOutcome, Scheduler, TickReport};
pub use types::*;
