use super::{AgentId, BeadId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Append-only ledger row counted by the rate limiter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageEvent {
    pub provider: String,
    pub agent_id: AgentId,
    pub bead_id: BeadId,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub recorded_at: DateTime<Utc>,
}
