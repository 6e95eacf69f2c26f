use std::collections::BTreeMap;
use sqlx::FromRow;

#[derive(FromRow)]
pub(crate) struct DispatchRow {
    pub(crate) id: i64,
    pub(crate) bead_id: String,
    pub(crate) project: String,
    pub(crate) agent_id: String,
    pub(crate) provider: String,
    pub(crate) tier: String,
    pub(crate) handle: Option<i64>,
    pub(crate) session_name: Option<String>,
    pub(crate) prompt: String,
    pub(crate) workdir: String,
    pub(crate) labels: String,
    pub(crate) status: String,
    pub(crate) stage: String,
    pub(crate) dispatched_at: i64,
    pub(crate) completed_at: Option<i64>,
    pub(crate) exit_code: Option<i64>,
    pub(crate) duration_s: Option<f64>,
    pub(crate) retries: i64,
    pub(crate) escalated_from_tier: Option<String>,
    pub(crate) failure_category: Option<String>,
    pub(crate) failure_summary: Option<String>,
    pub(crate) pr_url: Option<String>,
    pub(crate) pr_number: Option<i64>,
    pub(crate) input_tokens: i64,
    pub(crate) output_tokens: i64,
    pub(crate) cost_usd: f64,
}

pub(crate) const DISPATCH_COLUMNS: &str = "id, bead_id, project, agent_id, provider, tier, handle, \
     session_name, prompt, workdir, labels, status, stage, dispatched_at, completed_at, exit_code, \
     duration_s, retries, escalated_from_tier, failure_category, failure_summary, pr_url, pr_number, \
     input_tokens, output_tokens, cost_usd";

#[derive(FromRow)]
pub(crate) struct LeaseRow {
    pub(crate) bead_id: String,
    pub(crate) project: String,
    pub(crate) workspace: String,
    pub(crate) holder: String,
    pub(crate) dispatch_id: Option<i64>,
    pub(crate) claimed_at: i64,
    pub(crate) heartbeat_at: i64,
}

#[derive(FromRow)]
pub(crate) struct BeadStageRow {
    pub(crate) project: String,
    pub(crate) bead_id: String,
    pub(crate) workflow: String,
    pub(crate) current_stage: String,
    pub(crate) stage_index: i64,
    pub(crate) total_stages: i64,
    pub(crate) completed: i64,
    pub(crate) updated_at: i64,
}

#[derive(FromRow)]
pub(crate) struct StageHistoryRow {
    pub(crate) stage: String,
    pub(crate) status: String,
    pub(crate) started_at: i64,
    pub(crate) completed_at: Option<i64>,
    pub(crate) dispatch_id: Option<i64>,
}

#[derive(FromRow)]
pub(crate) struct GateRow {
    pub(crate) plan_id: String,
    pub(crate) approved_by: String,
    pub(crate) approved_at: i64,
    pub(crate) activated_at: i64,
}

#[derive(FromRow)]
pub(crate) struct HealthEventRow {
    pub(crate) id: i64,
    pub(crate) kind: String,
    pub(crate) project: Option<String>,
    pub(crate) bead_id: Option<String>,
    pub(crate) dispatch_id: Option<i64>,
    pub(crate) details: String,
    pub(crate) created_at: i64,
}

#[derive(FromRow)]
pub(crate) struct StatusCountRow {
    pub(crate) key: String,
    pub(crate) count: i64,
}

/// Active dispatches grouped the ways the scheduler reports them.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct Allocation {
    pub total_active: u32,
    pub by_project: BTreeMap<String, u32>,
    pub by_tier: BTreeMap<String, u32>,
}

/// Authed dispatches counted in each rate-limit window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct UsageCounts {
    pub short_window: u64,
    pub long_window: u64,
}

#[derive(FromRow)]
pub(crate) struct AllocationRow {
    pub(crate) project: String,
    pub(crate) tier: String,
    pub(crate) count: i64,
}
