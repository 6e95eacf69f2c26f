use super::read_ops::{BeadStageRow, DispatchRow, GateRow, HealthEventRow, LeaseRow, StageHistoryRow};
use crate::error::{Result, SwarmError};
use crate::labels::Labels;
use crate::types::{
    AgentId, BeadId, BeadStage, ClaimLease, Dispatch, DispatchId, DispatchStatus,
    ExecutionPlanGate, FailureCategory, HealthEvent, HealthEventKind, ProjectId,
    StageHistoryEntry, StageStatus, Tier,
};
use chrono::{DateTime, TimeZone, Utc};
use std::time::Duration;

pub fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| SwarmError::DatabaseError(format!("Invalid timestamp: {ms}")))
}

/// Epoch millis `window` before now; a window too large to represent clamps to epoch zero.
pub fn millis_ago(window: Duration) -> i64 {
    let window_ms = i64::try_from(window.as_millis()).unwrap_or(i64::MAX);
    to_millis(Utc::now()).saturating_sub(window_ms).max(0)
}

pub const fn to_u32_i64(value: i64) -> u32 {
    if value < 0 {
        0
    } else if value > u32::MAX as i64 {
        u32::MAX
    } else {
        value as u32
    }
}

fn parse_tier(value: &str) -> Result<Tier> {
    Tier::try_from(value).map_err(SwarmError::DatabaseError)
}

fn parse_status(value: &str) -> Result<DispatchStatus> {
    DispatchStatus::try_from(value).map_err(SwarmError::DatabaseError)
}

pub fn parse_dispatch(row: DispatchRow) -> Result<Dispatch> {
    Ok(Dispatch {
        id: DispatchId::new(row.id),
        bead_id: BeadId::new(row.bead_id),
        project: ProjectId::new(row.project),
        agent_id: AgentId::new(row.agent_id),
        provider: row.provider,
        tier: parse_tier(&row.tier)?,
        handle: row.handle,
        session_name: row.session_name,
        status: parse_status(&row.status)?,
        stage: parse_status(&row.stage)?,
        labels: Labels::from_storage(&row.labels).into_vec(),
        workdir: row.workdir,
        prompt: row.prompt,
        dispatched_at: from_millis(row.dispatched_at)?,
        completed_at: row.completed_at.map(from_millis).transpose()?,
        exit_code: row.exit_code.and_then(|code| i32::try_from(code).ok()),
        duration_s: row.duration_s,
        retries: to_u32_i64(row.retries),
        escalated_from_tier: row
            .escalated_from_tier
            .as_deref()
            .map(parse_tier)
            .transpose()?,
        failure_category: row.failure_category.as_deref().map(FailureCategory::from),
        failure_summary: row.failure_summary,
        pr_url: row.pr_url,
        pr_number: row.pr_number,
        input_tokens: row.input_tokens,
        output_tokens: row.output_tokens,
        cost_usd: row.cost_usd,
    })
}

pub fn parse_lease(row: LeaseRow) -> Result<ClaimLease> {
    Ok(ClaimLease {
        bead_id: BeadId::new(row.bead_id),
        project: ProjectId::new(row.project),
        workspace: row.workspace,
        holder: row.holder,
        dispatch_id: row.dispatch_id.map(DispatchId::new),
        claimed_at: from_millis(row.claimed_at)?,
        heartbeat_at: from_millis(row.heartbeat_at)?,
    })
}

pub fn parse_stage_history(row: StageHistoryRow) -> Result<StageHistoryEntry> {
    Ok(StageHistoryEntry {
        stage: row.stage,
        status: StageStatus::try_from(row.status.as_str()).map_err(SwarmError::DatabaseError)?,
        started_at: from_millis(row.started_at)?,
        completed_at: row.completed_at.map(from_millis).transpose()?,
        dispatch_id: row.dispatch_id.map(DispatchId::new),
    })
}

pub fn parse_bead_stage(row: BeadStageRow, history: Vec<StageHistoryEntry>) -> Result<BeadStage> {
    Ok(BeadStage {
        project: ProjectId::new(row.project),
        bead_id: BeadId::new(row.bead_id),
        workflow: row.workflow,
        current_stage: row.current_stage,
        stage_index: to_u32_i64(row.stage_index),
        total_stages: to_u32_i64(row.total_stages),
        completed: row.completed != 0,
        updated_at: from_millis(row.updated_at)?,
        history,
    })
}

pub fn parse_gate(row: GateRow) -> Result<ExecutionPlanGate> {
    Ok(ExecutionPlanGate {
        plan_id: row.plan_id,
        approved_by: row.approved_by,
        approved_at: from_millis(row.approved_at)?,
        activated_at: from_millis(row.activated_at)?,
    })
}

pub fn parse_health_event(row: HealthEventRow) -> Result<HealthEvent> {
    Ok(HealthEvent {
        id: row.id,
        kind: HealthEventKind::try_from(row.kind.as_str()).map_err(SwarmError::DatabaseError)?,
        project: row.project.map(ProjectId::new),
        bead_id: row.bead_id.map(BeadId::new),
        dispatch_id: row.dispatch_id.map(DispatchId::new),
        details: row.details,
        created_at: from_millis(row.created_at)?,
    })
}
