#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![forbid(unsafe_code)]

//! The tick loop: gate, reconcile, sweep, retry, then fresh candidates.
//!
//! A tick reads one configuration snapshot and uses it throughout. Concurrent
//! ticks are safe because every launch goes through a claim lease first.

mod completion;
mod launch;

#[cfg(test)]
mod scheduler_behaviors;

pub use completion::{CompletionResult, DispatchOutcome};

use crate::claims::ClaimLeaseManager;
use crate::config::{ConfigHandle, ProjectConfig, SchedulerConfig};
use crate::db::SwarmDb;
use crate::diagnostics::classify_failure;
use crate::error::Result;
use crate::health::HealthMonitor;
use crate::labels::Labels;
use crate::liveness::{Liveness, LivenessChecker};
use crate::ports::{BeadSource, DispatchHandle, Dispatcher, ProcessStatus};
use crate::prompts::{load_prompt_template, render_prompt, PromptContext};
use crate::retry::RetryEngine;
use crate::types::{parse_stage_label, AgentId, Bead, BeadId, DispatchId, ProjectId, StageAssignment};
use crate::workflow::WorkflowDefinition;
use launch::{LaunchOutcome, LaunchPlan};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Counts from one tick, logged as a single line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub gate_closed: bool,
    pub cancelled: bool,
    pub candidates: u32,
    pub dispatched: u32,
    pub retried: u32,
    pub reconciled: u32,
    pub skipped_contention: u32,
    pub skipped_quota: u32,
    pub skipped_cooldown: u32,
    pub skipped_concurrency: u32,
    pub skipped_quarantined: u32,
    pub launch_failures: u32,
    pub failures: u32,
    pub health_actions: u32,
}

/// Per-tick mutable bookkeeping.
struct TickState {
    report: TickReport,
    budget: usize,
    quota_exhausted: bool,
    active_by_project: HashMap<ProjectId, u32>,
}

impl TickState {
    fn may_continue(&mut self, cancel: &CancellationToken) -> bool {
        if cancel.is_cancelled() {
            self.report.cancelled = true;
            return false;
        }
        self.budget > 0 && !self.quota_exhausted
    }

    fn at_capacity(&self, project_id: &ProjectId, project: &ProjectConfig) -> bool {
        self.active_by_project
            .get(project_id)
            .is_some_and(|active| *active >= project.max_concurrent)
    }
}

struct Candidate {
    bead: Bead,
    project_priority: u8,
}

pub struct Scheduler {
    config: ConfigHandle,
    db: SwarmDb,
    dispatcher: Arc<dyn Dispatcher>,
    beads: Arc<dyn BeadSource>,
    liveness: Arc<dyn LivenessChecker>,
    last_sweep: Mutex<Option<Instant>>,
}

impl Scheduler {
    #[must_use]
    pub fn new(
        config: ConfigHandle,
        db: SwarmDb,
        dispatcher: Arc<dyn Dispatcher>,
        beads: Arc<dyn BeadSource>,
        liveness: Arc<dyn LivenessChecker>,
    ) -> Self {
        Self {
            config,
            db,
            dispatcher,
            beads,
            liveness,
            last_sweep: Mutex::new(None),
        }
    }

    #[must_use]
    pub const fn db(&self) -> &SwarmDb {
        &self.db
    }

    #[must_use]
    pub const fn config(&self) -> &ConfigHandle {
        &self.config
    }

    fn claims(&self, config: &SchedulerConfig) -> ClaimLeaseManager {
        ClaimLeaseManager::new(self.db.clone(), config.holder.clone())
    }

    fn retry_engine(&self, config: &SchedulerConfig) -> RetryEngine {
        RetryEngine::new(self.db.clone(), config.retry.clone())
    }

    fn health_monitor(&self, config: &SchedulerConfig) -> HealthMonitor {
        HealthMonitor::new(
            self.db.clone(),
            Arc::clone(&self.dispatcher),
            Arc::clone(&self.liveness),
            config.retry.clone(),
        )
    }

    /// One bounded pass. Per-bead failures are counted and logged, never
    /// propagated; an error means the tick could not start at all.
    ///
    /// # Errors
    /// Returns an error if the gate or the tick's initial store reads fail.
    pub async fn run_tick(&self, cancel: &CancellationToken) -> Result<TickReport> {
        let config = self.config.current();
        let mut state = TickState {
            report: TickReport::default(),
            budget: config.max_per_tick,
            quota_exhausted: false,
            active_by_project: HashMap::new(),
        };

        if cancel.is_cancelled() {
            state.report.cancelled = true;
            return Ok(state.report);
        }
        if !self.db.is_plan_gate_open().await? {
            state.report.gate_closed = true;
            info!("Execution plan gate closed; skipping tick");
            return Ok(state.report);
        }

        self.reconcile_running(&config, &mut state.report).await?;
        self.maybe_sweep(&config, &mut state.report).await;
        for (project, _) in config.enabled_projects() {
            let active = self.db.count_active_dispatches(&project).await?;
            state.active_by_project.insert(project, active);
        }
        self.retry_pass(&config, cancel, &mut state).await?;
        self.candidate_pass(&config, cancel, &mut state).await?;

        let report = state.report;
        info!(
            candidates = report.candidates,
            dispatched = report.dispatched,
            retried = report.retried,
            reconciled = report.reconciled,
            skipped_contention = report.skipped_contention,
            skipped_quota = report.skipped_quota,
            skipped_cooldown = report.skipped_cooldown,
            skipped_concurrency = report.skipped_concurrency,
            skipped_quarantined = report.skipped_quarantined,
            launch_failures = report.launch_failures,
            failures = report.failures,
            health_actions = report.health_actions,
            cancelled = report.cancelled,
            "Tick complete"
        );
        Ok(report)
    }

    /// Probe running dispatches: refresh leases of live workers and close
    /// those whose process has exited. Unknown probes are left alone.
    async fn reconcile_running(&self, config: &SchedulerConfig, report: &mut TickReport) -> Result<()> {
        let claims = self.claims(config);
        for dispatch in self.db.get_running_dispatches().await? {
            let Some(handle) = dispatch.handle.map(DispatchHandle::new) else {
                continue;
            };
            match self.liveness.probe(handle).await.unwrap_or(Liveness::Unknown) {
                Liveness::Live => {
                    if let Err(err) = claims.heartbeat(&dispatch.bead_id).await {
                        warn!(bead_id = %dispatch.bead_id, error = %err, "Lease heartbeat failed");
                    }
                }
                Liveness::Unknown => {
                    debug!(dispatch_id = dispatch.id.value(), "Liveness unknown during reconcile");
                }
                Liveness::Missing => {
                    let state = match self.dispatcher.process_state(handle).await {
                        Ok(state) => state,
                        Err(err) => {
                            debug!(dispatch_id = dispatch.id.value(), error = %err, "Process state unavailable");
                            continue;
                        }
                    };
                    if state.state != ProcessStatus::Exited {
                        continue;
                    }
                    let outcome = if state.succeeded() {
                        DispatchOutcome::Completed
                    } else {
                        let summary = state.exit_code.map_or_else(
                            || "worker terminated by signal".to_string(),
                            |code| format!("worker exited with code {code}"),
                        );
                        DispatchOutcome::Failed {
                            category: classify_failure(&summary, state.exit_code),
                            summary,
                            exit_code: state.exit_code,
                        }
                    };
                    match self.complete_with(config, dispatch.id, outcome).await {
                        Ok(_) => report.reconciled += 1,
                        Err(err) => {
                            report.failures += 1;
                            warn!(dispatch_id = dispatch.id.value(), error = %err, "Failed to close exited dispatch");
                        }
                    }
                }
            }
        }
        Ok(())
    }

    async fn maybe_sweep(&self, config: &SchedulerConfig, report: &mut TickReport) {
        {
            let mut last_sweep = self.last_sweep.lock().await;
            if last_sweep.is_some_and(|at| at.elapsed() < config.health.sweep_interval()) {
                return;
            }
            *last_sweep = Some(Instant::now());
        }
        match self
            .health_monitor(config)
            .sweep(config.health.stuck_timeout(), config.lease_expiry())
            .await
        {
            Ok(health) => {
                report.health_actions += health.actions();
                report.failures += health.errors;
            }
            Err(err) => {
                report.failures += 1;
                warn!(error = %err, "Health sweep failed");
            }
        }
    }

    /// Re-dispatch pending retries at their queued tier, oldest first. A
    /// pending row already holds its project's concurrency slot.
    async fn retry_pass(
        &self,
        config: &SchedulerConfig,
        cancel: &CancellationToken,
        state: &mut TickState,
    ) -> Result<()> {
        let workflows = config.workflow_registry();
        for pending in self.db.get_pending_retry_dispatches().await? {
            if !state.may_continue(cancel) {
                break;
            }
            let Some(project) = config.project(&pending.project).filter(|p| p.enabled) else {
                debug!(dispatch_id = pending.id.value(), project = %pending.project, "Retry for disabled project");
                continue;
            };
            let Some(workflow) = workflows.get(&project.workflow) else {
                continue;
            };
            let label = Labels::from(pending.labels.clone());
            let label_stage = label
                .as_slice()
                .iter()
                .find_map(|label| parse_stage_label(label));
            let stage = match self
                .stage_for(&pending.project, &pending.bead_id, workflow, label_stage)
                .await
            {
                Ok(Some(stage)) => Some(stage),
                Ok(None) => {
                    self.abandon(pending.id, "bead pipeline already complete").await;
                    continue;
                }
                Err(err) => {
                    state.report.failures += 1;
                    warn!(dispatch_id = pending.id.value(), error = %err, "Failed to resolve retry stage");
                    continue;
                }
            };

            let plan = LaunchPlan {
                bead_id: pending.bead_id.clone(),
                project: pending.project.clone(),
                workspace: project.workspace.clone(),
                agent: pending.agent_id.clone(),
                prompt: pending.prompt.clone(),
                tier: pending.tier,
                labels: label,
                stage,
                retries: pending.retries,
                escalated_from_tier: pending.escalated_from_tier,
                retry_of: Some(pending.id),
                stage_label_in_source: None,
            };
            self.launch_and_count(config, cancel, &plan, state, true).await;
        }
        Ok(())
    }

    async fn candidate_pass(
        &self,
        config: &SchedulerConfig,
        cancel: &CancellationToken,
        state: &mut TickState,
    ) -> Result<()> {
        let candidates = self.collect_candidates(config, &mut state.report).await?;
        state.report.candidates = u32::try_from(candidates.len()).unwrap_or(u32::MAX);
        let workflows = config.workflow_registry();

        for Candidate { bead, .. } in candidates {
            if !state.may_continue(cancel) {
                break;
            }
            let Some(project) = config.project(&bead.project) else {
                continue;
            };
            if state.at_capacity(&bead.project, project) {
                state.report.skipped_concurrency += 1;
                continue;
            }
            match self.should_skip(config, &bead.id).await {
                Ok(Some(skip)) => {
                    match skip {
                        Skip::Cooldown => state.report.skipped_cooldown += 1,
                        Skip::Quarantined => state.report.skipped_quarantined += 1,
                    }
                    continue;
                }
                Ok(None) => {}
                Err(err) => {
                    state.report.failures += 1;
                    warn!(bead_id = %bead.id, error = %err, "Failed to check bead history");
                    continue;
                }
            }
            let Some(workflow) = workflows.get(&project.workflow) else {
                continue;
            };
            let stage = match self
                .stage_for(&bead.project, &bead.id, workflow, bead.stage_label())
                .await
            {
                Ok(Some(stage)) => stage,
                Ok(None) => continue,
                Err(err) => {
                    state.report.failures += 1;
                    warn!(bead_id = %bead.id, error = %err, "Failed to resolve stage");
                    continue;
                }
            };
            let Some(definition) = workflow.stage(&stage.stage) else {
                continue;
            };
            let prompt = match load_prompt_template(&project.workspace).await {
                Ok(template) => render_prompt(
                    &template,
                    &PromptContext {
                        bead: &bead,
                        stage: Some(&stage),
                        role: &definition.role,
                    },
                ),
                Err(err) => {
                    state.report.failures += 1;
                    warn!(bead_id = %bead.id, error = %err, "Failed to load prompt template");
                    continue;
                }
            };

            let plan = LaunchPlan {
                bead_id: bead.id.clone(),
                project: bead.project.clone(),
                workspace: project.workspace.clone(),
                agent: AgentId::new(format!("{}-{}", bead.project, definition.role)),
                prompt,
                tier: definition.tier,
                labels: Labels::from(bead.labels.as_slice()),
                stage_label_in_source: bead.stage_label().map(str::to_string),
                stage: Some(stage),
                retries: 0,
                escalated_from_tier: None,
                retry_of: None,
            };
            self.launch_and_count(config, cancel, &plan, state, false).await;
        }
        Ok(())
    }

    /// Open beads of enabled projects that are not leased, not active and
    /// not waiting on an open dependency; best first.
    async fn collect_candidates(
        &self,
        config: &SchedulerConfig,
        report: &mut TickReport,
    ) -> Result<Vec<Candidate>> {
        let active = self.db.get_active_dispatch_bead_ids().await?;
        let leased: HashSet<String> = self
            .db
            .list_claim_leases()
            .await?
            .into_iter()
            .map(|lease| lease.bead_id.value().to_string())
            .collect();

        let mut candidates = Vec::new();
        for (project_id, project) in config.enabled_projects() {
            let beads = match self.beads.list_beads(&project_id).await {
                Ok(beads) => beads,
                Err(err) => {
                    report.failures += 1;
                    warn!(project = %project_id, error = %err, "Failed to list beads");
                    continue;
                }
            };
            let open: HashSet<&BeadId> = beads
                .iter()
                .filter(|bead| bead.is_open())
                .map(|bead| &bead.id)
                .collect();
            let ready: Vec<Bead> = beads
                .iter()
                .filter(|bead| bead.is_open())
                .filter(|bead| !active.contains(bead.id.value()) && !leased.contains(bead.id.value()))
                .filter(|bead| !bead.depends_on.iter().any(|dep| open.contains(dep)))
                .cloned()
                .collect();
            candidates.extend(ready.into_iter().map(|bead| Candidate {
                bead,
                project_priority: project.priority,
            }));
        }
        candidates.sort_by(|a, b| {
            a.bead
                .priority
                .cmp(&b.bead.priority)
                .then(a.project_priority.cmp(&b.project_priority))
                .then(a.bead.created_at.cmp(&b.bead.created_at))
                .then_with(|| a.bead.id.cmp(&b.bead.id))
        });
        Ok(candidates)
    }

    async fn should_skip(&self, config: &SchedulerConfig, bead_id: &BeadId) -> Result<Option<Skip>> {
        if self
            .db
            .was_bead_dispatched_recently(bead_id, config.cooldown())
            .await?
        {
            return Ok(Some(Skip::Cooldown));
        }
        let threshold = config.retry.failure_streak_threshold;
        if threshold > 0
            && self
                .db
                .count_consecutive_failures(bead_id, config.retry.streak_lookback())
                .await?
                >= threshold
        {
            return Ok(Some(Skip::Quarantined));
        }
        Ok(None)
    }

    /// Stage to dispatch for: the stored position when one exists, otherwise
    /// the labelled stage. `None` once the pipeline is complete.
    async fn stage_for(
        &self,
        project: &ProjectId,
        bead_id: &BeadId,
        workflow: &WorkflowDefinition,
        label: Option<&str>,
    ) -> Result<Option<StageAssignment>> {
        match self.db.get_bead_stage(project, bead_id).await? {
            Some(stage) if stage.completed => Ok(None),
            Some(stage) => Ok(Some(StageAssignment {
                workflow: stage.workflow,
                stage: stage.current_stage,
                stage_index: stage.stage_index,
                total_stages: stage.total_stages,
            })),
            None => Ok(workflow.resolve(label)),
        }
    }

    async fn launch_and_count(
        &self,
        config: &SchedulerConfig,
        cancel: &CancellationToken,
        plan: &LaunchPlan,
        state: &mut TickState,
        is_retry: bool,
    ) {
        match self.launch(config, cancel, plan).await {
            Ok(LaunchOutcome::Dispatched(_)) => {
                state.budget = state.budget.saturating_sub(1);
                if is_retry {
                    state.report.retried += 1;
                } else {
                    state.report.dispatched += 1;
                    *state
                        .active_by_project
                        .entry(plan.project.clone())
                        .or_insert(0) += 1;
                }
            }
            Ok(LaunchOutcome::Contention) => state.report.skipped_contention += 1,
            Ok(LaunchOutcome::QuotaDenied(reason)) => {
                state.report.skipped_quota += 1;
                state.quota_exhausted = true;
                info!(bead_id = %plan.bead_id, reason = %reason, "Authed quota reached; no more launches this tick");
            }
            Ok(LaunchOutcome::LaunchFailed(_)) => {
                state.budget = state.budget.saturating_sub(1);
                state.report.launch_failures += 1;
            }
            Ok(LaunchOutcome::Cancelled) => state.report.cancelled = true,
            Err(err) => {
                state.report.failures += 1;
                warn!(bead_id = %plan.bead_id, project = %plan.project, error = %err, "Dispatch failed");
            }
        }
    }

    async fn abandon(&self, id: DispatchId, reason: &str) {
        if let Err(err) = self.db.abandon_pending_retry(id, reason).await {
            warn!(dispatch_id = id.value(), error = %err, "Failed to abandon pending retry");
        }
    }
}

enum Skip {
    Cooldown,
    Quarantined,
}
