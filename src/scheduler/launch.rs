//! Quota, claim, launch, record: the per-bead path shared by fresh
//! candidates and pending retries.

use super::Scheduler;
use crate::claims::ClaimLeaseManager;
use crate::config::{ProviderSelection, SchedulerConfig};
use crate::db::SchedulerDispatchRecord;
use crate::error::{Result, SwarmError};
use crate::labels::Labels;
use crate::ports::DispatchRequest;
use crate::rate_limiter::RateLimiter;
use crate::types::{AgentId, BeadId, DispatchId, HealthEventKind, ProjectId, StageAssignment, Tier};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub(super) struct LaunchPlan {
    pub bead_id: BeadId,
    pub project: ProjectId,
    pub workspace: PathBuf,
    pub agent: AgentId,
    pub prompt: String,
    pub tier: Tier,
    pub labels: Labels,
    pub stage: Option<StageAssignment>,
    pub retries: u32,
    pub escalated_from_tier: Option<Tier>,
    pub retry_of: Option<DispatchId>,
    /// Stage label the bead source currently carries, for fresh launches.
    pub stage_label_in_source: Option<String>,
}

impl LaunchPlan {
    fn record(
        &self,
        selection: &ProviderSelection,
        handle: Option<i64>,
        session_name: Option<String>,
    ) -> SchedulerDispatchRecord {
        SchedulerDispatchRecord {
            bead_id: self.bead_id.clone(),
            project: self.project.clone(),
            agent_id: self.agent.clone(),
            provider: selection.provider.clone(),
            tier: selection.tier,
            handle,
            session_name,
            prompt: self.prompt.clone(),
            workdir: self.workspace.display().to_string(),
            labels: self.labels.clone(),
            stage: self.stage.clone(),
            retries: self.retries,
            escalated_from_tier: self.escalated_from_tier,
            retry_of: self.retry_of,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) enum LaunchOutcome {
    Dispatched(DispatchId),
    Contention,
    QuotaDenied(String),
    /// The dispatcher could not start a worker; recorded as failed.
    LaunchFailed(DispatchId),
    Cancelled,
}

impl Scheduler {
    pub(super) async fn launch(
        &self,
        config: &SchedulerConfig,
        cancel: &CancellationToken,
        plan: &LaunchPlan,
    ) -> Result<LaunchOutcome> {
        let selection = config.select_provider(plan.tier).ok_or_else(|| {
            SwarmError::ConfigError(format!("No provider staffed at or above tier {}", plan.tier))
        })?;
        let limiter = RateLimiter::new(self.db.clone(), config.rate_limits.clone());
        if selection.authed && !limiter.is_strict() {
            let decision = limiter.can_dispatch_authed().await?;
            if !decision.allowed {
                return Ok(LaunchOutcome::QuotaDenied(decision.reason));
            }
        }

        let claims = self.claims(config);
        let workspace = plan.workspace.display().to_string();
        match claims.acquire(&plan.bead_id, &plan.project, &workspace).await {
            Ok(_) => {}
            Err(err) if err.is_contention() => {
                debug!(bead_id = %plan.bead_id, error = %err, "Bead claimed elsewhere");
                return Ok(LaunchOutcome::Contention);
            }
            Err(err) => return Err(err),
        }

        if selection.authed && limiter.is_strict() {
            let reserved = limiter
                .try_reserve_authed(&selection.provider, &plan.agent, &plan.bead_id)
                .await;
            match reserved {
                Ok(decision) if decision.allowed => {}
                Ok(decision) => {
                    release_quietly(&claims, &plan.bead_id).await;
                    return Ok(LaunchOutcome::QuotaDenied(decision.reason));
                }
                Err(err) => {
                    release_quietly(&claims, &plan.bead_id).await;
                    return Err(err);
                }
            }
        }

        let request = DispatchRequest {
            agent: plan.agent.clone(),
            prompt: plan.prompt.clone(),
            provider: selection.provider.clone(),
            thinking_level: selection.thinking_level.clone(),
            workdir: plan.workspace.clone(),
        };
        let launched = tokio::time::timeout(
            config.dispatch_timeout(),
            self.dispatcher.dispatch(cancel, &request),
        )
        .await
        .unwrap_or_else(|_| {
            Err(SwarmError::DispatchFailed(format!(
                "dispatcher did not answer within {}s",
                config.dispatch_timeout_secs
            )))
        });

        let handle = match launched {
            Ok(handle) => handle,
            Err(_) if cancel.is_cancelled() => {
                release_quietly(&claims, &plan.bead_id).await;
                info!(bead_id = %plan.bead_id, "Launch abandoned on cancellation");
                return Ok(LaunchOutcome::Cancelled);
            }
            Err(err) => {
                release_quietly(&claims, &plan.bead_id).await;
                return self.record_launch_failure(config, plan, &selection, &err).await;
            }
        };

        if selection.authed && !limiter.is_strict() {
            if let Err(err) = limiter
                .record_authed_dispatch(&selection.provider, &plan.agent, &plan.bead_id)
                .await
            {
                warn!(bead_id = %plan.bead_id, error = %err, "Failed to record authed usage");
            }
        }

        let record = plan.record(
            &selection,
            Some(handle.value()),
            Some(self.dispatcher.session_name(handle)),
        );
        let id = match self.db.record_scheduler_dispatch(&record).await {
            Ok(id) => id,
            Err(err) => {
                // Nothing references the worker now; stop it and free the bead.
                if let Err(kill_err) = self.dispatcher.kill(handle).await {
                    warn!(bead_id = %plan.bead_id, error = %kill_err, "Failed to stop unrecorded worker");
                }
                release_quietly(&claims, &plan.bead_id).await;
                return Err(err);
            }
        };

        self.sync_stage_label(plan).await;
        info!(
            dispatch_id = id.value(),
            bead_id = %plan.bead_id,
            project = %plan.project,
            tier = %selection.tier,
            provider = %selection.provider,
            retry_of = plan.retry_of.map(DispatchId::value),
            "Dispatched bead"
        );
        Ok(LaunchOutcome::Dispatched(id))
    }

    async fn record_launch_failure(
        &self,
        config: &SchedulerConfig,
        plan: &LaunchPlan,
        selection: &ProviderSelection,
        err: &SwarmError,
    ) -> Result<LaunchOutcome> {
        if let Some(previous) = plan.retry_of {
            self.db.mark_dispatch_retried(previous).await?;
        }
        let summary = err.to_string();
        let id = self
            .db
            .record_failed_dispatch(&plan.record(selection, None, None), &summary)
            .await?;
        self.db
            .record_health_event(
                HealthEventKind::DispatchError,
                Some(&plan.project),
                Some(&plan.bead_id),
                Some(id),
                &summary,
            )
            .await?;
        let decision = self.retry_engine(config).apply_policy(id).await?;
        warn!(
            dispatch_id = id.value(),
            bead_id = %plan.bead_id,
            error = %err,
            decision = ?decision,
            "Worker launch failed"
        );
        Ok(LaunchOutcome::LaunchFailed(id))
    }

    /// Bring the bead source's stage label in line with the stage dispatched.
    async fn sync_stage_label(&self, plan: &LaunchPlan) {
        let Some(stage) = plan.stage.as_ref() else {
            return;
        };
        if plan.retry_of.is_some() || plan.stage_label_in_source.as_deref() == Some(stage.stage.as_str()) {
            return;
        }
        if let Err(err) = self
            .beads
            .set_stage_label(&plan.project, &plan.bead_id, &stage.stage)
            .await
        {
            warn!(bead_id = %plan.bead_id, stage = %stage.stage, error = %err, "Failed to write stage label");
        }
    }
}

async fn release_quietly(claims: &ClaimLeaseManager, bead_id: &BeadId) {
    if let Err(err) = claims.release(bead_id).await {
        warn!(bead_id = %bead_id, error = %err, "Failed to release claim lease");
    }
}
