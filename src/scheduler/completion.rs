use super::Scheduler;
use crate::config::SchedulerConfig;
use crate::db::StageTransition;
use crate::error::{Result, SwarmError};
use crate::retry::{FailureReport, RetryDecision};
use crate::types::{BeadId, BeadStage, Dispatch, DispatchId, DispatchStatus, FailureCategory, ProjectId};
use serde::Serialize;
use tracing::{info, warn};

/// How a worker finished, as reported by a completion callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Completed,
    /// Review sent the bead back to an earlier stage.
    ChangesRequested { revert_to: String },
    Failed {
        category: FailureCategory,
        summary: String,
        exit_code: Option<i32>,
    },
    Cancelled,
    Interrupted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum CompletionResult {
    /// `stage` is `None` for dispatches outside any pipeline.
    Advanced { stage: Option<BeadStage> },
    Reverted { stage: BeadStage },
    Failed { decision: RetryDecision },
    AlreadyClosed,
}

impl Scheduler {
    /// Close a dispatch with `outcome`. Success advances the bead's stage and
    /// writes the next stage label back; failures go to the retry engine.
    ///
    /// # Errors
    /// Returns an error if the dispatch does not exist, a revert target is
    /// invalid, or a store write fails.
    pub async fn complete_dispatch(&self, id: DispatchId, outcome: DispatchOutcome) -> Result<CompletionResult> {
        let config = self.config.current();
        self.complete_with(&config, id, outcome).await
    }

    pub(super) async fn complete_with(
        &self,
        config: &SchedulerConfig,
        id: DispatchId,
        outcome: DispatchOutcome,
    ) -> Result<CompletionResult> {
        let dispatch = self
            .db
            .get_dispatch_by_id(id)
            .await?
            .ok_or_else(|| SwarmError::BeadError(format!("Dispatch {id} not found")))?;
        if !matches!(dispatch.status, DispatchStatus::Dispatched | DispatchStatus::Running) {
            return Ok(CompletionResult::AlreadyClosed);
        }

        let report = match outcome {
            DispatchOutcome::Completed => return self.succeed(config, &dispatch, None).await,
            DispatchOutcome::ChangesRequested { revert_to } => {
                return self.succeed(config, &dispatch, Some(&revert_to)).await;
            }
            DispatchOutcome::Failed {
                category,
                summary,
                exit_code,
            } => FailureReport::failed(category, summary, exit_code),
            DispatchOutcome::Cancelled => FailureReport::cancelled("dispatch cancelled"),
            DispatchOutcome::Interrupted => {
                FailureReport::interrupted(FailureCategory::Unknown, "dispatch interrupted")
            }
        };
        let decision = self
            .retry_engine(config)
            .handle_failure(&dispatch, &report)
            .await?;
        Ok(CompletionResult::Failed { decision })
    }

    /// Status, stage move and lease release commit together, so a rejected
    /// stage move leaves the dispatch open and its lease held.
    async fn succeed(
        &self,
        config: &SchedulerConfig,
        dispatch: &Dispatch,
        revert_to: Option<&str>,
    ) -> Result<CompletionResult> {
        let project = &dispatch.project;
        let bead_id = &dispatch.bead_id;
        let current = self.db.get_bead_stage(project, bead_id).await?;
        let workflows = config.workflow_registry();
        let workflow = match &current {
            Some(stage) => Some(workflows.get(&stage.workflow).ok_or_else(|| {
                SwarmError::StageError(format!("Unknown workflow {}", stage.workflow))
            })?),
            None => None,
        };
        let transition = match (revert_to, &current, workflow) {
            (Some(to_stage), Some(_), Some(workflow)) => {
                Some(StageTransition::Revert { workflow, to_stage })
            }
            (Some(_), _, _) => {
                return Err(SwarmError::StageError(format!(
                    "Bead {bead_id} has no stage in {project}"
                )));
            }
            (None, Some(stage), Some(workflow)) if !stage.completed => {
                Some(StageTransition::Advance(workflow))
            }
            (None, _, _) => None,
        };

        if !self
            .db
            .complete_dispatch_with_stage(dispatch.id, project, bead_id, transition)
            .await?
        {
            return Ok(CompletionResult::AlreadyClosed);
        }
        let stage = self.db.get_bead_stage(project, bead_id).await?;
        if transition.is_some() {
            if let Some(moved) = &stage {
                if moved.completed {
                    info!(bead_id = %bead_id, project = %project, "Pipeline complete");
                } else {
                    self.write_label(project, bead_id, &moved.current_stage).await;
                }
            }
        }
        info!(
            dispatch_id = dispatch.id.value(),
            bead_id = %bead_id,
            project = %project,
            stage = stage.as_ref().map(|s| s.current_stage.as_str()),
            "Dispatch completed"
        );
        match (revert_to, stage) {
            (Some(_), Some(stage)) => Ok(CompletionResult::Reverted { stage }),
            (Some(_), None) => Err(SwarmError::StageError(format!(
                "Bead {bead_id} lost its stage in {project}"
            ))),
            (None, stage) => Ok(CompletionResult::Advanced { stage }),
        }
    }

    async fn write_label(&self, project: &ProjectId, bead_id: &BeadId, stage: &str) {
        if let Err(err) = self.beads.set_stage_label(project, bead_id, stage).await {
            warn!(bead_id = %bead_id, stage, error = %err, "Failed to write stage label");
        }
    }
}
