#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![forbid(unsafe_code)]

use super::helpers::sanitize_summary;
use super::stage_ops::{advance_in, finish, revert_in, write_stage_start};
use super::types::{DispatchUsage, SchedulerDispatchRecord, StageTransition};
use crate::db::mappers::to_millis;
use crate::db::{FaultCheckpoint, SwarmDb};
use crate::error::{store_error, Result, SwarmError};
use crate::types::{BeadId, DispatchId, DispatchStatus, FailureCategory, ProjectId, Tier};
use chrono::Utc;
use sqlx::sqlite::SqliteQueryResult;
use sqlx::SqliteConnection;
use tracing::debug;

/// Statuses a dispatch may still move out of.
const OPEN_STATUSES: &str = "('dispatched', 'running', 'pending_retry')";

impl SwarmDb {
    /// Persist one launched attempt: the dispatch row, its stage placement and
    /// history entry, and the lease link, all in one transaction.
    ///
    /// # Errors
    /// Returns an error (and leaves no rows behind) if any statement or fault
    /// checkpoint fails.
    pub async fn record_scheduler_dispatch(
        &self,
        record: &SchedulerDispatchRecord,
    ) -> Result<DispatchId> {
        let mut tx = self
            .pool()
            .begin()
            .await
            .map_err(|e| store_error("Failed to begin dispatch tx", e))?;

        match self.write_scheduler_dispatch(&mut tx, record).await {
            Ok(id) => {
                tx.commit()
                    .await
                    .map_err(|e| store_error("Failed to commit dispatch tx", e))?;
                debug!(dispatch_id = id.value(), bead_id = %record.bead_id, "Recorded dispatch");
                Ok(id)
            }
            Err(err) => {
                tx.rollback()
                    .await
                    .map_err(|e| store_error("Failed to roll back dispatch tx", e))?;
                Err(err)
            }
        }
    }

    async fn write_scheduler_dispatch(
        &self,
        conn: &mut SqliteConnection,
        record: &SchedulerDispatchRecord,
    ) -> Result<DispatchId> {
        self.checkpoint(FaultCheckpoint::BeforeInsert)?;

        if let Some(previous) = record.retry_of {
            let replaced = sqlx::query(
                "UPDATE dispatches SET status = 'retried', stage = 'retried'
                 WHERE id = ?1 AND status = 'pending_retry'",
            )
            .bind(previous.value())
            .execute(&mut *conn)
            .await
            .map_err(|e| store_error("Failed to mark dispatch retried", e))?;
            if replaced.rows_affected() == 0 {
                return Err(SwarmError::StageError(format!(
                    "Dispatch {previous} is no longer pending retry"
                )));
            }
        }

        let now = to_millis(Utc::now());
        let id = sqlx::query_scalar::<_, i64>(
            "INSERT INTO dispatches (
                bead_id, project, agent_id, provider, tier, handle, session_name, prompt,
                workdir, labels, status, stage, dispatched_at, retries, escalated_from_tier
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 'running', 'dispatched', ?11, ?12, ?13)
             RETURNING id",
        )
        .bind(record.bead_id.value())
        .bind(record.project.value())
        .bind(record.agent_id.value())
        .bind(&record.provider)
        .bind(record.tier.as_str())
        .bind(record.handle)
        .bind(record.session_name.as_deref())
        .bind(&record.prompt)
        .bind(&record.workdir)
        .bind(record.stored_labels().to_storage()?)
        .bind(now)
        .bind(i64::from(record.retries))
        .bind(record.escalated_from_tier.map(|tier| tier.as_str()))
        .fetch_one(&mut *conn)
        .await
        .map_err(|e| store_error("Failed to insert dispatch", e))?;
        let id = DispatchId::new(id);

        self.checkpoint(FaultCheckpoint::AfterInsert)?;
        self.checkpoint(FaultCheckpoint::BeforeStageWrite)?;

        if let Some(stage) = &record.stage {
            write_stage_start(conn, &record.project, &record.bead_id, stage, Some(id), now).await?;
        }

        sqlx::query("UPDATE claim_leases SET dispatch_id = ?1, heartbeat_at = ?2 WHERE bead_id = ?3")
            .bind(id.value())
            .bind(now)
            .bind(record.bead_id.value())
            .execute(&mut *conn)
            .await
            .map_err(|e| store_error("Failed to link lease to dispatch", e))?;

        Ok(id)
    }

    /// Record an attempt whose launch failed; no worker exists for it.
    ///
    /// # Errors
    /// Returns an error if the insert fails.
    pub async fn record_failed_dispatch(
        &self,
        record: &SchedulerDispatchRecord,
        summary: &str,
    ) -> Result<DispatchId> {
        let now = to_millis(Utc::now());
        sqlx::query_scalar::<_, i64>(
            "INSERT INTO dispatches (
                bead_id, project, agent_id, provider, tier, prompt, workdir, labels, status,
                stage, dispatched_at, completed_at, duration_s, retries, escalated_from_tier,
                failure_category, failure_summary
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 'failed', 'failed', ?9, ?9, 0, ?10, ?11, ?12, ?13)
             RETURNING id",
        )
        .bind(record.bead_id.value())
        .bind(record.project.value())
        .bind(record.agent_id.value())
        .bind(&record.provider)
        .bind(record.tier.as_str())
        .bind(&record.prompt)
        .bind(&record.workdir)
        .bind(record.stored_labels().to_storage()?)
        .bind(now)
        .bind(i64::from(record.retries))
        .bind(record.escalated_from_tier.map(|tier| tier.as_str()))
        .bind(FailureCategory::DispatchError.as_str())
        .bind(sanitize_summary(summary))
        .fetch_one(self.pool())
        .await
        .map(DispatchId::new)
        .map_err(|e| store_error("Failed to record failed dispatch", e))
    }

    /// Move a dispatch to `status`. Terminal statuses also stamp completion
    /// time and duration. Only open dispatches move; returns `false` when the
    /// row was already closed.
    ///
    /// # Errors
    /// Returns an error if the dispatch does not exist or the update fails.
    pub async fn update_dispatch_status(
        &self,
        id: DispatchId,
        status: DispatchStatus,
        exit_code: Option<i32>,
    ) -> Result<bool> {
        self.write_status(id, status, exit_code, None).await
    }

    /// Close a dispatch with a failure classification and redacted summary.
    ///
    /// # Errors
    /// Returns an error if the dispatch does not exist or the update fails.
    pub async fn update_dispatch_failure(
        &self,
        id: DispatchId,
        status: DispatchStatus,
        category: FailureCategory,
        summary: &str,
        exit_code: Option<i32>,
    ) -> Result<bool> {
        self.write_status(id, status, exit_code, Some((category, summary)))
            .await
    }

    async fn write_status(
        &self,
        id: DispatchId,
        status: DispatchStatus,
        exit_code: Option<i32>,
        failure: Option<(FailureCategory, &str)>,
    ) -> Result<bool> {
        let now = to_millis(Utc::now());
        let terminal = status.is_terminal();
        let sql = format!(
            "UPDATE dispatches SET
                status = ?1,
                stage = ?1,
                exit_code = COALESCE(?2, exit_code),
                completed_at = CASE WHEN ?3 THEN COALESCE(completed_at, ?4) ELSE completed_at END,
                duration_s = CASE WHEN ?3 THEN (?4 - dispatched_at) / 1000.0 ELSE duration_s END,
                failure_category = COALESCE(?5, failure_category),
                failure_summary = COALESCE(?6, failure_summary)
             WHERE id = ?7 AND status IN {OPEN_STATUSES}"
        );
        let result = sqlx::query(&sql)
            .bind(status.as_str())
            .bind(exit_code)
            .bind(terminal)
            .bind(now)
            .bind(failure.map(|(category, _)| category.as_str()))
            .bind(failure.map(|(_, summary)| sanitize_summary(summary)))
            .bind(id.value())
            .execute(self.pool())
            .await
            .map_err(|e| store_error("Failed to update dispatch status", e))?;
        self.applied_or_missing(id, &result).await
    }

    /// Close an open dispatch as completed, apply `transition` to its bead's
    /// stage and release the bead's lease, all in one transaction. Returns
    /// `false`, writing nothing, when the dispatch was already closed.
    ///
    /// # Errors
    /// Returns an error (and leaves the dispatch open) if the dispatch does
    /// not exist, the stage move is rejected, or a write fails.
    pub async fn complete_dispatch_with_stage(
        &self,
        id: DispatchId,
        project: &ProjectId,
        bead_id: &BeadId,
        transition: Option<StageTransition<'_>>,
    ) -> Result<bool> {
        let now = to_millis(Utc::now());
        let mut tx = self
            .pool()
            .begin()
            .await
            .map_err(|e| store_error("Failed to begin completion tx", e))?;

        let written = async {
            let sql = format!(
                "UPDATE dispatches SET
                    status = 'completed',
                    stage = 'completed',
                    exit_code = 0,
                    completed_at = COALESCE(completed_at, ?1),
                    duration_s = (?1 - dispatched_at) / 1000.0
                 WHERE id = ?2 AND status IN {OPEN_STATUSES}"
            );
            let closed = sqlx::query(&sql)
                .bind(now)
                .bind(id.value())
                .execute(&mut *tx)
                .await
                .map_err(|e| store_error("Failed to complete dispatch", e))?;
            if closed.rows_affected() == 0 {
                let exists = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM dispatches WHERE id = ?1")
                    .bind(id.value())
                    .fetch_one(&mut *tx)
                    .await
                    .map_err(|e| store_error("Failed to check dispatch", e))?;
                if exists == 0 {
                    return Err(SwarmError::BeadError(format!("Dispatch {id} not found")));
                }
                return Ok(false);
            }

            match transition {
                Some(StageTransition::Advance(workflow)) => {
                    advance_in(&mut tx, project, bead_id, workflow, now).await?;
                }
                Some(StageTransition::Revert { workflow, to_stage }) => {
                    revert_in(&mut tx, project, bead_id, workflow, to_stage, now).await?;
                }
                None => {}
            }

            sqlx::query(
                "DELETE FROM claim_leases
                 WHERE bead_id = ?1 AND (dispatch_id IS NULL OR dispatch_id = ?2)",
            )
            .bind(bead_id.value())
            .bind(id.value())
            .execute(&mut *tx)
            .await
            .map_err(|e| store_error("Failed to release claim lease", e))?;
            Ok(true)
        }
        .await;

        finish(tx, written).await
    }

    /// Record the worker-reported stage without touching the status.
    ///
    /// # Errors
    /// Returns an error if the dispatch does not exist or the update fails.
    pub async fn update_dispatch_stage(&self, id: DispatchId, stage: DispatchStatus) -> Result<()> {
        let result = sqlx::query("UPDATE dispatches SET stage = ?1 WHERE id = ?2")
            .bind(stage.as_str())
            .bind(id.value())
            .execute(self.pool())
            .await
            .map_err(|e| store_error("Failed to update dispatch stage", e))?;
        self.applied_or_missing(id, &result).await.map(|_| ())
    }

    /// Queue a failed dispatch for another attempt at `next_tier`, counting a
    /// retry. The first tier change is remembered in `escalated_from_tier`.
    /// Returns `false` when the row was already queued or closed.
    ///
    /// # Errors
    /// Returns an error if the dispatch does not exist or the update fails.
    pub async fn mark_dispatch_pending_retry(&self, id: DispatchId, next_tier: Tier) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE dispatches SET
                retries = retries + 1,
                escalated_from_tier = COALESCE(
                    escalated_from_tier,
                    CASE WHEN tier <> ?1 THEN tier ELSE NULL END
                ),
                tier = ?1,
                status = 'pending_retry',
                stage = 'pending_retry',
                completed_at = COALESCE(completed_at, ?2)
             WHERE id = ?3 AND status IN ('dispatched', 'running', 'failed')",
        )
        .bind(next_tier.as_str())
        .bind(to_millis(Utc::now()))
        .bind(id.value())
        .execute(self.pool())
        .await
        .map_err(|e| store_error("Failed to mark dispatch pending retry", e))?;
        self.applied_or_missing(id, &result).await
    }

    /// Queue an interrupted dispatch again at the same tier without spending
    /// a retry.
    ///
    /// # Errors
    /// Returns an error if the dispatch does not exist or the update fails.
    pub async fn requeue_dispatch(&self, id: DispatchId) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE dispatches SET
                status = 'pending_retry',
                stage = 'pending_retry',
                completed_at = COALESCE(completed_at, ?1)
             WHERE id = ?2 AND status IN ('dispatched', 'running', 'interrupted')",
        )
        .bind(to_millis(Utc::now()))
        .bind(id.value())
        .execute(self.pool())
        .await
        .map_err(|e| store_error("Failed to requeue dispatch", e))?;
        self.applied_or_missing(id, &result).await
    }

    /// Close a pending-retry row whose replacement was recorded elsewhere, or
    /// that will not be retried.
    ///
    /// # Errors
    /// Returns an error if the dispatch does not exist or the update fails.
    pub async fn mark_dispatch_retried(&self, id: DispatchId) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE dispatches SET status = 'retried', stage = 'retried'
             WHERE id = ?1 AND status = 'pending_retry'",
        )
        .bind(id.value())
        .execute(self.pool())
        .await
        .map_err(|e| store_error("Failed to mark dispatch retried", e))?;
        self.applied_or_missing(id, &result).await
    }

    /// Give up on a pending-retry row: it becomes `failed`.
    ///
    /// # Errors
    /// Returns an error if the dispatch does not exist or the update fails.
    pub async fn abandon_pending_retry(&self, id: DispatchId, summary: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE dispatches SET status = 'failed', stage = 'failed',
                failure_summary = COALESCE(failure_summary, ?1)
             WHERE id = ?2 AND status = 'pending_retry'",
        )
        .bind(sanitize_summary(summary))
        .bind(id.value())
        .execute(self.pool())
        .await
        .map_err(|e| store_error("Failed to abandon pending retry", e))?;
        self.applied_or_missing(id, &result).await
    }

    /// # Errors
    /// Returns an error if the dispatch does not exist or the update fails.
    pub async fn update_dispatch_pr(
        &self,
        id: DispatchId,
        pr_url: &str,
        pr_number: Option<i64>,
    ) -> Result<()> {
        let result = sqlx::query("UPDATE dispatches SET pr_url = ?1, pr_number = ?2 WHERE id = ?3")
            .bind(pr_url)
            .bind(pr_number)
            .bind(id.value())
            .execute(self.pool())
            .await
            .map_err(|e| store_error("Failed to update dispatch PR", e))?;
        self.applied_or_missing(id, &result).await.map(|_| ())
    }

    /// # Errors
    /// Returns an error if the dispatch does not exist or the update fails.
    pub async fn update_dispatch_usage(&self, id: DispatchId, usage: DispatchUsage) -> Result<()> {
        let result = sqlx::query(
            "UPDATE dispatches SET input_tokens = ?1, output_tokens = ?2, cost_usd = ?3 WHERE id = ?4",
        )
        .bind(usage.input_tokens)
        .bind(usage.output_tokens)
        .bind(usage.cost_usd)
        .bind(id.value())
        .execute(self.pool())
        .await
        .map_err(|e| store_error("Failed to update dispatch usage", e))?;
        self.applied_or_missing(id, &result).await.map(|_| ())
    }

    /// `true` when the update touched the row; `false` when the row exists but
    /// the guard skipped it.
    async fn applied_or_missing(&self, id: DispatchId, result: &SqliteQueryResult) -> Result<bool> {
        if result.rows_affected() > 0 {
            return Ok(true);
        }
        let exists = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM dispatches WHERE id = ?1")
            .bind(id.value())
            .fetch_one(self.pool())
            .await
            .map_err(|e| store_error("Failed to check dispatch", e))?;
        if exists == 0 {
            return Err(SwarmError::BeadError(format!("Dispatch {id} not found")));
        }
        Ok(false)
    }
}
