#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![forbid(unsafe_code)]

use crate::db::mappers::{to_millis, to_u32_i64};
use crate::db::read_ops::BeadStageRow;
use crate::db::SwarmDb;
use crate::error::{store_error, Result, SwarmError};
use crate::types::{BeadId, BeadStage, DispatchId, ProjectId, StageAssignment, StageStatus};
use crate::workflow::WorkflowDefinition;
use chrono::Utc;
use sqlx::SqliteConnection;
use tracing::info;

/// Create the stage row if absent and open a history entry for this attempt.
/// An existing row keeps its position.
pub(super) async fn write_stage_start(
    conn: &mut SqliteConnection,
    project: &ProjectId,
    bead_id: &BeadId,
    stage: &StageAssignment,
    dispatch_id: Option<DispatchId>,
    now: i64,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO bead_stages (
            project, bead_id, workflow, current_stage, stage_index, total_stages, completed,
            created_at, updated_at
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7, ?7)
         ON CONFLICT (project, bead_id) DO UPDATE SET updated_at = excluded.updated_at",
    )
    .bind(project.value())
    .bind(bead_id.value())
    .bind(&stage.workflow)
    .bind(&stage.stage)
    .bind(i64::from(stage.stage_index))
    .bind(i64::from(stage.total_stages))
    .bind(now)
    .execute(&mut *conn)
    .await
    .map_err(|e| store_error("Failed to write bead stage", e))?;

    let current = sqlx::query_scalar::<_, String>(
        "SELECT current_stage FROM bead_stages WHERE project = ?1 AND bead_id = ?2",
    )
    .bind(project.value())
    .bind(bead_id.value())
    .fetch_one(&mut *conn)
    .await
    .map_err(|e| store_error("Failed to read bead stage", e))?;

    insert_history(
        conn,
        project,
        bead_id,
        &current,
        StageStatus::Started,
        None,
        dispatch_id,
        now,
    )
    .await
}

#[allow(clippy::too_many_arguments)]
async fn insert_history(
    conn: &mut SqliteConnection,
    project: &ProjectId,
    bead_id: &BeadId,
    stage: &str,
    status: StageStatus,
    completed_at: Option<i64>,
    dispatch_id: Option<DispatchId>,
    now: i64,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO bead_stage_history (project, bead_id, stage, status, started_at, completed_at, dispatch_id)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
    )
    .bind(project.value())
    .bind(bead_id.value())
    .bind(stage)
    .bind(status.as_str())
    .bind(now)
    .bind(completed_at)
    .bind(dispatch_id.map(DispatchId::value))
    .execute(&mut *conn)
    .await
    .map(|_| ())
    .map_err(|e| store_error("Failed to write stage history", e))
}

/// Close every open history entry of `stage` with `status`.
async fn close_open_history(
    conn: &mut SqliteConnection,
    project: &ProjectId,
    bead_id: &BeadId,
    stage: &str,
    status: StageStatus,
    now: i64,
) -> Result<u64> {
    sqlx::query(
        "UPDATE bead_stage_history SET status = ?1, completed_at = ?2
         WHERE project = ?3 AND bead_id = ?4 AND stage = ?5 AND status = 'started'",
    )
    .bind(status.as_str())
    .bind(now)
    .bind(project.value())
    .bind(bead_id.value())
    .bind(stage)
    .execute(&mut *conn)
    .await
    .map(|result| result.rows_affected())
    .map_err(|e| store_error("Failed to close stage history", e))
}

async fn load_stage_row(
    conn: &mut SqliteConnection,
    project: &ProjectId,
    bead_id: &BeadId,
) -> Result<BeadStageRow> {
    sqlx::query_as::<_, BeadStageRow>(
        "SELECT project, bead_id, workflow, current_stage, stage_index, total_stages, completed, updated_at
         FROM bead_stages WHERE project = ?1 AND bead_id = ?2",
    )
    .bind(project.value())
    .bind(bead_id.value())
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| store_error("Failed to load bead stage", e))?
    .ok_or_else(|| {
        SwarmError::BeadError(format!("No stage row for bead {bead_id} in project {project}"))
    })
}

async fn move_to_stage(
    conn: &mut SqliteConnection,
    project: &ProjectId,
    bead_id: &BeadId,
    stage: &str,
    index: u32,
    completed: bool,
    now: i64,
) -> Result<()> {
    sqlx::query(
        "UPDATE bead_stages SET current_stage = ?1, stage_index = ?2, completed = ?3, updated_at = ?4
         WHERE project = ?5 AND bead_id = ?6",
    )
    .bind(stage)
    .bind(i64::from(index))
    .bind(completed)
    .bind(now)
    .bind(project.value())
    .bind(bead_id.value())
    .execute(&mut *conn)
    .await
    .map(|_| ())
    .map_err(|e| store_error("Failed to move bead stage", e))
}

/// Pass the current stage and move to the next, or mark the pipeline
/// complete after the last stage.
pub(super) async fn advance_in(
    conn: &mut SqliteConnection,
    project: &ProjectId,
    bead_id: &BeadId,
    workflow: &WorkflowDefinition,
    now: i64,
) -> Result<()> {
    let row = load_stage_row(conn, project, bead_id).await?;
    if row.completed != 0 {
        return Err(SwarmError::StageError(format!(
            "Bead {bead_id} already completed workflow {}",
            row.workflow
        )));
    }
    close_open_history(conn, project, bead_id, &row.current_stage, StageStatus::Passed, now).await?;
    match workflow.next_stage(&row.current_stage) {
        Some(next) => {
            let index = workflow
                .stage_index(&next.name)
                .unwrap_or_else(|| to_u32_i64(row.stage_index).saturating_add(1));
            move_to_stage(conn, project, bead_id, &next.name, index, false, now).await
        }
        None => {
            let index = to_u32_i64(row.stage_index);
            move_to_stage(conn, project, bead_id, &row.current_stage, index, true, now).await
        }
    }
}

/// Move back to `to_stage`, which must not lie after the current stage.
pub(super) async fn revert_in(
    conn: &mut SqliteConnection,
    project: &ProjectId,
    bead_id: &BeadId,
    workflow: &WorkflowDefinition,
    to_stage: &str,
    now: i64,
) -> Result<()> {
    let target = workflow.stage_index(to_stage).ok_or_else(|| {
        SwarmError::StageError(format!(
            "Stage {to_stage} is not part of workflow {}",
            workflow.name
        ))
    })?;
    let row = load_stage_row(conn, project, bead_id).await?;
    if i64::from(target) > row.stage_index {
        return Err(SwarmError::StageError(format!(
            "Cannot revert bead {bead_id} forward from {} to {to_stage}",
            row.current_stage
        )));
    }
    let closed =
        close_open_history(conn, project, bead_id, &row.current_stage, StageStatus::Reverted, now).await?;
    if closed == 0 {
        insert_history(
            conn,
            project,
            bead_id,
            &row.current_stage,
            StageStatus::Reverted,
            Some(now),
            None,
            now,
        )
        .await?;
    }
    move_to_stage(conn, project, bead_id, to_stage, target, false, now).await
}

impl SwarmDb {
    /// Place a bead at `stage`, replacing any previous position.
    ///
    /// # Errors
    /// Returns an error if the write fails.
    pub async fn upsert_bead_stage(
        &self,
        project: &ProjectId,
        bead_id: &BeadId,
        stage: &StageAssignment,
    ) -> Result<BeadStage> {
        let now = to_millis(Utc::now());
        let mut tx = self
            .pool()
            .begin()
            .await
            .map_err(|e| store_error("Failed to begin stage tx", e))?;

        let written = async {
            sqlx::query(
                "INSERT INTO bead_stages (
                    project, bead_id, workflow, current_stage, stage_index, total_stages, completed,
                    created_at, updated_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7, ?7)
                 ON CONFLICT (project, bead_id) DO UPDATE SET
                    workflow = excluded.workflow,
                    current_stage = excluded.current_stage,
                    stage_index = excluded.stage_index,
                    total_stages = excluded.total_stages,
                    completed = 0,
                    updated_at = excluded.updated_at",
            )
            .bind(project.value())
            .bind(bead_id.value())
            .bind(&stage.workflow)
            .bind(&stage.stage)
            .bind(i64::from(stage.stage_index))
            .bind(i64::from(stage.total_stages))
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(|e| store_error("Failed to upsert bead stage", e))?;
            insert_history(&mut tx, project, bead_id, &stage.stage, StageStatus::Started, None, None, now)
                .await
        }
        .await;

        finish(tx, written).await?;
        self.require_bead_stage(project, bead_id).await
    }

    /// Pass the current stage and move to the next one, or mark the bead's
    /// pipeline complete when the current stage is the last.
    ///
    /// # Errors
    /// Returns an error if the bead has no stage row, is already complete, or
    /// the write fails.
    pub async fn advance_bead_stage(
        &self,
        project: &ProjectId,
        bead_id: &BeadId,
        workflow: &WorkflowDefinition,
    ) -> Result<BeadStage> {
        let now = to_millis(Utc::now());
        let mut tx = self
            .pool()
            .begin()
            .await
            .map_err(|e| store_error("Failed to begin stage tx", e))?;

        let written = advance_in(&mut tx, project, bead_id, workflow, now).await;

        finish(tx, written).await?;
        let stage = self.require_bead_stage(project, bead_id).await?;
        info!(
            project = %project,
            bead_id = %bead_id,
            stage = %stage.current_stage,
            completed = stage.completed,
            "Advanced bead stage"
        );
        Ok(stage)
    }

    /// Send a bead back to an earlier (or the same) stage of its workflow.
    ///
    /// # Errors
    /// Returns an error if `to_stage` is not part of the workflow or lies
    /// after the current stage, or if the write fails.
    pub async fn revert_bead_stage(
        &self,
        project: &ProjectId,
        bead_id: &BeadId,
        workflow: &WorkflowDefinition,
        to_stage: &str,
    ) -> Result<BeadStage> {
        let now = to_millis(Utc::now());
        let mut tx = self
            .pool()
            .begin()
            .await
            .map_err(|e| store_error("Failed to begin stage tx", e))?;

        let written = revert_in(&mut tx, project, bead_id, workflow, to_stage, now).await;

        finish(tx, written).await?;
        self.require_bead_stage(project, bead_id).await
    }

    /// Close the history entry opened by `dispatch_id` as failed. The bead
    /// stays at its stage.
    ///
    /// # Errors
    /// Returns an error if the update fails.
    pub async fn mark_stage_attempt_failed(&self, dispatch_id: DispatchId) -> Result<bool> {
        sqlx::query(
            "UPDATE bead_stage_history SET status = 'failed', completed_at = ?1
             WHERE dispatch_id = ?2 AND status = 'started'",
        )
        .bind(to_millis(Utc::now()))
        .bind(dispatch_id.value())
        .execute(self.pool())
        .await
        .map(|result| result.rows_affected() > 0)
        .map_err(|e| store_error("Failed to fail stage attempt", e))
    }

    /// Remove a bead's stage row and its history.
    ///
    /// # Errors
    /// Returns an error if the delete fails.
    pub async fn delete_bead_stage(&self, project: &ProjectId, bead_id: &BeadId) -> Result<bool> {
        let mut tx = self
            .pool()
            .begin()
            .await
            .map_err(|e| store_error("Failed to begin stage tx", e))?;

        let written = async {
            sqlx::query("DELETE FROM bead_stage_history WHERE project = ?1 AND bead_id = ?2")
                .bind(project.value())
                .bind(bead_id.value())
                .execute(&mut *tx)
                .await
                .map_err(|e| store_error("Failed to delete stage history", e))?;
            sqlx::query("DELETE FROM bead_stages WHERE project = ?1 AND bead_id = ?2")
                .bind(project.value())
                .bind(bead_id.value())
                .execute(&mut *tx)
                .await
                .map(|result| result.rows_affected() > 0)
                .map_err(|e| store_error("Failed to delete bead stage", e))
        }
        .await;

        finish(tx, written).await
    }

    async fn require_bead_stage(&self, project: &ProjectId, bead_id: &BeadId) -> Result<BeadStage> {
        self.get_bead_stage(project, bead_id).await?.ok_or_else(|| {
            SwarmError::BeadError(format!("No stage row for bead {bead_id} in project {project}"))
        })
    }
}

/// Commit on success, roll back on failure, and hand back the inner result.
pub(super) async fn finish<T>(
    tx: sqlx::Transaction<'static, sqlx::Sqlite>,
    written: Result<T>,
) -> Result<T> {
    match written {
        Ok(value) => tx
            .commit()
            .await
            .map(|()| value)
            .map_err(|e| store_error("Failed to commit tx", e)),
        Err(err) => {
            tx.rollback()
                .await
                .map_err(|e| store_error("Failed to roll back tx", e))?;
            Err(err)
        }
    }
}
