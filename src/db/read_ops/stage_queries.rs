use super::types::{BeadStageRow, StageHistoryRow};
use crate::db::mappers::{parse_bead_stage, parse_stage_history};
use crate::db::SwarmDb;
use crate::error::{store_error, Result, SwarmError};
use crate::types::{BeadId, BeadStage, ProjectId};

const STAGE_COLUMNS: &str =
    "project, bead_id, workflow, current_stage, stage_index, total_stages, completed, updated_at";

impl SwarmDb {
    /// # Errors
    /// Returns an error if the query fails or a row cannot be decoded.
    pub async fn get_bead_stage(&self, project: &ProjectId, bead_id: &BeadId) -> Result<Option<BeadStage>> {
        let row = sqlx::query_as::<_, BeadStageRow>(&format!(
            "SELECT {STAGE_COLUMNS} FROM bead_stages WHERE project = ?1 AND bead_id = ?2"
        ))
        .bind(project.value())
        .bind(bead_id.value())
        .fetch_optional(self.pool())
        .await
        .map_err(|e| store_error("Failed to load bead stage", e))?;

        match row {
            Some(row) => self.hydrate_stage(row).await.map(Some),
            None => Ok(None),
        }
    }

    /// Look a bead up by id alone. Fails with [`SwarmError::AmbiguousBead`]
    /// when the id exists in more than one project.
    ///
    /// # Errors
    /// Returns `AmbiguousBead`, or a store error.
    pub async fn get_bead_stage_by_bead_id(&self, bead_id: &BeadId) -> Result<Option<BeadStage>> {
        let mut rows = sqlx::query_as::<_, BeadStageRow>(&format!(
            "SELECT {STAGE_COLUMNS} FROM bead_stages WHERE bead_id = ?1 ORDER BY project"
        ))
        .bind(bead_id.value())
        .fetch_all(self.pool())
        .await
        .map_err(|e| store_error("Failed to load bead stage", e))?;

        if rows.len() > 1 {
            return Err(SwarmError::AmbiguousBead {
                bead_id: bead_id.value().to_string(),
                projects: rows.into_iter().map(|row| row.project).collect(),
            });
        }
        match rows.pop() {
            Some(row) => self.hydrate_stage(row).await.map(Some),
            None => Ok(None),
        }
    }

    /// Stage rows for one project, or for every project when `None`.
    ///
    /// # Errors
    /// Returns an error if the query fails or a row cannot be decoded.
    pub async fn list_bead_stages(&self, project: Option<&ProjectId>) -> Result<Vec<BeadStage>> {
        let rows = sqlx::query_as::<_, BeadStageRow>(&format!(
            "SELECT {STAGE_COLUMNS} FROM bead_stages
             WHERE ?1 IS NULL OR project = ?1
             ORDER BY project, bead_id"
        ))
        .bind(project.map(ProjectId::value))
        .fetch_all(self.pool())
        .await
        .map_err(|e| store_error("Failed to list bead stages", e))?;

        let mut stages = Vec::with_capacity(rows.len());
        for row in rows {
            stages.push(self.hydrate_stage(row).await?);
        }
        Ok(stages)
    }

    async fn hydrate_stage(&self, row: BeadStageRow) -> Result<BeadStage> {
        let history = sqlx::query_as::<_, StageHistoryRow>(
            "SELECT stage, status, started_at, completed_at, dispatch_id FROM bead_stage_history
             WHERE project = ?1 AND bead_id = ?2
             ORDER BY id ASC",
        )
        .bind(&row.project)
        .bind(&row.bead_id)
        .fetch_all(self.pool())
        .await
        .map_err(|e| store_error("Failed to load stage history", e))?
        .into_iter()
        .map(parse_stage_history)
        .collect::<Result<Vec<_>>>()?;

        parse_bead_stage(row, history)
    }
}
