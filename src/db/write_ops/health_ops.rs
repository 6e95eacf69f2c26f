use super::helpers::sanitize_summary;
use crate::db::mappers::to_millis;
use crate::db::SwarmDb;
use crate::error::{store_error, Result};
use crate::types::{BeadId, DispatchId, HealthEventKind, ProjectId};
use chrono::Utc;

impl SwarmDb {
    /// # Errors
    /// Returns an error if the insert fails.
    pub async fn record_health_event(
        &self,
        kind: HealthEventKind,
        project: Option<&ProjectId>,
        bead_id: Option<&BeadId>,
        dispatch_id: Option<DispatchId>,
        details: &str,
    ) -> Result<i64> {
        sqlx::query_scalar::<_, i64>(
            "INSERT INTO health_events (kind, project, bead_id, dispatch_id, details, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             RETURNING id",
        )
        .bind(kind.as_str())
        .bind(project.map(ProjectId::value))
        .bind(bead_id.map(BeadId::value))
        .bind(dispatch_id.map(DispatchId::value))
        .bind(sanitize_summary(details))
        .bind(to_millis(Utc::now()))
        .fetch_one(self.pool())
        .await
        .map_err(|e| store_error("Failed to record health event", e))
    }
}
