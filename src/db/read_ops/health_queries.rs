use super::types::HealthEventRow;
use crate::db::mappers::parse_health_event;
use crate::db::SwarmDb;
use crate::error::{store_error, Result};
use crate::types::HealthEvent;

impl SwarmDb {
    /// Newest first.
    ///
    /// # Errors
    /// Returns an error if the query fails or a row cannot be decoded.
    pub async fn get_recent_health_events(&self, limit: u32) -> Result<Vec<HealthEvent>> {
        sqlx::query_as::<_, HealthEventRow>(
            "SELECT id, kind, project, bead_id, dispatch_id, details, created_at FROM health_events
             ORDER BY created_at DESC, id DESC
             LIMIT ?1",
        )
        .bind(i64::from(limit))
        .fetch_all(self.pool())
        .await
        .map_err(|e| store_error("Failed to load health events", e))?
        .into_iter()
        .map(parse_health_event)
        .collect()
    }
}
