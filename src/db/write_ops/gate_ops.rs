use crate::db::mappers::to_millis;
use crate::db::SwarmDb;
use crate::error::{store_error, Result, SwarmError};
use chrono::Utc;
use tracing::info;

impl SwarmDb {
    /// Open the execution plan gate for `plan_id`, replacing any active plan.
    ///
    /// # Errors
    /// Returns an error if `plan_id` is blank or the write fails.
    pub async fn activate_plan(&self, plan_id: &str, approved_by: &str) -> Result<()> {
        let plan_id = plan_id.trim();
        if plan_id.is_empty() {
            return Err(SwarmError::ConfigError(
                "Plan id must not be empty".to_string(),
            ));
        }
        let now = to_millis(Utc::now());
        sqlx::query(
            "INSERT INTO execution_plan_gate (id, plan_id, approved_by, approved_at, activated_at)
             VALUES (1, ?1, ?2, ?3, ?3)
             ON CONFLICT (id) DO UPDATE SET
                plan_id = excluded.plan_id,
                approved_by = excluded.approved_by,
                approved_at = excluded.approved_at,
                activated_at = excluded.activated_at",
        )
        .bind(plan_id)
        .bind(approved_by)
        .bind(now)
        .execute(self.pool())
        .await
        .map_err(|e| store_error("Failed to activate plan", e))?;
        info!(plan_id, approved_by, "Activated execution plan");
        Ok(())
    }

    /// Close the gate. Returns `false` when no plan was active.
    ///
    /// # Errors
    /// Returns an error if the delete fails.
    pub async fn clear_plan(&self) -> Result<bool> {
        let cleared = sqlx::query("DELETE FROM execution_plan_gate WHERE id = 1")
            .execute(self.pool())
            .await
            .map(|result| result.rows_affected() > 0)
            .map_err(|e| store_error("Failed to clear plan", e))?;
        if cleared {
            info!("Cleared execution plan");
        }
        Ok(cleared)
    }
}
