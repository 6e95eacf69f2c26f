use super::types::GateRow;
use crate::db::mappers::parse_gate;
use crate::db::SwarmDb;
use crate::error::{store_error, Result};
use crate::types::ExecutionPlanGate;

impl SwarmDb {
    /// # Errors
    /// Returns an error if the query fails or the row cannot be decoded.
    pub async fn get_plan_gate(&self) -> Result<Option<ExecutionPlanGate>> {
        sqlx::query_as::<_, GateRow>(
            "SELECT plan_id, approved_by, approved_at, activated_at FROM execution_plan_gate WHERE id = 1",
        )
        .fetch_optional(self.pool())
        .await
        .map_err(|e| store_error("Failed to load plan gate", e))?
        .map(parse_gate)
        .transpose()
    }

    /// Open means a plan with a non-empty id is active.
    ///
    /// # Errors
    /// Returns an error if the gate cannot be read.
    pub async fn is_plan_gate_open(&self) -> Result<bool> {
        self.get_plan_gate()
            .await
            .map(|gate| gate.is_some_and(|gate| gate.is_open()))
    }
}
