//! Clock helpers for store tests: shift stored timestamps into the past.

use crate::db::SwarmDb;
use crate::types::{BeadId, DispatchId};
use std::time::Duration;

fn millis(by: Duration) -> i64 {
    i64::try_from(by.as_millis()).unwrap_or(i64::MAX)
}

impl SwarmDb {
    pub(crate) async fn backdate_dispatch(&self, id: DispatchId, by: Duration) {
        sqlx::query(
            "UPDATE dispatches SET dispatched_at = dispatched_at - ?1,
                completed_at = CASE WHEN completed_at IS NULL THEN NULL ELSE completed_at - ?1 END
             WHERE id = ?2",
        )
        .bind(millis(by))
        .bind(id.value())
        .execute(self.pool())
        .await
        .unwrap_or_else(|e| panic!("backdate dispatch failed: {e}"));
    }

    pub(crate) async fn backdate_lease(&self, bead_id: &BeadId, by: Duration) {
        sqlx::query(
            "UPDATE claim_leases SET claimed_at = claimed_at - ?1, heartbeat_at = heartbeat_at - ?1
             WHERE bead_id = ?2",
        )
        .bind(millis(by))
        .bind(bead_id.value())
        .execute(self.pool())
        .await
        .unwrap_or_else(|e| panic!("backdate lease failed: {e}"));
    }

    pub(crate) async fn backdate_usage(&self, by: Duration) {
        sqlx::query("UPDATE provider_usage SET recorded_at = recorded_at - ?1")
            .bind(millis(by))
            .execute(self.pool())
            .await
            .unwrap_or_else(|e| panic!("backdate usage failed: {e}"));
    }
}
