#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![forbid(unsafe_code)]

use super::types::WindowCap;
use crate::db::mappers::to_millis;
use crate::db::SwarmDb;
use crate::error::{store_error, Result};
use crate::types::UsageEvent;

fn cap_value(cap: Option<u64>) -> i64 {
    cap.map_or(i64::MAX, |value| i64::try_from(value).unwrap_or(i64::MAX))
}

impl SwarmDb {
    /// Append one usage row.
    ///
    /// # Errors
    /// Returns an error if the insert fails.
    pub async fn record_usage_event(&self, event: &UsageEvent, authed: bool) -> Result<()> {
        sqlx::query(
            "INSERT INTO provider_usage (provider, agent_id, bead_id, authed, input_tokens, output_tokens, recorded_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )
        .bind(&event.provider)
        .bind(event.agent_id.value())
        .bind(event.bead_id.value())
        .bind(authed)
        .bind(event.input_tokens)
        .bind(event.output_tokens)
        .bind(to_millis(event.recorded_at))
        .execute(self.pool())
        .await
        .map(|_| ())
        .map_err(|e| store_error("Failed to record usage", e))
    }

    /// Append an authed usage row only if both windows are below their caps,
    /// checked and written in one statement. Returns whether the row landed.
    ///
    /// # Errors
    /// Returns an error if the statement fails.
    pub async fn record_authed_usage_within(
        &self,
        event: &UsageEvent,
        short: WindowCap,
        long: WindowCap,
    ) -> Result<bool> {
        sqlx::query(
            "INSERT INTO provider_usage (provider, agent_id, bead_id, authed, input_tokens, output_tokens, recorded_at)
             SELECT ?1, ?2, ?3, 1, ?4, ?5, ?6
             WHERE (SELECT COUNT(*) FROM provider_usage WHERE authed = 1 AND recorded_at >= ?7) < ?8
               AND (SELECT COUNT(*) FROM provider_usage WHERE authed = 1 AND recorded_at >= ?9) < ?10",
        )
        .bind(&event.provider)
        .bind(event.agent_id.value())
        .bind(event.bead_id.value())
        .bind(event.input_tokens)
        .bind(event.output_tokens)
        .bind(to_millis(event.recorded_at))
        .bind(short.since_ms)
        .bind(cap_value(short.cap))
        .bind(long.since_ms)
        .bind(cap_value(long.cap))
        .execute(self.pool())
        .await
        .map(|result| result.rows_affected() > 0)
        .map_err(|e| store_error("Failed to reserve usage", e))
    }
}
