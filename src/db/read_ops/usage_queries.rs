use super::types::UsageCounts;
use crate::db::mappers::millis_ago;
use crate::db::SwarmDb;
use crate::error::{store_error, Result};
use std::time::Duration;

impl SwarmDb {
    /// Authed usage rows recorded within `window` of now.
    ///
    /// # Errors
    /// Returns an error if the query fails.
    pub async fn count_authed_usage_within(&self, window: Duration) -> Result<u64> {
        sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM provider_usage WHERE authed = 1 AND recorded_at >= ?1",
        )
        .bind(millis_ago(window))
        .fetch_one(self.pool())
        .await
        .map(|count| u64::try_from(count).unwrap_or(0))
        .map_err(|e| store_error("Failed to count usage", e))
    }

    /// # Errors
    /// Returns an error if either count fails.
    pub async fn usage_counts(&self, short_window: Duration, long_window: Duration) -> Result<UsageCounts> {
        Ok(UsageCounts {
            short_window: self.count_authed_usage_within(short_window).await?,
            long_window: self.count_authed_usage_within(long_window).await?,
        })
    }
}
