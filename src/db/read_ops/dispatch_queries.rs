#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![forbid(unsafe_code)]

use super::types::{Allocation, AllocationRow, DispatchRow, StatusCountRow, DISPATCH_COLUMNS};
use crate::db::mappers::{millis_ago, parse_dispatch, to_u32_i64};
use crate::db::SwarmDb;
use crate::error::{store_error, Result};
use crate::types::{BeadId, Dispatch, DispatchId, DispatchStatus, ProjectId};
use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

const ACTIVE_STATUSES: &str = "('dispatched', 'running', 'pending_retry')";

fn parse_all(rows: Vec<DispatchRow>) -> Result<Vec<Dispatch>> {
    rows.into_iter().map(parse_dispatch).collect()
}

impl SwarmDb {
    /// # Errors
    /// Returns an error if the query fails or a row cannot be decoded.
    pub async fn get_dispatch_by_id(&self, id: DispatchId) -> Result<Option<Dispatch>> {
        sqlx::query_as::<_, DispatchRow>(&format!(
            "SELECT {DISPATCH_COLUMNS} FROM dispatches WHERE id = ?1"
        ))
        .bind(id.value())
        .fetch_optional(self.pool())
        .await
        .map_err(|e| store_error("Failed to load dispatch", e))?
        .map(parse_dispatch)
        .transpose()
    }

    /// Every attempt for a bead, newest first.
    ///
    /// # Errors
    /// Returns an error if the query fails or a row cannot be decoded.
    pub async fn get_dispatches_by_bead(&self, bead_id: &BeadId) -> Result<Vec<Dispatch>> {
        let rows = sqlx::query_as::<_, DispatchRow>(&format!(
            "SELECT {DISPATCH_COLUMNS} FROM dispatches WHERE bead_id = ?1
             ORDER BY dispatched_at DESC, id DESC"
        ))
        .bind(bead_id.value())
        .fetch_all(self.pool())
        .await
        .map_err(|e| store_error("Failed to load bead dispatches", e))?;
        parse_all(rows)
    }

    /// Dispatches with a live (or presumed live) worker.
    ///
    /// # Errors
    /// Returns an error if the query fails or a row cannot be decoded.
    pub async fn get_running_dispatches(&self) -> Result<Vec<Dispatch>> {
        let rows = sqlx::query_as::<_, DispatchRow>(&format!(
            "SELECT {DISPATCH_COLUMNS} FROM dispatches
             WHERE status IN ('dispatched', 'running')
             ORDER BY dispatched_at ASC, id ASC"
        ))
        .fetch_all(self.pool())
        .await
        .map_err(|e| store_error("Failed to load running dispatches", e))?;
        parse_all(rows)
    }

    /// Running dispatches older than `timeout`.
    ///
    /// # Errors
    /// Returns an error if the query fails or a row cannot be decoded.
    pub async fn get_stuck_dispatches(&self, timeout: Duration) -> Result<Vec<Dispatch>> {
        let rows = sqlx::query_as::<_, DispatchRow>(&format!(
            "SELECT {DISPATCH_COLUMNS} FROM dispatches
             WHERE status IN ('dispatched', 'running') AND dispatched_at < ?1
             ORDER BY dispatched_at ASC, id ASC"
        ))
        .bind(millis_ago(timeout))
        .fetch_all(self.pool())
        .await
        .map_err(|e| store_error("Failed to load stuck dispatches", e))?;
        parse_all(rows)
    }

    /// Pending retries, oldest first.
    ///
    /// # Errors
    /// Returns an error if the query fails or a row cannot be decoded.
    pub async fn get_pending_retry_dispatches(&self) -> Result<Vec<Dispatch>> {
        let rows = sqlx::query_as::<_, DispatchRow>(&format!(
            "SELECT {DISPATCH_COLUMNS} FROM dispatches
             WHERE status = 'pending_retry'
             ORDER BY completed_at ASC, id ASC"
        ))
        .fetch_all(self.pool())
        .await
        .map_err(|e| store_error("Failed to load pending retries", e))?;
        parse_all(rows)
    }

    /// Active dispatch counts keyed by their `stage` column.
    ///
    /// # Errors
    /// Returns an error if the query fails.
    pub async fn get_running_dispatch_stage_counts(&self) -> Result<BTreeMap<String, u32>> {
        let rows = sqlx::query_as::<_, StatusCountRow>(&format!(
            "SELECT stage AS key, COUNT(*) AS count FROM dispatches
             WHERE status IN {ACTIVE_STATUSES}
             GROUP BY stage"
        ))
        .fetch_all(self.pool())
        .await
        .map_err(|e| store_error("Failed to count dispatch stages", e))?;
        Ok(rows
            .into_iter()
            .map(|row| (row.key, to_u32_i64(row.count)))
            .collect())
    }

    /// Whether any attempt for `bead_id` started within `window`. A zero
    /// window never matches.
    ///
    /// # Errors
    /// Returns an error if the query fails.
    pub async fn was_bead_dispatched_recently(&self, bead_id: &BeadId, window: Duration) -> Result<bool> {
        if window.is_zero() {
            return Ok(false);
        }
        sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM dispatches WHERE bead_id = ?1 AND dispatched_at >= ?2",
        )
        .bind(bead_id.value())
        .bind(millis_ago(window))
        .fetch_one(self.pool())
        .await
        .map(|count| count > 0)
        .map_err(|e| store_error("Failed to check recent dispatch", e))
    }

    /// Length of the failure streak ending at the newest attempt within
    /// `lookback`. Any completed or active attempt ends the streak.
    ///
    /// # Errors
    /// Returns an error if the query fails.
    pub async fn count_consecutive_failures(&self, bead_id: &BeadId, lookback: Duration) -> Result<u32> {
        let statuses = sqlx::query_scalar::<_, String>(
            "SELECT status FROM dispatches WHERE bead_id = ?1 AND dispatched_at >= ?2
             ORDER BY dispatched_at DESC, id DESC",
        )
        .bind(bead_id.value())
        .bind(millis_ago(lookback))
        .fetch_all(self.pool())
        .await
        .map_err(|e| store_error("Failed to load failure streak", e))?;

        let streak = statuses
            .iter()
            .map(|status| DispatchStatus::try_from(status.as_str()))
            .take_while(|status| status.as_ref().is_ok_and(DispatchStatus::is_failure_like))
            .count();
        Ok(u32::try_from(streak).unwrap_or(u32::MAX))
    }

    /// # Errors
    /// Returns an error if the query fails.
    pub async fn count_active_dispatches(&self, project: &ProjectId) -> Result<u32> {
        sqlx::query_scalar::<_, i64>(&format!(
            "SELECT COUNT(*) FROM dispatches WHERE project = ?1 AND status IN {ACTIVE_STATUSES}"
        ))
        .bind(project.value())
        .fetch_one(self.pool())
        .await
        .map(to_u32_i64)
        .map_err(|e| store_error("Failed to count active dispatches", e))
    }

    /// # Errors
    /// Returns an error if the query fails.
    pub async fn has_active_dispatch(&self, bead_id: &BeadId) -> Result<bool> {
        sqlx::query_scalar::<_, i64>(&format!(
            "SELECT COUNT(*) FROM dispatches WHERE bead_id = ?1 AND status IN {ACTIVE_STATUSES}"
        ))
        .bind(bead_id.value())
        .fetch_one(self.pool())
        .await
        .map(|count| count > 0)
        .map_err(|e| store_error("Failed to check active dispatch", e))
    }

    /// Bead ids with an active dispatch anywhere in the fleet.
    ///
    /// # Errors
    /// Returns an error if the query fails.
    pub async fn get_active_dispatch_bead_ids(&self) -> Result<HashSet<String>> {
        sqlx::query_scalar::<_, String>(&format!(
            "SELECT DISTINCT bead_id FROM dispatches WHERE status IN {ACTIVE_STATUSES}"
        ))
        .fetch_all(self.pool())
        .await
        .map(|ids| ids.into_iter().collect())
        .map_err(|e| store_error("Failed to load active bead ids", e))
    }

    /// # Errors
    /// Returns an error if the query fails.
    pub async fn get_current_allocation(&self) -> Result<Allocation> {
        let rows = sqlx::query_as::<_, AllocationRow>(&format!(
            "SELECT project, tier, COUNT(*) AS count FROM dispatches
             WHERE status IN {ACTIVE_STATUSES}
             GROUP BY project, tier"
        ))
        .fetch_all(self.pool())
        .await
        .map_err(|e| store_error("Failed to load allocation", e))?;

        Ok(rows.into_iter().fold(Allocation::default(), |mut acc, row| {
            let count = to_u32_i64(row.count);
            acc.total_active = acc.total_active.saturating_add(count);
            *acc.by_project.entry(row.project).or_default() += count;
            *acc.by_tier.entry(row.tier).or_default() += count;
            acc
        }))
    }
}
