#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![forbid(unsafe_code)]

use crate::db::mappers::{parse_lease, to_millis};
use crate::db::read_ops::LeaseRow;
use crate::db::SwarmDb;
use crate::error::{store_error, Result, SwarmError};
use crate::types::{BeadId, ClaimLease, DispatchId, ProjectId};
use chrono::{DateTime, Utc};

impl SwarmDb {
    /// Claim `bead_id` for `holder`. Exactly one of any number of concurrent
    /// callers wins; the rest get [`SwarmError::AlreadyClaimed`].
    ///
    /// # Errors
    /// Returns `AlreadyClaimed` when a lease exists, or a store error.
    pub async fn acquire_claim_lease(
        &self,
        bead_id: &BeadId,
        project: &ProjectId,
        workspace: &str,
        holder: &str,
    ) -> Result<ClaimLease> {
        let now = to_millis(Utc::now());
        let inserted = sqlx::query_as::<_, LeaseRow>(
            "INSERT INTO claim_leases (bead_id, project, workspace, holder, claimed_at, heartbeat_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)
             ON CONFLICT (bead_id) DO NOTHING
             RETURNING bead_id, project, workspace, holder, dispatch_id, claimed_at, heartbeat_at",
        )
        .bind(bead_id.value())
        .bind(project.value())
        .bind(workspace)
        .bind(holder)
        .bind(now)
        .fetch_optional(self.pool())
        .await
        .map_err(|e| store_error("Failed to acquire claim lease", e))?;

        if let Some(row) = inserted {
            return parse_lease(row);
        }

        let holder = sqlx::query_scalar::<_, String>("SELECT holder FROM claim_leases WHERE bead_id = ?1")
            .bind(bead_id.value())
            .fetch_optional(self.pool())
            .await
            .map_err(|e| store_error("Failed to read claim holder", e))?
            .unwrap_or_else(|| "unknown".to_string());
        Err(SwarmError::AlreadyClaimed {
            bead_id: bead_id.value().to_string(),
            holder,
        })
    }

    /// Refresh the lease heartbeat. Returns `false` when no lease exists.
    ///
    /// # Errors
    /// Returns an error if the update fails.
    pub async fn heartbeat_claim_lease(&self, bead_id: &BeadId) -> Result<bool> {
        sqlx::query("UPDATE claim_leases SET heartbeat_at = ?1 WHERE bead_id = ?2")
            .bind(to_millis(Utc::now()))
            .bind(bead_id.value())
            .execute(self.pool())
            .await
            .map(|result| result.rows_affected() > 0)
            .map_err(|e| store_error("Failed to heartbeat claim lease", e))
    }

    /// # Errors
    /// Returns an error if the delete fails.
    pub async fn release_claim_lease(&self, bead_id: &BeadId) -> Result<bool> {
        sqlx::query("DELETE FROM claim_leases WHERE bead_id = ?1")
            .bind(bead_id.value())
            .execute(self.pool())
            .await
            .map(|result| result.rows_affected() > 0)
            .map_err(|e| store_error("Failed to release claim lease", e))
    }

    /// Release the lease only while it still belongs to `dispatch_id` (or to
    /// no dispatch yet), so a finished attempt never frees its successor's
    /// claim.
    ///
    /// # Errors
    /// Returns an error if the delete fails.
    pub async fn release_claim_lease_for_dispatch(
        &self,
        bead_id: &BeadId,
        dispatch_id: DispatchId,
    ) -> Result<bool> {
        sqlx::query(
            "DELETE FROM claim_leases
             WHERE bead_id = ?1 AND (dispatch_id IS NULL OR dispatch_id = ?2)",
        )
        .bind(bead_id.value())
        .bind(dispatch_id.value())
        .execute(self.pool())
        .await
        .map(|result| result.rows_affected() > 0)
        .map_err(|e| store_error("Failed to release claim lease", e))
    }

    /// Delete an expired lease, but only if its heartbeat has not moved since
    /// `observed_heartbeat` was read.
    ///
    /// # Errors
    /// Returns an error if the delete fails.
    pub async fn reclaim_claim_lease(
        &self,
        bead_id: &BeadId,
        observed_heartbeat: DateTime<Utc>,
    ) -> Result<bool> {
        sqlx::query("DELETE FROM claim_leases WHERE bead_id = ?1 AND heartbeat_at = ?2")
            .bind(bead_id.value())
            .bind(to_millis(observed_heartbeat))
            .execute(self.pool())
            .await
            .map(|result| result.rows_affected() > 0)
            .map_err(|e| store_error("Failed to reclaim claim lease", e))
    }
}
