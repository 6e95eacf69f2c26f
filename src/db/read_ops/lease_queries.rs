use super::types::LeaseRow;
use crate::db::mappers::{millis_ago, parse_lease};
use crate::db::SwarmDb;
use crate::error::{store_error, Result};
use crate::types::{BeadId, ClaimLease};
use std::time::Duration;

const LEASE_COLUMNS: &str = "bead_id, project, workspace, holder, dispatch_id, claimed_at, heartbeat_at";

impl SwarmDb {
    /// # Errors
    /// Returns an error if the query fails or a row cannot be decoded.
    pub async fn get_claim_lease(&self, bead_id: &BeadId) -> Result<Option<ClaimLease>> {
        sqlx::query_as::<_, LeaseRow>(&format!(
            "SELECT {LEASE_COLUMNS} FROM claim_leases WHERE bead_id = ?1"
        ))
        .bind(bead_id.value())
        .fetch_optional(self.pool())
        .await
        .map_err(|e| store_error("Failed to load claim lease", e))?
        .map(parse_lease)
        .transpose()
    }

    /// # Errors
    /// Returns an error if the query fails or a row cannot be decoded.
    pub async fn list_claim_leases(&self) -> Result<Vec<ClaimLease>> {
        sqlx::query_as::<_, LeaseRow>(&format!(
            "SELECT {LEASE_COLUMNS} FROM claim_leases ORDER BY claimed_at ASC"
        ))
        .fetch_all(self.pool())
        .await
        .map_err(|e| store_error("Failed to list claim leases", e))?
        .into_iter()
        .map(parse_lease)
        .collect()
    }

    /// Leases whose heartbeat is older than `threshold`.
    ///
    /// # Errors
    /// Returns an error if the query fails or a row cannot be decoded.
    pub async fn get_expired_claim_leases(&self, threshold: Duration) -> Result<Vec<ClaimLease>> {
        sqlx::query_as::<_, LeaseRow>(&format!(
            "SELECT {LEASE_COLUMNS} FROM claim_leases WHERE heartbeat_at < ?1 ORDER BY heartbeat_at ASC"
        ))
        .bind(millis_ago(threshold))
        .fetch_all(self.pool())
        .await
        .map_err(|e| store_error("Failed to load expired leases", e))?
        .into_iter()
        .map(parse_lease)
        .collect()
    }
}
