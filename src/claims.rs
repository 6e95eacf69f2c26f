//! Exclusive per-bead ownership. The lease table's unique key on bead id is
//! the only mutual exclusion between concurrent ticks and sweeps.

use crate::db::SwarmDb;
use crate::error::Result;
use crate::types::{BeadId, ClaimLease, DispatchId, ProjectId};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct ClaimLeaseManager {
    db: SwarmDb,
    holder: String,
}

impl ClaimLeaseManager {
    #[must_use]
    pub fn new(db: SwarmDb, holder: impl Into<String>) -> Self {
        Self {
            db,
            holder: holder.into(),
        }
    }

    #[must_use]
    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// # Errors
    /// Returns [`crate::SwarmError::AlreadyClaimed`] when another holder owns
    /// the bead, or a store error.
    pub async fn acquire(&self, bead_id: &BeadId, project: &ProjectId, workspace: &str) -> Result<ClaimLease> {
        let lease = self
            .db
            .acquire_claim_lease(bead_id, project, workspace, &self.holder)
            .await?;
        debug!(bead_id = %bead_id, project = %project, holder = %self.holder, "Claimed bead");
        Ok(lease)
    }

    /// # Errors
    /// Returns an error if the store write fails.
    pub async fn heartbeat(&self, bead_id: &BeadId) -> Result<bool> {
        self.db.heartbeat_claim_lease(bead_id).await
    }

    /// # Errors
    /// Returns an error if the store write fails.
    pub async fn release(&self, bead_id: &BeadId) -> Result<bool> {
        self.db.release_claim_lease(bead_id).await
    }

    /// Release only while the lease still belongs to `dispatch_id`.
    ///
    /// # Errors
    /// Returns an error if the store write fails.
    pub async fn release_for(&self, bead_id: &BeadId, dispatch_id: DispatchId) -> Result<bool> {
        self.db
            .release_claim_lease_for_dispatch(bead_id, dispatch_id)
            .await
    }

    /// # Errors
    /// Returns an error if the store read fails.
    pub async fn expired(&self, threshold: Duration) -> Result<Vec<ClaimLease>> {
        self.db.get_expired_claim_leases(threshold).await
    }
}
