#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![forbid(unsafe_code)]

//! Periodic sweep correlating stored dispatch state with worker liveness.
//!
//! Only a confirmed `Missing` session, or an expired lease with no live
//! worker behind it, leads to corrective action. `Unknown` probes are logged
//! and left for the next sweep.

use crate::db::SwarmDb;
use crate::error::Result;
use crate::liveness::{Liveness, LivenessChecker};
use crate::ports::{DispatchHandle, Dispatcher};
use crate::retry::{FailureReport, RetryDecision, RetryEngine, RetryPolicy};
use crate::types::{ClaimLease, Dispatch, DispatchStatus, FailureCategory, HealthEventKind};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Running dispatches older than this are probed.
    pub stuck_timeout_secs: u64,
    pub probe_timeout_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            stuck_timeout_secs: 2700,
            probe_timeout_secs: 10,
            sweep_interval_secs: 120,
        }
    }
}

impl HealthConfig {
    #[must_use]
    pub const fn stuck_timeout(&self) -> Duration {
        Duration::from_secs(self.stuck_timeout_secs)
    }

    #[must_use]
    pub const fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    #[must_use]
    pub const fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

/// Counts from one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub probed: u32,
    pub live: u32,
    pub unknown: u32,
    pub killed: u32,
    pub leases_reclaimed: u32,
    pub interrupted: u32,
    pub errors: u32,
}

impl HealthReport {
    /// Corrective actions taken.
    #[must_use]
    pub const fn actions(&self) -> u32 {
        self.killed + self.leases_reclaimed
    }

    #[must_use]
    pub const fn merge(self, other: Self) -> Self {
        Self {
            probed: self.probed + other.probed,
            live: self.live + other.live,
            unknown: self.unknown + other.unknown,
            killed: self.killed + other.killed,
            leases_reclaimed: self.leases_reclaimed + other.leases_reclaimed,
            interrupted: self.interrupted + other.interrupted,
            errors: self.errors + other.errors,
        }
    }
}

#[derive(Clone)]
pub struct HealthMonitor {
    db: SwarmDb,
    dispatcher: Arc<dyn Dispatcher>,
    liveness: Arc<dyn LivenessChecker>,
    retry: RetryEngine,
}

impl HealthMonitor {
    #[must_use]
    pub fn new(
        db: SwarmDb,
        dispatcher: Arc<dyn Dispatcher>,
        liveness: Arc<dyn LivenessChecker>,
        policy: RetryPolicy,
    ) -> Self {
        let retry = RetryEngine::new(db.clone(), policy);
        Self {
            db,
            dispatcher,
            liveness,
            retry,
        }
    }

    /// Stuck check followed by lease reclamation.
    ///
    /// # Errors
    /// Returns an error only if a sweep query fails; per-dispatch failures
    /// are counted in the report.
    pub async fn sweep(&self, stuck_timeout: Duration, lease_expiry: Duration) -> Result<HealthReport> {
        let stuck = self.check_stuck_dispatches(stuck_timeout).await?;
        let leases = self.reclaim_expired_leases(lease_expiry).await?;
        Ok(stuck.merge(leases))
    }

    /// Probe every running dispatch older than `timeout`.
    ///
    /// # Errors
    /// Returns an error if the stuck dispatches cannot be loaded.
    pub async fn check_stuck_dispatches(&self, timeout: Duration) -> Result<HealthReport> {
        let mut report = HealthReport::default();
        for dispatch in self.db.get_stuck_dispatches(timeout).await? {
            let Some(handle) = dispatch.handle.map(DispatchHandle::new) else {
                debug!(dispatch_id = dispatch.id.value(), "Stuck dispatch has no handle");
                report.unknown += 1;
                continue;
            };
            report.probed += 1;
            let liveness = self
                .liveness
                .probe(handle)
                .await
                .unwrap_or(Liveness::Unknown);
            match liveness {
                Liveness::Live => report.live += 1,
                Liveness::Unknown => {
                    report.unknown += 1;
                    warn!(
                        dispatch_id = dispatch.id.value(),
                        bead_id = %dispatch.bead_id,
                        "Liveness unknown; deferring to next sweep"
                    );
                }
                Liveness::Missing => match self.fail_missing(&dispatch, handle, timeout).await {
                    Ok(()) => report.killed += 1,
                    Err(err) => {
                        report.errors += 1;
                        warn!(dispatch_id = dispatch.id.value(), error = %err, "Failed to close missing dispatch");
                    }
                },
            }
        }
        Ok(report)
    }

    async fn fail_missing(&self, dispatch: &Dispatch, handle: DispatchHandle, timeout: Duration) -> Result<()> {
        if let Err(err) = self.dispatcher.kill(handle).await {
            debug!(dispatch_id = dispatch.id.value(), error = %err, "Kill of missing session failed");
        }
        let summary = format!(
            "session {} missing after {}s",
            self.dispatcher.session_name(handle),
            timeout.as_secs()
        );
        self.db
            .record_health_event(
                HealthEventKind::StuckDispatchKilled,
                Some(&dispatch.project),
                Some(&dispatch.bead_id),
                Some(dispatch.id),
                &summary,
            )
            .await?;
        let decision = self
            .retry
            .handle_failure(
                dispatch,
                &FailureReport::failed(FailureCategory::SessionMissing, summary, None),
            )
            .await?;
        info!(
            dispatch_id = dispatch.id.value(),
            bead_id = %dispatch.bead_id,
            decision = ?decision,
            "Closed dispatch with missing session"
        );
        Ok(())
    }

    /// Act on leases whose heartbeat is older than `threshold`. A lease whose
    /// active dispatch still has a worker is probed first: `Live` refreshes
    /// the heartbeat, `Unknown` keeps the lease and the dispatch as they are,
    /// and `Missing` kills the session before the dispatch is interrupted and
    /// requeued. Leases with no active dispatch are deleted.
    ///
    /// # Errors
    /// Returns an error if the expired leases cannot be loaded.
    pub async fn reclaim_expired_leases(&self, threshold: Duration) -> Result<HealthReport> {
        let mut report = HealthReport::default();
        for lease in self.db.get_expired_claim_leases(threshold).await? {
            match self.reclaim(&lease).await {
                Ok(LeaseOutcome::Raced) => {}
                Ok(LeaseOutcome::Refreshed) => {
                    report.probed += 1;
                    report.live += 1;
                }
                Ok(LeaseOutcome::Kept) => {
                    report.probed += 1;
                    report.unknown += 1;
                }
                Ok(LeaseOutcome::Reclaimed { killed, interrupted }) => {
                    report.leases_reclaimed += 1;
                    if killed {
                        report.probed += 1;
                        report.killed += 1;
                    }
                    if interrupted {
                        report.interrupted += 1;
                    }
                }
                Err(err) => {
                    report.errors += 1;
                    warn!(bead_id = %lease.bead_id, error = %err, "Failed to reclaim lease");
                }
            }
        }
        Ok(report)
    }

    async fn reclaim(&self, lease: &ClaimLease) -> Result<LeaseOutcome> {
        let owner = match lease.dispatch_id {
            Some(id) => self
                .db
                .get_dispatch_by_id(id)
                .await?
                .filter(|d| matches!(d.status, DispatchStatus::Dispatched | DispatchStatus::Running)),
            None => None,
        };
        let handle = owner
            .as_ref()
            .and_then(|dispatch| dispatch.handle)
            .map(DispatchHandle::new);

        let mut killed = false;
        if let (Some(dispatch), Some(handle)) = (&owner, handle) {
            match self.liveness.probe(handle).await.unwrap_or(Liveness::Unknown) {
                Liveness::Live => {
                    self.db.heartbeat_claim_lease(&lease.bead_id).await?;
                    debug!(bead_id = %lease.bead_id, "Expired lease belongs to a live worker; refreshed");
                    return Ok(LeaseOutcome::Refreshed);
                }
                Liveness::Unknown => {
                    self.db
                        .record_health_event(
                            HealthEventKind::LeaseUnverified,
                            Some(&lease.project),
                            Some(&lease.bead_id),
                            Some(dispatch.id),
                            &format!(
                                "lease held by {} expired; session {} could not be probed",
                                lease.holder,
                                self.dispatcher.session_name(handle)
                            ),
                        )
                        .await?;
                    warn!(
                        bead_id = %lease.bead_id,
                        dispatch_id = dispatch.id.value(),
                        "Lease expired but liveness unknown; keeping it"
                    );
                    return Ok(LeaseOutcome::Kept);
                }
                Liveness::Missing => {
                    if let Err(err) = self.dispatcher.kill(handle).await {
                        debug!(dispatch_id = dispatch.id.value(), error = %err, "Kill of missing session failed");
                    }
                    killed = true;
                }
            }
        }

        if !self
            .db
            .reclaim_claim_lease(&lease.bead_id, lease.heartbeat_at)
            .await?
        {
            return Ok(LeaseOutcome::Raced);
        }
        self.db
            .record_health_event(
                HealthEventKind::LeaseReclaimed,
                Some(&lease.project),
                Some(&lease.bead_id),
                lease.dispatch_id,
                &format!("lease held by {} stopped heartbeating", lease.holder),
            )
            .await?;
        info!(bead_id = %lease.bead_id, holder = %lease.holder, killed, "Reclaimed expired lease");

        let Some(dispatch) = owner else {
            return Ok(LeaseOutcome::Reclaimed {
                killed,
                interrupted: false,
            });
        };
        let decision = self
            .retry
            .handle_failure(
                &dispatch,
                &FailureReport::interrupted(FailureCategory::LeaseExpired, "claim lease expired"),
            )
            .await?;
        Ok(LeaseOutcome::Reclaimed {
            killed,
            interrupted: !matches!(decision, RetryDecision::Skipped),
        })
    }
}

enum LeaseOutcome {
    /// The lease was refreshed or released concurrently.
    Raced,
    Refreshed,
    /// Liveness unknown; lease and dispatch left in place.
    Kept,
    Reclaimed { killed: bool, interrupted: bool },
}
