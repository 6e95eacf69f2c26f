#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![forbid(unsafe_code)]

//! Failure handling: classify, then retry at the next tier, requeue, give up,
//! or quarantine the bead.

use crate::db::SwarmDb;
use crate::error::{Result, SwarmError};
use crate::types::{Dispatch, DispatchId, DispatchStatus, FailureCategory, HealthEventKind, Tier};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_retries: u32,
    /// Consecutive failure-like attempts that quarantine a bead. Zero disables.
    pub failure_streak_threshold: u32,
    pub streak_lookback_secs: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            failure_streak_threshold: 4,
            streak_lookback_secs: 24 * 60 * 60,
        }
    }
}

impl RetryPolicy {
    /// A threshold within one retry chain would always quarantine before
    /// retries run out, so it must exceed `max_retries + 1`.
    ///
    /// # Errors
    /// Returns `ConfigError` when a non-zero threshold is too low.
    pub fn validate(&self) -> Result<()> {
        let chain = self.max_retries.saturating_add(1);
        if self.failure_streak_threshold > 0 && self.failure_streak_threshold <= chain {
            return Err(SwarmError::ConfigError(format!(
                "retry.failure_streak_threshold must be 0 or greater than {chain}, got {}",
                self.failure_streak_threshold
            )));
        }
        Ok(())
    }

    #[must_use]
    pub const fn streak_lookback(&self) -> Duration {
        Duration::from_secs(self.streak_lookback_secs)
    }

    /// Pure decision for a closed attempt.
    #[must_use]
    pub const fn decide(
        &self,
        status: DispatchStatus,
        retries: u32,
        tier: Tier,
        streak: u32,
    ) -> RetryDecision {
        if matches!(status, DispatchStatus::Cancelled) {
            return RetryDecision::Cancelled;
        }
        if self.failure_streak_threshold > 0 && streak >= self.failure_streak_threshold {
            return RetryDecision::Quarantine { streak };
        }
        if matches!(status, DispatchStatus::Interrupted) {
            return RetryDecision::Requeue;
        }
        if retries < self.max_retries {
            return RetryDecision::Retry {
                next_tier: tier.escalate(),
            };
        }
        RetryDecision::Exhausted
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum RetryDecision {
    /// Queued as `pending_retry` at `next_tier`.
    Retry { next_tier: Tier },
    /// Queued as `pending_retry` at the same tier; no retry consumed.
    Requeue,
    /// Streak reached the threshold; a health event asks for a human.
    Quarantine { streak: u32 },
    /// Out of retries; the bead stays open for triage.
    Exhausted,
    Cancelled,
    /// The attempt was already handled elsewhere.
    Skipped,
}

/// How an attempt ended, as reported by a completion callback or sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureReport {
    pub status: DispatchStatus,
    pub category: FailureCategory,
    pub summary: String,
    pub exit_code: Option<i32>,
}

impl FailureReport {
    #[must_use]
    pub fn failed(category: FailureCategory, summary: impl Into<String>, exit_code: Option<i32>) -> Self {
        Self {
            status: DispatchStatus::Failed,
            category,
            summary: summary.into(),
            exit_code,
        }
    }

    #[must_use]
    pub fn interrupted(category: FailureCategory, summary: impl Into<String>) -> Self {
        Self {
            status: DispatchStatus::Interrupted,
            category,
            summary: summary.into(),
            exit_code: None,
        }
    }

    #[must_use]
    pub fn cancelled(summary: impl Into<String>) -> Self {
        Self {
            status: DispatchStatus::Cancelled,
            category: FailureCategory::Cancelled,
            summary: summary.into(),
            exit_code: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryEngine {
    db: SwarmDb,
    policy: RetryPolicy,
}

impl RetryEngine {
    #[must_use]
    pub const fn new(db: SwarmDb, policy: RetryPolicy) -> Self {
        Self { db, policy }
    }

    /// Close an open attempt with `report`, release its lease, and apply the
    /// retry policy.
    ///
    /// # Errors
    /// Returns an error if the report is not a failure-like status, or a
    /// store write fails.
    pub async fn handle_failure(&self, dispatch: &Dispatch, report: &FailureReport) -> Result<RetryDecision> {
        if !matches!(
            report.status,
            DispatchStatus::Failed | DispatchStatus::Cancelled | DispatchStatus::Interrupted
        ) {
            return Err(SwarmError::StageError(format!(
                "{} is not a failure outcome",
                report.status
            )));
        }

        let closed = self
            .db
            .update_dispatch_failure(
                dispatch.id,
                report.status,
                report.category,
                &report.summary,
                report.exit_code,
            )
            .await?;
        if !closed {
            return Ok(RetryDecision::Skipped);
        }
        self.apply_policy(dispatch.id).await
    }

    /// Apply the policy to an attempt already closed as failed, interrupted or
    /// cancelled. Safe to call twice: a queued attempt is skipped.
    ///
    /// # Errors
    /// Returns an error if the dispatch is missing or a store write fails.
    pub async fn apply_policy(&self, id: DispatchId) -> Result<RetryDecision> {
        let dispatch = self
            .db
            .get_dispatch_by_id(id)
            .await?
            .ok_or_else(|| SwarmError::BeadError(format!("Dispatch {id} not found")))?;
        if !matches!(
            dispatch.status,
            DispatchStatus::Failed | DispatchStatus::Cancelled | DispatchStatus::Interrupted
        ) {
            return Ok(RetryDecision::Skipped);
        }

        self.db.mark_stage_attempt_failed(id).await?;
        self.db
            .release_claim_lease_for_dispatch(&dispatch.bead_id, id)
            .await?;

        let streak = self
            .db
            .count_consecutive_failures(&dispatch.bead_id, self.policy.streak_lookback())
            .await?;
        let decision = self
            .policy
            .decide(dispatch.status, dispatch.retries, dispatch.tier, streak);

        match decision {
            RetryDecision::Retry { next_tier } => {
                self.db.mark_dispatch_pending_retry(id, next_tier).await?;
                info!(
                    dispatch_id = id.value(),
                    bead_id = %dispatch.bead_id,
                    retries = dispatch.retries + 1,
                    tier = %next_tier,
                    "Queued retry"
                );
            }
            RetryDecision::Requeue => {
                self.db.requeue_dispatch(id).await?;
                info!(dispatch_id = id.value(), bead_id = %dispatch.bead_id, "Requeued interrupted dispatch");
            }
            RetryDecision::Quarantine { streak } => {
                let details = format!(
                    "{streak} consecutive failed attempts; last: {}",
                    dispatch.failure_summary.as_deref().unwrap_or("no summary")
                );
                self.db
                    .record_health_event(
                        HealthEventKind::Quarantine,
                        Some(&dispatch.project),
                        Some(&dispatch.bead_id),
                        Some(id),
                        &details,
                    )
                    .await?;
                warn!(
                    dispatch_id = id.value(),
                    bead_id = %dispatch.bead_id,
                    project = %dispatch.project,
                    streak,
                    "Bead quarantined"
                );
            }
            RetryDecision::Exhausted => {
                warn!(
                    dispatch_id = id.value(),
                    bead_id = %dispatch.bead_id,
                    retries = dispatch.retries,
                    "Retries exhausted"
                );
            }
            RetryDecision::Cancelled | RetryDecision::Skipped => {}
        }
        Ok(decision)
    }
}
