#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![forbid(unsafe_code)]

//! Sliding-window quota over the authed usage ledger.
//!
//! Two windows are checked independently. The default mode checks, then
//! records after a successful launch; concurrent schedulers can overshoot a
//! cap by at most the number of checks in flight when it was reached. Strict
//! mode reserves with one conditional insert instead.

use crate::db::{millis_ago, SwarmDb, UsageCounts, WindowCap};
use crate::error::{Result, SwarmError};
use crate::types::{AgentId, BeadId, UsageEvent};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub window_secs: u64,
    /// Hard cap on authed dispatches per window. Zero disables the window.
    pub cap: u64,
    /// Share of `cap` actually usable, 1..=100.
    pub headroom_pct: u8,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            window_secs: 5 * 60 * 60,
            cap: 200,
            headroom_pct: 100,
        }
    }
}

impl WindowConfig {
    #[must_use]
    pub const fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    /// Usable cap after headroom, or `None` when the window is disabled.
    #[must_use]
    pub const fn effective_cap(&self) -> Option<u64> {
        if self.cap == 0 {
            None
        } else {
            Some(self.cap.saturating_mul(self.headroom_pct as u64) / 100)
        }
    }

    fn validate(&self, name: &str) -> Result<()> {
        if self.headroom_pct == 0 || self.headroom_pct > 100 {
            return Err(SwarmError::ConfigError(format!(
                "{name}.headroom_pct must be within 1..=100, got {}",
                self.headroom_pct
            )));
        }
        if self.effective_cap() == Some(0) {
            return Err(SwarmError::ConfigError(format!(
                "{name}: cap {} with headroom {}% allows no dispatches",
                self.cap, self.headroom_pct
            )));
        }
        if self.cap > 0 && self.window_secs == 0 {
            return Err(SwarmError::ConfigError(format!(
                "{name}.window_secs must be greater than zero"
            )));
        }
        Ok(())
    }

    fn cap_for_reservation(&self) -> WindowCap {
        WindowCap {
            since_ms: millis_ago(self.window()),
            cap: self.effective_cap(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub short_window: WindowConfig,
    pub long_window: WindowConfig,
    /// Make check and record one store statement.
    pub strict: bool,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            short_window: WindowConfig::default(),
            long_window: WindowConfig {
                window_secs: 7 * 24 * 60 * 60,
                cap: 2_000,
                headroom_pct: 80,
            },
            strict: false,
        }
    }
}

impl RateLimitConfig {
    /// # Errors
    /// Returns `ConfigError` for out-of-range headroom, headroom that leaves a
    /// cap of zero, or a capped zero-length window.
    pub fn validate(&self) -> Result<()> {
        self.short_window.validate("rate_limits.short_window")?;
        self.long_window.validate("rate_limits.long_window")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaDecision {
    pub allowed: bool,
    pub reason: String,
}

impl QuotaDecision {
    fn allowed() -> Self {
        Self {
            allowed: true,
            reason: String::new(),
        }
    }

    fn denied(reason: String) -> Self {
        Self {
            allowed: false,
            reason,
        }
    }
}

/// Usage counts next to their effective caps, for reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct UsageSnapshot {
    pub counts: UsageCounts,
    pub short_cap: Option<u64>,
    pub long_cap: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct RateLimiter {
    db: SwarmDb,
    config: RateLimitConfig,
}

impl RateLimiter {
    #[must_use]
    pub const fn new(db: SwarmDb, config: RateLimitConfig) -> Self {
        Self { db, config }
    }

    #[must_use]
    pub const fn is_strict(&self) -> bool {
        self.config.strict
    }

    /// # Errors
    /// Returns an error if the ledger cannot be counted.
    pub async fn can_dispatch_authed(&self) -> Result<QuotaDecision> {
        let counts = self.counts().await?;
        Ok(self.decide(counts))
    }

    /// Append an authed usage row for a launched dispatch.
    ///
    /// # Errors
    /// Returns an error if the ledger write fails.
    pub async fn record_authed_dispatch(
        &self,
        provider: &str,
        agent_id: &AgentId,
        bead_id: &BeadId,
    ) -> Result<()> {
        self.db
            .record_usage_event(&usage_event(provider, agent_id, bead_id), true)
            .await
    }

    /// Check and record in one statement. The row is kept even if the launch
    /// that follows fails.
    ///
    /// # Errors
    /// Returns an error if the ledger cannot be written or counted.
    pub async fn try_reserve_authed(
        &self,
        provider: &str,
        agent_id: &AgentId,
        bead_id: &BeadId,
    ) -> Result<QuotaDecision> {
        let reserved = self
            .db
            .record_authed_usage_within(
                &usage_event(provider, agent_id, bead_id),
                self.config.short_window.cap_for_reservation(),
                self.config.long_window.cap_for_reservation(),
            )
            .await?;
        if reserved {
            return Ok(QuotaDecision::allowed());
        }
        let decision = self.decide(self.counts().await?);
        if decision.allowed {
            // Another reservation filled the window between the two statements.
            return Ok(QuotaDecision::denied("authed quota reached".to_string()));
        }
        Ok(decision)
    }

    /// # Errors
    /// Returns an error if the ledger cannot be counted.
    pub async fn usage_snapshot(&self) -> Result<UsageSnapshot> {
        Ok(UsageSnapshot {
            counts: self.counts().await?,
            short_cap: self.config.short_window.effective_cap(),
            long_cap: self.config.long_window.effective_cap(),
        })
    }

    async fn counts(&self) -> Result<UsageCounts> {
        self.db
            .usage_counts(
                self.config.short_window.window(),
                self.config.long_window.window(),
            )
            .await
    }

    fn decide(&self, counts: UsageCounts) -> QuotaDecision {
        let checks = [
            ("short", &self.config.short_window, counts.short_window),
            ("long", &self.config.long_window, counts.long_window),
        ];
        for (name, window, used) in checks {
            if let Some(cap) = window.effective_cap() {
                if used >= cap {
                    let reason = format!(
                        "{name} window ({}s) at {used}/{cap} authed dispatches",
                        window.window_secs
                    );
                    debug!(window = name, used, cap, "Authed quota exhausted");
                    return QuotaDecision::denied(reason);
                }
            }
        }
        QuotaDecision::allowed()
    }
}

fn usage_event(provider: &str, agent_id: &AgentId, bead_id: &BeadId) -> UsageEvent {
    UsageEvent {
        provider: provider.to_string(),
        agent_id: agent_id.clone(),
        bead_id: bead_id.clone(),
        input_tokens: 0,
        output_tokens: 0,
        recorded_at: Utc::now(),
    }
}
