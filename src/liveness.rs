//! Worker liveness as a tri-state.
//!
//! `Unknown` covers a probe that timed out or errored. Callers must never
//! treat it as dead; only `Missing` allows corrective action.

use crate::ports::{DispatchHandle, Dispatcher, PortFuture};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Liveness {
    Live,
    Missing,
    Unknown,
}

pub trait LivenessChecker: Send + Sync {
    fn probe(&self, handle: DispatchHandle) -> PortFuture<'_, Liveness>;
}

/// Probes through [`Dispatcher::is_alive`]; a probe error reads as `Unknown`.
#[derive(Clone)]
pub struct DispatcherLiveness {
    dispatcher: Arc<dyn Dispatcher>,
}

impl DispatcherLiveness {
    #[must_use]
    pub fn new(dispatcher: Arc<dyn Dispatcher>) -> Self {
        Self { dispatcher }
    }
}

impl LivenessChecker for DispatcherLiveness {
    fn probe(&self, handle: DispatchHandle) -> PortFuture<'_, Liveness> {
        Box::pin(async move {
            Ok(match self.dispatcher.is_alive(handle).await {
                Ok(true) => Liveness::Live,
                Ok(false) => Liveness::Missing,
                Err(err) => {
                    debug!(handle = handle.value(), error = %err, "Liveness probe failed");
                    Liveness::Unknown
                }
            })
        })
    }
}

/// Bounds any checker: a probe that errors or outlives `timeout` is `Unknown`.
pub struct TimeoutLivenessChecker<C> {
    inner: C,
    timeout: Duration,
}

impl<C> TimeoutLivenessChecker<C> {
    #[must_use]
    pub const fn new(inner: C, timeout: Duration) -> Self {
        Self { inner, timeout }
    }
}

impl<C: LivenessChecker> LivenessChecker for TimeoutLivenessChecker<C> {
    fn probe(&self, handle: DispatchHandle) -> PortFuture<'_, Liveness> {
        Box::pin(async move {
            match tokio::time::timeout(self.timeout, self.inner.probe(handle)).await {
                Ok(Ok(liveness)) => Ok(liveness),
                Ok(Err(err)) => {
                    debug!(handle = handle.value(), error = %err, "Liveness probe errored");
                    Ok(Liveness::Unknown)
                }
                Err(_elapsed) => {
                    debug!(
                        handle = handle.value(),
                        timeout_ms = u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX),
                        "Liveness probe timed out"
                    );
                    Ok(Liveness::Unknown)
                }
            }
        })
    }
}
