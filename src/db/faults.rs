#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![forbid(unsafe_code)]

//! Named checkpoints inside the dispatch write path. A harness plugs in a
//! [`FaultInjector`] to fail deterministically at one of them.

use crate::error::{Result, SwarmError};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultCheckpoint {
    BeforeInsert,
    AfterInsert,
    BeforeStageWrite,
}

impl FaultCheckpoint {
    pub const ALL: [Self; 3] = [Self::BeforeInsert, Self::AfterInsert, Self::BeforeStageWrite];

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::BeforeInsert => "before-insert",
            Self::AfterInsert => "after-insert",
            Self::BeforeStageWrite => "before-stage-write",
        }
    }
}

impl fmt::Display for FaultCheckpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

pub trait FaultInjector: Send + Sync {
    /// # Errors
    /// Returns an error to abort the surrounding transaction at `checkpoint`.
    fn check(&self, checkpoint: FaultCheckpoint) -> Result<()>;
}

/// Fails the first time `checkpoint` is reached, then lets every call through.
#[derive(Debug)]
pub struct FailOnceAt {
    checkpoint: FaultCheckpoint,
    fired: AtomicBool,
}

impl FailOnceAt {
    #[must_use]
    pub const fn new(checkpoint: FaultCheckpoint) -> Self {
        Self {
            checkpoint,
            fired: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn has_fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }
}

impl FaultInjector for FailOnceAt {
    fn check(&self, checkpoint: FaultCheckpoint) -> Result<()> {
        if checkpoint == self.checkpoint && !self.fired.swap(true, Ordering::SeqCst) {
            return Err(SwarmError::FaultInjected {
                checkpoint: checkpoint.to_string(),
            });
        }
        Ok(())
    }
}
