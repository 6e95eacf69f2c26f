#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![forbid(unsafe_code)]

use thiserror::Error;

/// Error code constants for type-safe error handling
pub mod code {
    pub const EXISTS: &str = "EXISTS";
    pub const NOTFOUND: &str = "NOTFOUND";
    pub const INVALID: &str = "INVALID";
    pub const CONFLICT: &str = "CONFLICT";
    pub const BUSY: &str = "BUSY";
    pub const DEPENDENCY: &str = "DEPENDENCY";
    pub const TIMEOUT: &str = "TIMEOUT";
    pub const INTERNAL: &str = "INTERNAL";
}

#[derive(Error, Debug)]
pub enum SwarmError {
    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("SQLx error: {0}")]
    SqlxError(#[from] sqlx::Error),

    #[error("Store timeout: {0}")]
    StoreTimeout(String),

    #[error("Injected fault at checkpoint {checkpoint}")]
    FaultInjected { checkpoint: String },

    #[error("Bead {bead_id} is already claimed by {holder}")]
    AlreadyClaimed { bead_id: String, holder: String },

    #[error("Bead {bead_id} exists in multiple projects: {}", projects.join(", "))]
    AmbiguousBead {
        bead_id: String,
        projects: Vec<String>,
    },

    #[error("Dispatch failed: {0}")]
    DispatchFailed(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Bead error: {0}")]
    BeadError(String),

    #[error("Stage error: {0}")]
    StageError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SwarmError {
    /// Returns the protocol error code for this error
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::ConfigError(_) | Self::SerializationError(_) => code::INVALID,
            Self::DatabaseError(_) | Self::SqlxError(_) | Self::Internal(_) => code::INTERNAL,
            Self::StoreTimeout(_) => code::TIMEOUT,
            Self::FaultInjected { .. } => code::BUSY,
            Self::AlreadyClaimed { .. } => code::EXISTS,
            Self::AmbiguousBead { .. } | Self::StageError(_) => code::CONFLICT,
            Self::BeadError(_) => code::NOTFOUND,
            Self::DispatchFailed(_) | Self::IoError(_) => code::DEPENDENCY,
        }
    }

    /// True when the caller may safely retry the same operation.
    ///
    /// Store writes are transactional, so a transient failure never leaves
    /// partial rows behind.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::StoreTimeout(_) | Self::FaultInjected { .. } => true,
            Self::SqlxError(err) => is_transient_sqlx(err),
            _ => false,
        }
    }

    /// Contention is a normal skip for the scheduler, never a failure.
    #[must_use]
    pub const fn is_contention(&self) -> bool {
        matches!(self, Self::AlreadyClaimed { .. })
    }
}

fn is_transient_sqlx(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::PoolTimedOut => true,
        sqlx::Error::Database(db_err) => {
            let message = db_err.message().to_ascii_lowercase();
            message.contains("database is locked") || message.contains("busy")
        }
        _ => false,
    }
}

/// Map a driver error to the crate error, keeping pool waits distinguishable.
pub(crate) fn store_error(context: &str, err: sqlx::Error) -> SwarmError {
    match err {
        sqlx::Error::PoolTimedOut => SwarmError::StoreTimeout(format!("{context}: lock wait exceeded")),
        other if is_transient_sqlx(&other) => {
            SwarmError::StoreTimeout(format!("{context}: {other}"))
        }
        other => SwarmError::DatabaseError(format!("{context}: {other}")),
    }
}

pub type Result<T> = std::result::Result<T, SwarmError>;
