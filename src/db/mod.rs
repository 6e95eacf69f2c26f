mod faults;
mod mappers;
mod read_ops;
mod write_ops;

#[cfg(test)]
mod store_behaviors;
#[cfg(test)]
mod test_support;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::error::{store_error, Result, SwarmError};

pub use faults::{FailOnceAt, FaultCheckpoint, FaultInjector};
pub(crate) use mappers::millis_ago;
pub use read_ops::{Allocation, UsageCounts};
pub use write_ops::{DispatchUsage, SchedulerDispatchRecord, StageTransition, WindowCap};

const SCHEMA_SQL: &str = include_str!("schema.sql");

/// Shared persistent store. Writes are serialized by the pool: one connection
/// by default, with a bounded wait for it.
#[derive(Clone)]
pub struct SwarmDb {
    pool: SqlitePool,
    faults: Option<Arc<dyn FaultInjector>>,
}

impl std::fmt::Debug for SwarmDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SwarmDb")
            .field("pool_size", &self.pool.size())
            .field("fault_injection", &self.faults.is_some())
            .finish()
    }
}

impl SwarmDb {
    /// Open (creating if needed) the store at `database_url` and apply the schema.
    ///
    /// # Errors
    /// Returns an error if the URL is invalid, the file cannot be opened, or
    /// the schema cannot be applied.
    pub async fn new(database_url: &str) -> Result<Self> {
        let settings = resolve_pool_settings();
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(|e| SwarmError::ConfigError(format!("Invalid database URL: {e}")))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(settings.lock_wait);

        let pool = SqlitePoolOptions::new()
            .max_connections(settings.max_connections)
            .acquire_timeout(settings.lock_wait)
            .connect_with(options)
            .await
            .map_err(|e| store_error("Failed to open store", e))?;

        let db = Self::new_with_pool(pool);
        db.migrate().await?;
        info!(database_url, "Opened swarm dispatch store");
        Ok(db)
    }

    /// Private in-memory store; the single connection is never recycled so the
    /// data lives as long as the pool.
    ///
    /// # Errors
    /// Returns an error if the schema cannot be applied.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| SwarmError::ConfigError(format!("Invalid database URL: {e}")))?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .acquire_timeout(resolve_pool_settings().lock_wait)
            .connect_with(options)
            .await
            .map_err(|e| store_error("Failed to open in-memory store", e))?;

        let db = Self::new_with_pool(pool);
        db.migrate().await?;
        Ok(db)
    }

    #[must_use]
    pub const fn new_with_pool(pool: SqlitePool) -> Self {
        Self { pool, faults: None }
    }

    /// Install a fault injector consulted at each [`FaultCheckpoint`].
    #[must_use]
    pub fn with_fault_injector(mut self, injector: Arc<dyn FaultInjector>) -> Self {
        self.faults = Some(injector);
        self
    }

    /// Apply the embedded schema. Idempotent.
    ///
    /// # Errors
    /// Returns an error if any schema statement fails.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA_SQL)
            .execute(self.pool())
            .await
            .map(|_result| ())
            .map_err(|e| store_error("Failed to initialize schema", e))
    }

    pub(crate) const fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn checkpoint(&self, checkpoint: FaultCheckpoint) -> Result<()> {
        self.faults
            .as_ref()
            .map_or(Ok(()), |injector| injector.check(checkpoint))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PoolSettings {
    max_connections: u32,
    lock_wait: Duration,
}

fn resolve_pool_settings() -> PoolSettings {
    resolve_pool_settings_from(|key| std::env::var(key).ok())
}

fn resolve_pool_settings_from<F>(env_lookup: F) -> PoolSettings
where
    F: Fn(&str) -> Option<String>,
{
    let max_connections = env_lookup("SWARM_DB_MAX_CONNECTIONS")
        .and_then(|v| v.parse::<u32>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(1);
    let lock_wait_ms = env_lookup("SWARM_DB_LOCK_WAIT_MS")
        .and_then(|v| v.parse::<u64>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(5_000);

    PoolSettings {
        max_connections,
        lock_wait: Duration::from_millis(lock_wait_ms),
    }
}
