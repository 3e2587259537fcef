//! # Dialer Database
//!
//! SQLite persistence for campaigns, leads and call attempts, accessed
//! through an async `sqlx` pool. Every lead status change is a conditional
//! update (`WHERE status = <expected>`), so concurrent schedulers and
//! trackers never overwrite each other's work; a statement that matches no
//! row simply reports `false` to the caller.

pub mod attempt_store;
pub mod campaign_store;
pub mod instance_store;
pub mod lead_store;
pub mod schema;

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::{debug, info};

use crate::config::DatabaseConfig;
use crate::error::{EngineError, Result};

pub use attempt_store::AttemptStore;
pub use campaign_store::CampaignStore;
pub use instance_store::{InstanceId, InstanceStore};
pub use lead_store::{ClaimOutcome, LeadResolution, LeadStore, PendingWork};

/// Dialer database handle
#[derive(Clone)]
pub struct EngineDatabase {
    pool: SqlitePool,
}

impl EngineDatabase {
    /// Open (creating if missing) the database described by `config`
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        if config.url.contains(":memory:") {
            return Self::new_in_memory().await;
        }

        info!("🗄️ Opening dialer database at: {}", config.url);

        let options = SqliteConnectOptions::from_str(&config.url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(config.busy_timeout_secs))
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options)
            .await?;

        let database = Self { pool };
        database.initialize_schema().await?;

        info!("✅ Dialer database initialized successfully");
        Ok(database)
    }

    /// Create in-memory database for testing
    ///
    /// An in-memory SQLite database lives as long as its connection, so the
    /// pool is pinned to one connection that is never recycled.
    pub async fn new_in_memory() -> Result<Self> {
        info!("🗄️ Creating in-memory dialer database");

        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let database = Self { pool };
        database.initialize_schema().await?;

        info!("✅ In-memory database created successfully");
        Ok(database)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create tables and indexes if they do not exist yet
    pub async fn initialize_schema(&self) -> Result<()> {
        debug!("📋 Initializing dialer schema");
        schema::create_campaigns_table(&self.pool).await?;
        schema::create_leads_table(&self.pool).await?;
        schema::create_call_attempts_table(&self.pool).await?;
        schema::create_engine_instances_table(&self.pool).await?;
        Ok(())
    }

    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

pub(crate) fn to_millis(t: DateTime<Utc>) -> i64 {
    t.timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .ok_or_else(|| EngineError::internal(format!("timestamp {} out of range", ms)))
}

pub(crate) fn from_millis_opt(ms: Option<i64>) -> Result<Option<DateTime<Utc>>> {
    ms.map(from_millis).transpose()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_memory_database_passes_health_check() {
        let db = EngineDatabase::new_in_memory().await.unwrap();
        db.health_check().await.unwrap();
        // schema creation is idempotent
        db.initialize_schema().await.unwrap();
    }

    #[tokio::test]
    async fn file_database_is_created_on_connect() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dialer.db");
        let config = DatabaseConfig {
            url: format!("sqlite://{}", path.display()),
            ..DatabaseConfig::default()
        };
        let db = EngineDatabase::connect(&config).await.unwrap();
        db.health_check().await.unwrap();
        assert!(path.exists());
        db.close().await;
    }

    #[test]
    fn millis_round_trip_keeps_precision() {
        let now = from_millis(1_718_200_000_123).unwrap();
        assert_eq!(to_millis(now), 1_718_200_000_123);
        assert_eq!(from_millis_opt(None).unwrap(), None);
    }
}
