//! Engine instance leases.
//!
//! Every engine sharing a database registers an instance row and renews
//! its `heartbeat_at` periodically. Claimed leads and open attempts carry
//! the claiming instance's id, so recovery only settles work whose owner
//! stopped renewing its lease.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tracing::debug;
use uuid::Uuid;

use crate::error::Result;

use super::to_millis;

/// Identifier of one running engine process
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(pub String);

impl InstanceId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for InstanceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone)]
pub struct InstanceStore {
    pool: SqlitePool,
}

impl InstanceStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Register `id`, or renew its lease if it is already registered
    pub async fn heartbeat(&self, id: &InstanceId, now: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO engine_instances (id, started_at, heartbeat_at) VALUES (?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET heartbeat_at = excluded.heartbeat_at
            "#,
        )
        .bind(id.as_str())
        .bind(to_millis(now))
        .bind(to_millis(now))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Whether `id` renewed its lease at or after `cutoff`
    pub async fn is_live(&self, id: &InstanceId, cutoff: DateTime<Utc>) -> Result<bool> {
        let live: Option<i64> =
            sqlx::query_scalar("SELECT 1 FROM engine_instances WHERE id = ? AND heartbeat_at >= ?")
                .bind(id.as_str())
                .bind(to_millis(cutoff))
                .fetch_optional(&self.pool)
                .await?;
        Ok(live.is_some())
    }

    /// Drop instances whose lease lapsed before `cutoff` and that own nothing
    pub async fn forget_expired(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM engine_instances
            WHERE heartbeat_at < ?
              AND id NOT IN (SELECT owner_id FROM leads WHERE owner_id IS NOT NULL)
              AND id NOT IN (
                  SELECT owner_id FROM call_attempts
                  WHERE ended_at IS NULL AND owner_id IS NOT NULL
              )
            "#,
        )
        .bind(to_millis(cutoff))
        .execute(&self.pool)
        .await?;

        let removed = result.rows_affected();
        if removed > 0 {
            debug!("Forgot {} expired engine instances", removed);
        }
        Ok(removed)
    }
}
