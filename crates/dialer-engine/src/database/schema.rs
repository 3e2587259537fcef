//! Database schema definitions for the dialer
//!
//! Timestamps are unix milliseconds (INTEGER). Working-window times are
//! `HH:MM:SS[.f]` text, weekday sets and retry delays are JSON arrays.

use sqlx::SqlitePool;
use tracing::debug;

use crate::error::Result;

/// Create the campaigns table
pub async fn create_campaigns_table(pool: &SqlitePool) -> Result<()> {
    debug!("📋 Creating campaigns table");

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS campaigns (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            timezone TEXT NOT NULL,
            window_start TEXT NOT NULL,
            window_end TEXT NOT NULL,
            window_days TEXT NOT NULL,
            max_attempts INTEGER NOT NULL,
            retry_after_minutes TEXT NOT NULL,
            calls_per_minute INTEGER NOT NULL,
            max_concurrent INTEGER NOT NULL,
            run_state TEXT NOT NULL DEFAULT 'draft',
            caller_id TEXT,
            assistant_id TEXT,
            test_number TEXT,
            start_at INTEGER,
            stop_at INTEGER,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_campaigns_run_state ON campaigns(run_state)")
        .execute(pool)
        .await?;

    Ok(())
}

/// Create the leads table
pub async fn create_leads_table(pool: &SqlitePool) -> Result<()> {
    debug!("📋 Creating leads table");

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS leads (
            id TEXT PRIMARY KEY,
            campaign_id TEXT NOT NULL,
            batch_label TEXT NOT NULL,
            first_name TEXT NOT NULL,
            last_name TEXT,
            contact_number TEXT NOT NULL,
            timezone TEXT,
            status TEXT NOT NULL DEFAULT 'queued',
            attempts INTEGER NOT NULL DEFAULT 0,
            last_outcome TEXT,
            order_index INTEGER NOT NULL,
            next_eligible_at INTEGER,
            dial_failures INTEGER NOT NULL DEFAULT 0,
            active_session_id TEXT,
            owner_id TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            FOREIGN KEY (campaign_id) REFERENCES campaigns(id) ON DELETE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await?;

    // selection order: smallest order_index, then oldest
    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_leads_selection
            ON leads(campaign_id, status, order_index, created_at)
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Create the call attempts table
pub async fn create_call_attempts_table(pool: &SqlitePool) -> Result<()> {
    debug!("📋 Creating call_attempts table");

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS call_attempts (
            session_id TEXT PRIMARY KEY,
            kind TEXT NOT NULL,
            campaign_id TEXT,
            lead_id TEXT,
            attempt_number INTEGER NOT NULL DEFAULT 1,
            callee_number TEXT NOT NULL,
            status TEXT NOT NULL,
            outcome TEXT,
            started_at INTEGER NOT NULL,
            ended_at INTEGER,
            duration_seconds INTEGER,
            sentiment REAL,
            owner_id TEXT,
            FOREIGN KEY (lead_id) REFERENCES leads(id) ON DELETE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await?;

    // at most one open attempt per lead
    sqlx::query(
        r#"
        CREATE UNIQUE INDEX IF NOT EXISTS idx_call_attempts_open_lead
            ON call_attempts(lead_id)
            WHERE ended_at IS NULL AND lead_id IS NOT NULL
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_call_attempts_campaign ON call_attempts(campaign_id, ended_at)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Create the engine instances table
pub async fn create_engine_instances_table(pool: &SqlitePool) -> Result<()> {
    debug!("📋 Creating engine_instances table");

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS engine_instances (
            id TEXT PRIMARY KEY,
            started_at INTEGER NOT NULL,
            heartbeat_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}
