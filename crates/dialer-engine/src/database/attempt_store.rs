//! Call attempt history.
//!
//! Rows are only ever inserted and then closed once. Scheduled attempts are
//! written inside the same transaction as the lead update that owns them
//! (see `LeadStore`), through the connection-level helpers here.

use chrono::{DateTime, Utc};
use sqlx::{SqliteConnection, SqlitePool};

use crate::campaign::CampaignId;
use crate::error::Result;
use crate::lead::{CallOutcome, LeadId};
use crate::telephony::{CallSessionId, ProviderCallStatus};
use crate::tracker::{AttemptKind, CallAttempt};

use super::instance_store::InstanceId;
use super::{from_millis, from_millis_opt, to_millis};

#[derive(sqlx::FromRow, Debug, Clone)]
struct AttemptRow {
    session_id: String,
    kind: String,
    campaign_id: Option<String>,
    lead_id: Option<String>,
    attempt_number: i64,
    callee_number: String,
    status: String,
    outcome: Option<String>,
    started_at: i64,
    ended_at: Option<i64>,
    duration_seconds: Option<i64>,
    sentiment: Option<f64>,
}

impl TryFrom<AttemptRow> for CallAttempt {
    type Error = crate::error::EngineError;

    fn try_from(row: AttemptRow) -> Result<Self> {
        Ok(CallAttempt {
            session_id: CallSessionId(row.session_id),
            kind: row.kind.parse()?,
            campaign_id: row.campaign_id.map(CampaignId),
            lead_id: row.lead_id.map(LeadId),
            attempt_number: row.attempt_number as u32,
            callee_number: row.callee_number,
            status: parse_status(&row.status)?,
            outcome: row.outcome.as_deref().map(str::parse::<CallOutcome>).transpose()?,
            started_at: from_millis(row.started_at)?,
            ended_at: from_millis_opt(row.ended_at)?,
            duration_seconds: row.duration_seconds.map(|d| d as u32),
            sentiment: row.sentiment,
        })
    }
}

fn parse_status(s: &str) -> Result<ProviderCallStatus> {
    Ok(serde_json::from_value(serde_json::Value::String(s.to_string()))?)
}

/// Fields of a freshly started attempt
#[derive(Debug, Clone)]
pub struct NewAttempt<'a> {
    pub session_id: &'a CallSessionId,
    pub kind: AttemptKind,
    pub campaign_id: Option<&'a CampaignId>,
    pub lead_id: Option<&'a LeadId>,
    pub attempt_number: u32,
    pub callee_number: &'a str,
    pub started_at: DateTime<Utc>,
    /// Engine instance that owns the attempt until it closes
    pub owner: &'a InstanceId,
}

/// How an attempt ended
#[derive(Debug, Clone, Copy)]
pub struct AttemptClose {
    pub status: ProviderCallStatus,
    pub outcome: CallOutcome,
    pub ended_at: DateTime<Utc>,
    pub duration_seconds: Option<u32>,
    pub sentiment: Option<f64>,
}

pub(crate) async fn insert_attempt(conn: &mut SqliteConnection, attempt: &NewAttempt<'_>) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO call_attempts (
            session_id, kind, campaign_id, lead_id, attempt_number, callee_number,
            status, started_at, owner_id
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(attempt.session_id.as_str())
    .bind(attempt.kind.as_str())
    .bind(attempt.campaign_id.map(|c| c.as_str()))
    .bind(attempt.lead_id.map(|l| l.as_str()))
    .bind(attempt.attempt_number as i64)
    .bind(attempt.callee_number)
    .bind(ProviderCallStatus::Initiated.as_str())
    .bind(to_millis(attempt.started_at))
    .bind(attempt.owner.as_str())
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub(crate) async fn close_attempt(
    conn: &mut SqliteConnection,
    session_id: &CallSessionId,
    close: &AttemptClose,
) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE call_attempts
        SET status = ?, outcome = ?, ended_at = ?, duration_seconds = ?, sentiment = ?,
            owner_id = NULL
        WHERE session_id = ? AND ended_at IS NULL
        "#,
    )
    .bind(close.status.as_str())
    .bind(close.outcome.as_str())
    .bind(to_millis(close.ended_at))
    .bind(close.duration_seconds.map(|d| d as i64))
    .bind(close.sentiment)
    .bind(session_id.as_str())
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Duration and sentiment totals over a campaign's closed attempts
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct AttemptMetrics {
    pub duration_sum: f64,
    pub duration_count: u64,
    pub sentiment_sum: f64,
    pub sentiment_count: u64,
}

/// Attempt history access
#[derive(Clone)]
pub struct AttemptStore {
    pool: SqlitePool,
}

impl AttemptStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Record an attempt that is not tied to a lead (test and manual calls)
    pub async fn record_started(&self, attempt: &NewAttempt<'_>) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        insert_attempt(&mut conn, attempt).await
    }

    /// Mirror a live provider status onto an open attempt
    pub async fn update_status(&self, session_id: &CallSessionId, status: ProviderCallStatus) -> Result<bool> {
        let result = sqlx::query("UPDATE call_attempts SET status = ? WHERE session_id = ? AND ended_at IS NULL")
            .bind(status.as_str())
            .bind(session_id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Close an attempt; `false` if it was already closed or never recorded
    pub async fn close(&self, session_id: &CallSessionId, close: &AttemptClose) -> Result<bool> {
        let mut conn = self.pool.acquire().await?;
        close_attempt(&mut conn, session_id, close).await
    }

    pub async fn get(&self, session_id: &CallSessionId) -> Result<Option<CallAttempt>> {
        let row = sqlx::query_as::<_, AttemptRow>("SELECT * FROM call_attempts WHERE session_id = ?")
            .bind(session_id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.map(CallAttempt::try_from).transpose()
    }

    pub async fn list_for_lead(&self, lead_id: &LeadId) -> Result<Vec<CallAttempt>> {
        let rows = sqlx::query_as::<_, AttemptRow>(
            "SELECT * FROM call_attempts WHERE lead_id = ? ORDER BY started_at, attempt_number",
        )
        .bind(lead_id.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(CallAttempt::try_from).collect()
    }

    /// Attempts that have not been closed yet
    pub async fn list_open(&self) -> Result<Vec<CallAttempt>> {
        let rows = sqlx::query_as::<_, AttemptRow>(
            "SELECT * FROM call_attempts WHERE ended_at IS NULL ORDER BY started_at",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(CallAttempt::try_from).collect()
    }

    /// Open lead-less attempts whose owner has no lease renewed at or after
    /// `live_cutoff`
    pub async fn orphaned_open(&self, live_cutoff: DateTime<Utc>) -> Result<Vec<CallAttempt>> {
        let rows = sqlx::query_as::<_, AttemptRow>(
            r#"
            SELECT * FROM call_attempts
            WHERE ended_at IS NULL AND lead_id IS NULL
              AND (owner_id IS NULL
                   OR owner_id NOT IN (SELECT id FROM engine_instances WHERE heartbeat_at >= ?))
            ORDER BY started_at
            "#,
        )
        .bind(to_millis(live_cutoff))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(CallAttempt::try_from).collect()
    }

    pub async fn campaign_metrics(&self, campaign_id: &CampaignId) -> Result<AttemptMetrics> {
        let row: (Option<f64>, i64, Option<f64>, i64) = sqlx::query_as(
            r#"
            SELECT CAST(SUM(duration_seconds) AS REAL), COUNT(duration_seconds),
                   SUM(sentiment), COUNT(sentiment)
            FROM call_attempts
            WHERE campaign_id = ? AND kind = 'scheduled' AND ended_at IS NOT NULL
            "#,
        )
        .bind(campaign_id.as_str())
        .fetch_one(&self.pool)
        .await?;

        Ok(AttemptMetrics {
            duration_sum: row.0.unwrap_or(0.0),
            duration_count: row.1 as u64,
            sentiment_sum: row.2.unwrap_or(0.0),
            sentiment_count: row.3 as u64,
        })
    }
}
