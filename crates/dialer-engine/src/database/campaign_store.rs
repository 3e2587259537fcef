//! Campaign persistence.

use chrono::{DateTime, NaiveTime, Utc};
use sqlx::SqlitePool;
use tracing::debug;

use crate::campaign::{Campaign, CampaignId, NewCampaign, Pacing, RetryPolicy, RunState, WorkingWindow};
use crate::error::{EngineError, Result};

use super::{from_millis, from_millis_opt, to_millis};

const TIME_FORMAT: &str = "%H:%M:%S%.f";

const SELECT_CAMPAIGN: &str = r#"
    SELECT id, name, timezone, window_start, window_end, window_days, max_attempts,
           retry_after_minutes, calls_per_minute, max_concurrent, run_state, caller_id,
           assistant_id, test_number, start_at, stop_at, created_at, updated_at
    FROM campaigns
"#;

#[derive(sqlx::FromRow, Debug, Clone)]
struct CampaignRow {
    id: String,
    name: String,
    timezone: String,
    window_start: String,
    window_end: String,
    window_days: String,
    max_attempts: i64,
    retry_after_minutes: String,
    calls_per_minute: i64,
    max_concurrent: i64,
    run_state: String,
    caller_id: Option<String>,
    assistant_id: Option<String>,
    test_number: Option<String>,
    start_at: Option<i64>,
    stop_at: Option<i64>,
    created_at: i64,
    updated_at: i64,
}

impl TryFrom<CampaignRow> for Campaign {
    type Error = EngineError;

    fn try_from(row: CampaignRow) -> Result<Self> {
        let parse_time = |s: &str| {
            NaiveTime::parse_from_str(s, TIME_FORMAT)
                .map_err(|e| EngineError::internal(format!("bad stored time '{}': {}", s, e)))
        };

        Ok(Campaign {
            id: CampaignId(row.id),
            name: row.name,
            working_window: WorkingWindow {
                timezone: row.timezone,
                start: parse_time(&row.window_start)?,
                end: parse_time(&row.window_end)?,
                days: serde_json::from_str(&row.window_days)?,
            },
            retry_policy: RetryPolicy {
                max_attempts: row.max_attempts as u32,
                retry_after_minutes: serde_json::from_str(&row.retry_after_minutes)?,
            },
            pacing: Pacing {
                calls_per_minute: row.calls_per_minute as u32,
                max_concurrent: row.max_concurrent as u32,
            },
            run_state: row.run_state.parse()?,
            caller_id: row.caller_id,
            assistant_id: row.assistant_id,
            test_number: row.test_number,
            start_at: from_millis_opt(row.start_at)?,
            stop_at: from_millis_opt(row.stop_at)?,
            created_at: from_millis(row.created_at)?,
            updated_at: from_millis(row.updated_at)?,
        })
    }
}

/// Campaign records
#[derive(Clone)]
pub struct CampaignStore {
    pool: SqlitePool,
}

impl CampaignStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a new campaign in `draft`. The definition must already be validated.
    pub async fn create(&self, definition: NewCampaign, now: DateTime<Utc>) -> Result<Campaign> {
        let campaign = Campaign {
            id: CampaignId::new(),
            name: definition.name,
            working_window: definition.working_window,
            retry_policy: definition.retry_policy,
            pacing: definition.pacing,
            run_state: RunState::Draft,
            caller_id: definition.caller_id,
            assistant_id: definition.assistant_id,
            test_number: definition.test_number,
            start_at: definition.start_at,
            stop_at: definition.stop_at,
            created_at: now,
            updated_at: now,
        };

        sqlx::query(
            r#"
            INSERT INTO campaigns (
                id, name, timezone, window_start, window_end, window_days, max_attempts,
                retry_after_minutes, calls_per_minute, max_concurrent, run_state, caller_id,
                assistant_id, test_number, start_at, stop_at, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(campaign.id.as_str())
        .bind(&campaign.name)
        .bind(&campaign.working_window.timezone)
        .bind(campaign.working_window.start.format(TIME_FORMAT).to_string())
        .bind(campaign.working_window.end.format(TIME_FORMAT).to_string())
        .bind(serde_json::to_string(&campaign.working_window.days)?)
        .bind(campaign.retry_policy.max_attempts as i64)
        .bind(serde_json::to_string(&campaign.retry_policy.retry_after_minutes)?)
        .bind(campaign.pacing.calls_per_minute as i64)
        .bind(campaign.pacing.max_concurrent as i64)
        .bind(campaign.run_state.as_str())
        .bind(&campaign.caller_id)
        .bind(&campaign.assistant_id)
        .bind(&campaign.test_number)
        .bind(campaign.start_at.map(to_millis))
        .bind(campaign.stop_at.map(to_millis))
        .bind(to_millis(now))
        .bind(to_millis(now))
        .execute(&self.pool)
        .await?;

        debug!("Campaign {} created", campaign.id);
        Ok(campaign)
    }

    pub async fn get(&self, id: &CampaignId) -> Result<Option<Campaign>> {
        let row = sqlx::query_as::<_, CampaignRow>(&format!("{} WHERE id = ?", SELECT_CAMPAIGN))
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.map(Campaign::try_from).transpose()
    }

    /// Like `get`, but a missing campaign is `NotFound`
    pub async fn require(&self, id: &CampaignId) -> Result<Campaign> {
        self.get(id)
            .await?
            .ok_or_else(|| EngineError::not_found(format!("campaign {}", id)))
    }

    pub async fn list(&self) -> Result<Vec<Campaign>> {
        let rows = sqlx::query_as::<_, CampaignRow>(&format!("{} ORDER BY created_at, id", SELECT_CAMPAIGN))
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(Campaign::try_from).collect()
    }

    pub async fn list_in_state(&self, state: RunState) -> Result<Vec<Campaign>> {
        let rows = sqlx::query_as::<_, CampaignRow>(&format!(
            "{} WHERE run_state = ? ORDER BY created_at, id",
            SELECT_CAMPAIGN
        ))
        .bind(state.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Campaign::try_from).collect()
    }

    /// Replace a campaign's definition. Refused while the campaign is running.
    pub async fn update(&self, id: &CampaignId, definition: NewCampaign, now: DateTime<Utc>) -> Result<Campaign> {
        let result = sqlx::query(
            r#"
            UPDATE campaigns SET
                name = ?, timezone = ?, window_start = ?, window_end = ?, window_days = ?,
                max_attempts = ?, retry_after_minutes = ?, calls_per_minute = ?,
                max_concurrent = ?, caller_id = ?, assistant_id = ?, test_number = ?,
                start_at = ?, stop_at = ?, updated_at = ?
            WHERE id = ? AND run_state != 'running'
            "#,
        )
        .bind(&definition.name)
        .bind(&definition.working_window.timezone)
        .bind(definition.working_window.start.format(TIME_FORMAT).to_string())
        .bind(definition.working_window.end.format(TIME_FORMAT).to_string())
        .bind(serde_json::to_string(&definition.working_window.days)?)
        .bind(definition.retry_policy.max_attempts as i64)
        .bind(serde_json::to_string(&definition.retry_policy.retry_after_minutes)?)
        .bind(definition.pacing.calls_per_minute as i64)
        .bind(definition.pacing.max_concurrent as i64)
        .bind(&definition.caller_id)
        .bind(&definition.assistant_id)
        .bind(&definition.test_number)
        .bind(definition.start_at.map(to_millis))
        .bind(definition.stop_at.map(to_millis))
        .bind(to_millis(now))
        .bind(id.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            let existing = self.require(id).await?;
            return Err(EngineError::invalid_transition(format!(
                "campaign {} cannot be edited while {}",
                id, existing.run_state
            )));
        }

        self.require(id).await
    }

    /// Compare-and-swap the run state. Returns `false` if the campaign was
    /// not in `from`.
    pub async fn transition(&self, id: &CampaignId, from: RunState, to: RunState, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE campaigns SET run_state = ?, updated_at = ? WHERE id = ? AND run_state = ?",
        )
        .bind(to.as_str())
        .bind(to_millis(now))
        .bind(id.as_str())
        .bind(from.as_str())
        .execute(&self.pool)
        .await?;

        let changed = result.rows_affected() > 0;
        if changed {
            debug!("Campaign {} run state {} -> {}", id, from, to);
        }
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::EngineDatabase;

    fn definition() -> NewCampaign {
        NewCampaign {
            name: "Store test".to_string(),
            working_window: WorkingWindow {
                timezone: "UTC".to_string(),
                start: NaiveTime::from_hms_opt(0, 0, 0).unwrap(),
                end: NaiveTime::from_hms_nano_opt(23, 59, 59, 999_999_999).unwrap(),
                days: vec![0, 1, 2, 3, 4, 5, 6],
            },
            retry_policy: RetryPolicy {
                max_attempts: 3,
                retry_after_minutes: vec![15, 60],
            },
            pacing: Pacing {
                calls_per_minute: 30,
                max_concurrent: 2,
            },
            caller_id: Some("+15550001111".to_string()),
            assistant_id: Some("asst-1".to_string()),
            test_number: Some("+15550002222".to_string()),
            start_at: None,
            stop_at: None,
        }
    }

    async fn store() -> CampaignStore {
        let db = EngineDatabase::new_in_memory().await.unwrap();
        CampaignStore::new(db.pool().clone())
    }

    #[tokio::test]
    async fn create_then_get_preserves_definition() {
        let store = store().await;
        let now = Utc::now();
        let created = store.create(definition(), now).await.unwrap();

        let loaded = store.require(&created.id).await.unwrap();
        assert_eq!(loaded.run_state, RunState::Draft);
        assert_eq!(loaded.working_window, created.working_window);
        assert_eq!(loaded.retry_policy.retry_after_minutes, vec![15, 60]);
        assert_eq!(loaded.test_number.as_deref(), Some("+15550002222"));
        assert_eq!(loaded.created_at.timestamp_millis(), now.timestamp_millis());
    }

    #[tokio::test]
    async fn missing_campaign_is_not_found() {
        let store = store().await;
        let err = store.require(&CampaignId::from("nope")).await.unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
    }

    #[tokio::test]
    async fn transition_is_compare_and_swap() {
        let store = store().await;
        let campaign = store.create(definition(), Utc::now()).await.unwrap();

        assert!(store
            .transition(&campaign.id, RunState::Draft, RunState::Running, Utc::now())
            .await
            .unwrap());
        // second caller loses
        assert!(!store
            .transition(&campaign.id, RunState::Draft, RunState::Running, Utc::now())
            .await
            .unwrap());

        let running = store.list_in_state(RunState::Running).await.unwrap();
        assert_eq!(running.len(), 1);
    }

    #[tokio::test]
    async fn update_is_refused_while_running() {
        let store = store().await;
        let campaign = store.create(definition(), Utc::now()).await.unwrap();

        let mut changed = definition();
        changed.name = "Renamed".to_string();
        let updated = store.update(&campaign.id, changed.clone(), Utc::now()).await.unwrap();
        assert_eq!(updated.name, "Renamed");

        store
            .transition(&campaign.id, RunState::Draft, RunState::Running, Utc::now())
            .await
            .unwrap();
        let err = store.update(&campaign.id, changed, Utc::now()).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidTransition(_)));
    }
}
