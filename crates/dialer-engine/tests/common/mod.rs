//! Shared helpers for dialer integration tests
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveTime, Utc};
use dialer_engine::database::InstanceId;
use dialer_engine::prelude::*;

/// Fast timings so tests finish quickly
pub fn test_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.scheduler.poll_interval_ms = 20;
    config.scheduler.pacing_burst = 10;
    config.scheduler.error_backoff_initial_ms = 10;
    config.scheduler.error_backoff_max_ms = 100;
    config.tracker.status_poll_interval_ms = 5_000;
    config.tracker.status_timeout_ms = 60_000;
    config.tracker.finalize_retry_initial_ms = 10;
    config.tracker.finalize_retry_max_ms = 50;
    config.general.heartbeat_interval_ms = 50;
    config.gateway.default_caller_id = Some("+15550000000".to_string());
    config
}

/// Current time truncated to the store's millisecond precision
pub fn now_millis() -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(Utc::now().timestamp_millis()).unwrap()
}

/// Open every day, all day, in UTC
pub fn always_open() -> WorkingWindow {
    WorkingWindow {
        timezone: "UTC".to_string(),
        start: NaiveTime::from_hms_opt(0, 0, 0).unwrap(),
        end: NaiveTime::from_hms_nano_opt(23, 59, 59, 999_999_999).unwrap(),
        days: vec![0, 1, 2, 3, 4, 5, 6],
    }
}

pub fn campaign_definition(name: &str) -> NewCampaign {
    NewCampaign {
        name: name.to_string(),
        working_window: always_open(),
        retry_policy: RetryPolicy {
            max_attempts: 3,
            retry_after_minutes: vec![15, 60],
        },
        pacing: Pacing {
            calls_per_minute: 600,
            max_concurrent: 5,
        },
        caller_id: Some("+15551230000".to_string()),
        assistant_id: Some("assistant-1".to_string()),
        test_number: None,
        start_at: None,
        stop_at: None,
    }
}

pub fn new_leads(count: usize) -> Vec<NewLead> {
    (0..count)
        .map(|i| NewLead {
            first_name: format!("Lead{}", i),
            last_name: None,
            contact_number: format!("+1555100{:04}", i),
            timezone: None,
        })
        .collect()
}

pub async fn engine_with(config: EngineConfig, provider: Arc<SimulatedProvider>) -> Arc<CampaignEngine> {
    let database = EngineDatabase::new_in_memory().await.unwrap();
    Arc::new(
        CampaignEngine::with_database(config, database, provider)
            .await
            .unwrap(),
    )
}

pub async fn test_engine() -> (Arc<CampaignEngine>, Arc<SimulatedProvider>) {
    let provider = Arc::new(SimulatedProvider::new());
    let engine = engine_with(test_config(), Arc::clone(&provider)).await;
    (engine, provider)
}

/// Create a campaign with `leads` leads and set it running
pub async fn running_campaign(engine: &CampaignEngine, definition: NewCampaign, leads: usize) -> (Campaign, Vec<Lead>) {
    let campaign = engine.create_campaign(definition).await.unwrap();
    let leads = engine
        .import_leads(&campaign.id, "batch-1", new_leads(leads))
        .await
        .unwrap();
    let campaign = engine
        .set_campaign_run_state(&campaign.id, RunState::Running)
        .await
        .unwrap();
    (campaign, leads)
}

/// Age an engine instance's lease so its peers treat it as dead
pub async fn expire_lease(database: &EngineDatabase, instance: &InstanceId) {
    sqlx::query("UPDATE engine_instances SET heartbeat_at = 0 WHERE id = ?")
        .bind(instance.as_str())
        .execute(database.pool())
        .await
        .unwrap();
}

/// Poll the store until `lead_id` reaches `status`
pub async fn wait_for_lead_status(engine: &CampaignEngine, lead_id: &LeadId, status: LeadStatus) -> Lead {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let lead = engine.leads().require(lead_id).await.unwrap();
        if lead.status == status {
            return lead;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("lead {} stuck in {} waiting for {}", lead_id, lead.status, status);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Poll until the tracker has no live calls left
pub async fn wait_for_no_active_calls(engine: &CampaignEngine) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !engine.get_active_calls(None).is_empty() {
        if tokio::time::Instant::now() > deadline {
            panic!("active calls never drained");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
