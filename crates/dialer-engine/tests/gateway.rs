//! Test and manual calls under the account-wide ceiling

mod common;

use std::sync::Arc;

use chrono::Utc;
use common::*;
use dialer_engine::prelude::*;
use dialer_engine::scheduler::TickOutcome;

async fn engine_with_ceiling(ceiling: u32) -> (Arc<CampaignEngine>, Arc<SimulatedProvider>) {
    let provider = Arc::new(SimulatedProvider::new());
    let mut config = test_config();
    config.general.account_max_concurrent = ceiling;
    (engine_with(config, Arc::clone(&provider)).await, provider)
}

#[tokio::test]
async fn manual_call_uses_the_default_caller_id() {
    let (engine, provider) = test_engine().await;

    let session = engine
        .trigger_manual_call("assistant-9", "+1 (555) 010-2030")
        .await
        .unwrap();

    let (_, request) = provider.originated().pop().unwrap();
    assert_eq!(request.caller_id, "+15550000000");
    assert_eq!(request.callee_number, "+15550102030");
    assert_eq!(request.assistant_id, "assistant-9");
    assert_eq!(request.lead_id, None);

    let active = engine.get_active_calls(None);
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].session_id, session);
    assert_eq!(active[0].kind, AttemptKind::Manual);
    assert_eq!(active[0].callee_number, "+15550102030");
}

#[tokio::test]
async fn manual_call_without_default_caller_id_is_a_configuration_error() {
    let provider = Arc::new(SimulatedProvider::new());
    let mut config = test_config();
    config.gateway.default_caller_id = None;
    let engine = engine_with(config, provider).await;

    let err = engine
        .trigger_manual_call("assistant-1", "+15550102030")
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Configuration(_)));

    let err = engine.trigger_manual_call("assistant-1", "12").await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidInput(_)));
}

#[tokio::test]
async fn account_ceiling_rejects_extra_calls_until_one_ends() {
    let (engine, _provider) = engine_with_ceiling(1).await;

    let first = engine
        .trigger_manual_call("assistant-1", "+15550102030")
        .await
        .unwrap();
    let err = engine
        .trigger_manual_call("assistant-1", "+15550102031")
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::CapacityExhausted(_)));

    engine.hangup(&first).await.unwrap();
    tokio_test::assert_ok!(engine.trigger_manual_call("assistant-1", "+15550102031").await);
}

#[tokio::test]
async fn scheduled_calls_share_the_account_ceiling() {
    let (engine, _provider) = engine_with_ceiling(1).await;
    let (campaign, leads) = running_campaign(&engine, campaign_definition("Shared"), 1).await;
    let scheduler = engine.dial_scheduler(&campaign.id).await.unwrap();

    engine
        .trigger_manual_call("assistant-1", "+15550102030")
        .await
        .unwrap();
    assert_eq!(scheduler.tick(Utc::now()).await.unwrap(), TickOutcome::AtCapacity);

    // the lead was never touched
    let lead = engine.leads().require(&leads[0].id).await.unwrap();
    assert_eq!(lead.status, LeadStatus::Queued);
    assert_eq!(lead.attempts, 0);
}

#[tokio::test]
async fn test_call_dials_the_campaign_test_number() {
    let (engine, provider) = test_engine().await;
    let mut definition = campaign_definition("With test number");
    definition.test_number = Some("+15559998888".to_string());
    let campaign = engine.create_campaign(definition).await.unwrap();

    let session = engine.trigger_test_call(&campaign.id).await.unwrap();
    let (_, request) = provider.originated().pop().unwrap();
    assert_eq!(request.callee_number, "+15559998888");
    assert_eq!(request.caller_id, "+15551230000");
    assert_eq!(request.campaign_id, Some(campaign.id.clone()));

    // test calls do not count against the campaign's live calls
    assert_eq!(engine.get_campaign_stats(&campaign.id).await.unwrap().active_calls, 0);

    engine.ingest_provider_event(ProviderEvent::new(session.clone(), ProviderCallStatus::Completed));
    wait_for_no_active_calls(&engine).await;

    let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
    loop {
        let attempt = engine.attempts().get(&session).await.unwrap().unwrap();
        if attempt.ended_at.is_some() {
            assert_eq!(attempt.kind, AttemptKind::Test);
            assert_eq!(attempt.outcome, Some(CallOutcome::Completed));
            assert_eq!(attempt.lead_id, None);
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "test attempt never closed");
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_call_requires_a_test_number() {
    let (engine, _provider) = test_engine().await;
    let campaign = engine
        .create_campaign(campaign_definition("No test number"))
        .await
        .unwrap();

    let err = engine.trigger_test_call(&campaign.id).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidInput(_)));

    let err = engine
        .trigger_test_call(&CampaignId::from("missing"))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NotFound(_)));
}
