//! Call lifecycle tracking: live status, outcomes, retries, hangup and timeouts

mod common;

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use common::*;
use dialer_engine::prelude::*;
use dialer_engine::scheduler::{DialScheduler, TickOutcome};
use dialer_engine::tracker::RouteOutcome;

async fn dial(scheduler: &DialScheduler, at: chrono::DateTime<Utc>) -> CallSessionId {
    match scheduler.tick(at).await.unwrap() {
        TickOutcome::Dialed { session_id, .. } => session_id,
        other => panic!("expected a dial, got {:?}", other),
    }
}

#[tokio::test]
async fn busy_then_no_answer_retries_after_15_then_60_minutes_then_stops() {
    let (engine, _provider) = test_engine().await;
    let (campaign, leads) = running_campaign(&engine, campaign_definition("Retries"), 1).await;
    let scheduler = engine.dial_scheduler(&campaign.id).await.unwrap();
    let lead_id = &leads[0].id;

    let session = dial(&scheduler, Utc::now()).await;
    engine.ingest_provider_event(ProviderEvent::new(session, ProviderCallStatus::Busy));
    let lead = wait_for_lead_status(&engine, lead_id, LeadStatus::Queued).await;
    assert_eq!(lead.attempts, 1);
    assert_eq!(lead.last_outcome, Some(CallOutcome::Busy));
    assert_eq!(lead.next_eligible_at.unwrap() - lead.updated_at, Duration::minutes(15));

    // not eligible before the delay has passed
    assert!(matches!(scheduler.tick(Utc::now()).await.unwrap(), TickOutcome::Idle { .. }));

    let session = dial(&scheduler, lead.next_eligible_at.unwrap()).await;
    engine.ingest_provider_event(ProviderEvent::new(session, ProviderCallStatus::NoAnswer));
    let lead = wait_for_lead_status(&engine, lead_id, LeadStatus::Queued).await;
    assert_eq!(lead.attempts, 2);
    assert_eq!(lead.next_eligible_at.unwrap() - lead.updated_at, Duration::minutes(60));

    let session = dial(&scheduler, lead.next_eligible_at.unwrap()).await;
    engine.ingest_provider_event(ProviderEvent::new(session, ProviderCallStatus::NoAnswer));
    let lead = wait_for_lead_status(&engine, lead_id, LeadStatus::NoAnswer).await;
    assert_eq!(lead.attempts, 3);
    assert_eq!(lead.next_eligible_at, None);
    assert_eq!(lead.active_session_id, None);

    let history = engine.attempts().list_for_lead(lead_id).await.unwrap();
    let numbers: Vec<u32> = history.iter().map(|a| a.attempt_number).collect();
    assert_eq!(numbers, vec![1, 2, 3]);
    assert!(history.iter().all(|a| a.ended_at.is_some()));
}

#[tokio::test]
async fn live_statuses_are_mirrored_onto_the_lead() {
    let (engine, _provider) = test_engine().await;
    let (campaign, leads) = running_campaign(&engine, campaign_definition("Mirror"), 1).await;
    let scheduler = engine.dial_scheduler(&campaign.id).await.unwrap();
    let lead_id = &leads[0].id;

    let session = dial(&scheduler, Utc::now()).await;
    engine.ingest_provider_event(ProviderEvent::new(session.clone(), ProviderCallStatus::Ringing));
    wait_for_lead_status(&engine, lead_id, LeadStatus::Ringing).await;

    engine.ingest_provider_event(ProviderEvent::new(session.clone(), ProviderCallStatus::InProgress));
    wait_for_lead_status(&engine, lead_id, LeadStatus::Calling).await;

    // stale event after a later one is ignored
    engine.ingest_provider_event(ProviderEvent::new(session.clone(), ProviderCallStatus::Ringing));

    engine.ingest_provider_event(
        ProviderEvent::new(session.clone(), ProviderCallStatus::Completed)
            .with_duration(42)
            .with_sentiment(0.8),
    );
    let lead = wait_for_lead_status(&engine, lead_id, LeadStatus::Completed).await;
    assert_eq!(lead.last_outcome, Some(CallOutcome::Completed));

    let attempt = engine.attempts().get(&session).await.unwrap().unwrap();
    assert_eq!(attempt.outcome, Some(CallOutcome::Completed));
    assert_eq!(attempt.duration_seconds, Some(42));

    wait_for_no_active_calls(&engine).await;
    let deadline = tokio::time::Instant::now() + StdDuration::from_secs(5);
    loop {
        let stats = engine.get_campaign_stats(&campaign.id).await.unwrap();
        if stats.average_duration_seconds == Some(42.0) {
            assert_eq!(stats.average_sentiment, Some(0.8));
            assert_eq!(stats.completed, 1);
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "call metrics never recorded");
        tokio::time::sleep(StdDuration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn ringing_call_finishes_after_the_campaign_is_paused() {
    let (engine, _provider) = test_engine().await;
    let (campaign, leads) = running_campaign(&engine, campaign_definition("Pause"), 2).await;
    let scheduler = engine.dial_scheduler(&campaign.id).await.unwrap();

    let session = dial(&scheduler, Utc::now()).await;
    engine.ingest_provider_event(ProviderEvent::new(session.clone(), ProviderCallStatus::Ringing));
    wait_for_lead_status(&engine, &leads[0].id, LeadStatus::Ringing).await;

    engine
        .set_campaign_run_state(&campaign.id, RunState::Paused)
        .await
        .unwrap();

    engine.ingest_provider_event(ProviderEvent::new(session, ProviderCallStatus::Completed));
    wait_for_lead_status(&engine, &leads[0].id, LeadStatus::Completed).await;

    // no new dial while paused
    assert_eq!(scheduler.tick(Utc::now()).await.unwrap(), TickOutcome::Stopped);
    let second = engine.leads().require(&leads[1].id).await.unwrap();
    assert_eq!(second.status, LeadStatus::Queued);
}

#[tokio::test]
async fn operator_hangup_completes_the_lead_and_frees_the_slot() {
    let (engine, provider) = test_engine().await;
    let mut definition = campaign_definition("Hangup");
    definition.pacing.max_concurrent = 1;
    let (campaign, leads) = running_campaign(&engine, definition, 2).await;
    let scheduler = engine.dial_scheduler(&campaign.id).await.unwrap();

    let session = dial(&scheduler, Utc::now()).await;
    engine.ingest_provider_event(ProviderEvent::new(session.clone(), ProviderCallStatus::Answered));
    wait_for_lead_status(&engine, &leads[0].id, LeadStatus::Answered).await;
    assert_eq!(scheduler.tick(Utc::now()).await.unwrap(), TickOutcome::AtCapacity);

    engine.hangup(&session).await.unwrap();
    assert!(provider.hangups().contains(&session));

    // slot is free as soon as hangup returns
    assert!(matches!(scheduler.tick(Utc::now()).await.unwrap(), TickOutcome::Dialed { .. }));

    let lead = wait_for_lead_status(&engine, &leads[0].id, LeadStatus::Completed).await;
    assert_eq!(lead.last_outcome, Some(CallOutcome::Canceled));
}

#[tokio::test]
async fn hangup_of_unknown_session_is_not_found() {
    let (engine, _provider) = test_engine().await;
    let err = engine.hangup(&CallSessionId::from("nope")).await.unwrap_err();
    assert!(matches!(err, EngineError::NotFound(_)));
}

#[tokio::test]
async fn silent_call_times_out_as_failed() {
    let provider = Arc::new(SimulatedProvider::new());
    let mut config = test_config();
    config.tracker.status_poll_interval_ms = 50;
    config.tracker.status_timeout_ms = 200;
    let engine = engine_with(config, Arc::clone(&provider)).await;
    let (campaign, leads) = running_campaign(&engine, campaign_definition("Silent"), 1).await;
    let scheduler = engine.dial_scheduler(&campaign.id).await.unwrap();

    let session = dial(&scheduler, Utc::now()).await;
    let lead = wait_for_lead_status(&engine, &leads[0].id, LeadStatus::Queued).await;
    assert_eq!(lead.attempts, 1);
    assert_eq!(lead.last_outcome, Some(CallOutcome::Failed));
    assert!(provider.hangups().contains(&session));

    let attempt = engine.attempts().get(&session).await.unwrap().unwrap();
    assert_eq!(attempt.status, ProviderCallStatus::Failed);
}

#[tokio::test]
async fn quiet_call_is_resolved_by_polling_the_provider() {
    let provider = Arc::new(SimulatedProvider::new());
    let mut config = test_config();
    config.tracker.status_poll_interval_ms = 30;
    config.tracker.status_timeout_ms = 5_000;
    let engine = engine_with(config, Arc::clone(&provider)).await;
    let (campaign, leads) = running_campaign(&engine, campaign_definition("Polled"), 1).await;
    let scheduler = engine.dial_scheduler(&campaign.id).await.unwrap();

    let session = dial(&scheduler, Utc::now()).await;
    provider.set_status(&session, ProviderCallStatus::Busy);

    let lead = wait_for_lead_status(&engine, &leads[0].id, LeadStatus::Queued).await;
    assert_eq!(lead.last_outcome, Some(CallOutcome::Busy));
}

#[tokio::test]
async fn events_arriving_before_registration_are_replayed() {
    let (engine, _provider) = test_engine().await;
    let (campaign, leads) = running_campaign(&engine, campaign_definition("Early"), 1).await;
    let scheduler = engine.dial_scheduler(&campaign.id).await.unwrap();

    // the simulated provider will assign sim-1 to the first call
    let early = ProviderEvent::new(CallSessionId::from("sim-1"), ProviderCallStatus::Ringing);
    assert_eq!(engine.ingest_provider_event(early), RouteOutcome::Buffered);
    assert_eq!(engine.tracker().pending_sessions(), 1);

    let session = dial(&scheduler, Utc::now()).await;
    assert_eq!(session.as_str(), "sim-1");
    wait_for_lead_status(&engine, &leads[0].id, LeadStatus::Ringing).await;
    assert_eq!(engine.tracker().pending_sessions(), 0);
}

#[tokio::test]
async fn machine_outcome_is_retried_unless_it_counts_as_contact() {
    let (engine, _provider) = test_engine().await;
    let (campaign, leads) = running_campaign(&engine, campaign_definition("Machines"), 1).await;
    let scheduler = engine.dial_scheduler(&campaign.id).await.unwrap();
    let session = dial(&scheduler, Utc::now()).await;
    engine.ingest_provider_event(ProviderEvent::new(session, ProviderCallStatus::Machine));
    let lead = wait_for_lead_status(&engine, &leads[0].id, LeadStatus::Queued).await;
    assert_eq!(lead.last_outcome, Some(CallOutcome::Machine));

    let provider = Arc::new(SimulatedProvider::new());
    let mut config = test_config();
    config.tracker.machine_is_contact = true;
    let engine = engine_with(config, provider).await;
    let (campaign, leads) = running_campaign(&engine, campaign_definition("Machines count"), 1).await;
    let scheduler = engine.dial_scheduler(&campaign.id).await.unwrap();
    let session = dial(&scheduler, Utc::now()).await;
    engine.ingest_provider_event(ProviderEvent::new(session, ProviderCallStatus::Machine));
    wait_for_lead_status(&engine, &leads[0].id, LeadStatus::Completed).await;
}

#[tokio::test]
async fn scripted_provider_drives_a_call_to_completion() {
    let provider = Arc::new(SimulatedProvider::with_script(dialer_engine::config::SimulationConfig {
        auto_progress: true,
        ring_after_ms: 10,
        answer_after_ms: 10,
        complete_after_ms: 10,
    }));
    let engine = engine_with(test_config(), Arc::clone(&provider)).await;
    engine.start().await.unwrap();

    let (campaign, leads) = running_campaign(&engine, campaign_definition("Scripted"), 2).await;
    for lead in &leads {
        wait_for_lead_status(&engine, &lead.id, LeadStatus::Completed).await;
    }

    let deadline = tokio::time::Instant::now() + StdDuration::from_secs(5);
    while engine.get_campaign(&campaign.id).await.unwrap().run_state != RunState::Completed {
        assert!(tokio::time::Instant::now() < deadline, "campaign never completed");
        tokio::time::sleep(StdDuration::from_millis(10)).await;
    }
    engine.shutdown().await;
}

#[tokio::test]
async fn failed_finalization_is_retried_until_the_store_recovers() {
    let (engine, _provider) = test_engine().await;
    let (campaign, leads) = running_campaign(&engine, campaign_definition("Flaky store"), 1).await;
    let scheduler = engine.dial_scheduler(&campaign.id).await.unwrap();
    let lead_id = &leads[0].id;

    let pool = engine.database().pool();
    sqlx::query(
        r#"
        CREATE TRIGGER reject_completion BEFORE UPDATE OF status ON leads
        WHEN NEW.status = 'completed'
        BEGIN
            SELECT RAISE(ABORT, 'store unavailable');
        END
        "#,
    )
    .execute(pool)
    .await
    .unwrap();

    let session = dial(&scheduler, Utc::now()).await;
    engine.ingest_provider_event(ProviderEvent::new(session.clone(), ProviderCallStatus::Completed));

    // well past several retry rounds, the lead is still bound to its call
    tokio::time::sleep(StdDuration::from_millis(300)).await;
    let lead = engine.leads().require(lead_id).await.unwrap();
    assert!(lead.status.is_in_flight());
    assert_eq!(lead.active_session_id.as_deref(), Some(session.as_str()));

    sqlx::query("DROP TRIGGER reject_completion")
        .execute(pool)
        .await
        .unwrap();

    let lead = wait_for_lead_status(&engine, lead_id, LeadStatus::Completed).await;
    assert_eq!(lead.attempts, 1);
    assert_eq!(lead.active_session_id, None);
    let attempt = engine.attempts().get(&session).await.unwrap().unwrap();
    assert_eq!(attempt.outcome, Some(CallOutcome::Completed));
}
