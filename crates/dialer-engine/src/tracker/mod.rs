//! # Call Lifecycle Tracker
//!
//! Owns every live call attempt from origination to a terminal outcome.
//! Each attempt runs in its own task that receives provider events through
//! a channel, mirrors live status onto the lead, polls the provider when it
//! goes quiet, and gives up with `failed` once the silence outlasts the
//! configured timeout. The attempt's concurrency slots live inside that
//! task and are released the moment the attempt ends, before the store is
//! updated.
//!
//! Provider events that arrive before their session is registered (a fast
//! webhook racing the `originate` response) are held briefly and replayed
//! on registration.

pub mod attempt;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::campaign::{Campaign, CampaignId, RetryPolicy};
use crate::config::TrackerConfig;
use crate::database::attempt_store::{AttemptClose, NewAttempt};
use crate::database::{AttemptStore, CampaignStore, LeadResolution, LeadStore};
use crate::error::{EngineError, Result};
use crate::events::{EngineEvent, EventBus};
use crate::lead::{CallOutcome, Lead, LeadStatus};
use crate::retry::RetryPlanner;
use crate::scheduler::budget::SlotGuard;
use crate::stats::StatsAggregator;
use crate::telephony::{CallSessionId, OriginateRequest, ProviderCallStatus, ProviderEvent, TelephonyProvider};

pub use attempt::{ActiveCallInfo, AttemptKind, CallAttempt};

/// Slots held for the lifetime of one attempt
#[derive(Debug)]
pub struct AttemptPermits {
    /// Campaign pacing slot; absent for test and manual calls
    pub campaign: Option<SlotGuard>,
    /// Account-wide slot
    pub account: SlotGuard,
}

/// How a provider event was handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    Delivered,
    Buffered,
}

enum Control {
    Event(ProviderEvent),
    Hangup(oneshot::Sender<()>),
}

struct ActiveCall {
    info: ActiveCallInfo,
    control: mpsc::UnboundedSender<Control>,
}

struct PendingEvents {
    first_seen: Instant,
    events: Vec<ProviderEvent>,
}

/// Per-attempt state owned by the attempt task
struct AttemptContext {
    session_id: CallSessionId,
    kind: AttemptKind,
    campaign_id: Option<CampaignId>,
    lead: Option<Lead>,
    callee_number: String,
    /// Lead status as last written by this attempt
    lead_status: LeadStatus,
    attempt_number: u32,
    retry_policy: Option<RetryPolicy>,
    call_status: ProviderCallStatus,
    permits: Option<AttemptPermits>,
    hangup_ack: Option<oneshot::Sender<()>>,
}

pub struct CallLifecycleTracker {
    provider: Arc<dyn TelephonyProvider>,
    leads: LeadStore,
    campaigns: CampaignStore,
    attempts: AttemptStore,
    stats: Arc<StatsAggregator>,
    events: EventBus,
    planner: RetryPlanner,
    config: TrackerConfig,
    registry: DashMap<CallSessionId, ActiveCall>,
    pending: Mutex<HashMap<CallSessionId, PendingEvents>>,
}

impl CallLifecycleTracker {
    pub fn new(
        provider: Arc<dyn TelephonyProvider>,
        leads: LeadStore,
        campaigns: CampaignStore,
        attempts: AttemptStore,
        stats: Arc<StatsAggregator>,
        events: EventBus,
        planner: RetryPlanner,
        config: TrackerConfig,
    ) -> Self {
        Self {
            provider,
            leads,
            campaigns,
            attempts,
            stats,
            events,
            planner,
            config,
            registry: DashMap::new(),
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn provider(&self) -> &Arc<dyn TelephonyProvider> {
        &self.provider
    }

    /// Dial a claimed lead (`initiated`, no session yet) and start tracking.
    ///
    /// A `Provider` error means the dial was refused and the lead is left
    /// exactly as it was; the caller decides between cooldown and failure.
    pub async fn begin_lead_attempt(
        self: &Arc<Self>,
        campaign: &Campaign,
        lead: Lead,
        permits: AttemptPermits,
    ) -> Result<CallSessionId> {
        let request = OriginateRequest {
            caller_id: campaign
                .caller_id
                .clone()
                .ok_or_else(|| EngineError::configuration("campaign has no caller_id"))?,
            callee_number: lead.contact_number.clone(),
            assistant_id: campaign
                .assistant_id
                .clone()
                .ok_or_else(|| EngineError::configuration("campaign has no assistant_id"))?,
            campaign_id: Some(campaign.id.clone()),
            lead_id: Some(lead.id.clone()),
        };

        let session_id = self.provider.originate(request).await?;
        let now = Utc::now();

        let recorded = match self.leads.record_origination(&lead, &session_id, now).await {
            Ok(recorded) => recorded,
            Err(e) => {
                self.abandon(&session_id).await;
                return Err(e);
            }
        };
        if !recorded {
            self.abandon(&session_id).await;
            return Err(EngineError::internal(format!(
                "lead {} changed while dialing",
                lead.id
            )));
        }

        info!(
            "📞 Dialing lead {} of campaign {} (attempt {}, session {})",
            lead.id,
            campaign.id,
            lead.attempts + 1,
            session_id
        );

        let context = AttemptContext {
            session_id: session_id.clone(),
            kind: AttemptKind::Scheduled,
            campaign_id: Some(campaign.id.clone()),
            attempt_number: lead.attempts + 1,
            callee_number: lead.contact_number.clone(),
            lead_status: LeadStatus::Initiated,
            retry_policy: Some(campaign.retry_policy.clone()),
            call_status: ProviderCallStatus::Initiated,
            permits: Some(permits),
            hangup_ack: None,
            lead: Some(lead),
        };
        self.track(context, now);
        Ok(session_id)
    }

    /// Dial a test or manual call. No lead is involved.
    pub async fn begin_adhoc_attempt(
        self: &Arc<Self>,
        kind: AttemptKind,
        request: OriginateRequest,
        account_slot: SlotGuard,
    ) -> Result<CallSessionId> {
        let campaign_id = request.campaign_id.clone();
        let callee = request.callee_number.clone();
        let session_id = self.provider.originate(request).await?;
        let now = Utc::now();

        if let Err(e) = self
            .attempts
            .record_started(&NewAttempt {
                session_id: &session_id,
                kind,
                campaign_id: campaign_id.as_ref(),
                lead_id: None,
                attempt_number: 1,
                callee_number: &callee,
                started_at: now,
                owner: self.leads.owner(),
            })
            .await
        {
            self.abandon(&session_id).await;
            return Err(e);
        }

        info!("📞 Placed {} call to {} (session {})", kind, callee, session_id);

        let context = AttemptContext {
            session_id: session_id.clone(),
            kind,
            campaign_id,
            lead: None,
            callee_number: callee,
            lead_status: LeadStatus::Initiated,
            attempt_number: 1,
            retry_policy: None,
            call_status: ProviderCallStatus::Initiated,
            permits: Some(AttemptPermits {
                campaign: None,
                account: account_slot,
            }),
            hangup_ack: None,
        };
        self.track(context, now);
        Ok(session_id)
    }

    async fn abandon(&self, session_id: &CallSessionId) {
        if let Err(e) = self.provider.hangup(session_id).await {
            warn!("Failed to hang up untracked session {}: {}", session_id, e);
        }
    }

    fn track(self: &Arc<Self>, context: AttemptContext, now: chrono::DateTime<Utc>) {
        let (control, receiver) = mpsc::unbounded_channel();

        let info = ActiveCallInfo {
            session_id: context.session_id.clone(),
            kind: context.kind,
            campaign_id: context.campaign_id.clone(),
            lead_id: context.lead.as_ref().map(|l| l.id.clone()),
            callee_number: context.callee_number.clone(),
            status: ProviderCallStatus::Initiated,
            started_at: now,
            last_update_at: now,
        };

        self.events.publish(EngineEvent::AttemptStarted {
            session_id: context.session_id.clone(),
            kind: context.kind,
            campaign_id: info.campaign_id.clone(),
            lead_id: info.lead_id.clone(),
            at: now,
        });

        // register and drain early events under the pending lock so
        // route_event never sees neither
        {
            let mut pending = self.pending.lock();
            if let Some(early) = pending.remove(&context.session_id) {
                debug!(
                    "Replaying {} early events for session {}",
                    early.events.len(),
                    context.session_id
                );
                for event in early.events {
                    let _ = control.send(Control::Event(event));
                }
            }
            self.registry
                .insert(context.session_id.clone(), ActiveCall { info, control });
        }

        let tracker = Arc::clone(self);
        tokio::spawn(async move {
            tracker.drive(context, receiver).await;
        });
    }

    /// Deliver a provider event to its attempt, or hold it until the
    /// session registers.
    pub fn route_event(&self, event: ProviderEvent) -> RouteOutcome {
        let mut pending = self.pending.lock();
        if let Some(call) = self.registry.get(&event.session_id) {
            // a closed channel means the attempt is finishing; drop the event
            let _ = call.control.send(Control::Event(event));
            return RouteOutcome::Delivered;
        }

        debug!("Buffering event {} for unknown session {}", event.status, event.session_id);
        pending
            .entry(event.session_id.clone())
            .or_insert_with(|| PendingEvents {
                first_seen: Instant::now(),
                events: Vec::new(),
            })
            .events
            .push(event);
        RouteOutcome::Buffered
    }

    /// Drop early events whose session never showed up. Returns how many
    /// sessions were discarded.
    pub fn sweep_pending(&self) -> usize {
        let ttl = Duration::from_secs(self.config.pending_event_ttl_secs);
        let mut pending = self.pending.lock();
        let before = pending.len();
        pending.retain(|_, p| p.first_seen.elapsed() < ttl);
        let dropped = before - pending.len();
        if dropped > 0 {
            debug!("Discarded early events for {} unknown sessions", dropped);
        }
        dropped
    }

    pub fn pending_sessions(&self) -> usize {
        self.pending.lock().len()
    }

    /// Operator hangup. Returns once the attempt has released its slots.
    pub async fn hangup(&self, session_id: &CallSessionId) -> Result<()> {
        let control = self
            .registry
            .get(session_id)
            .map(|call| call.control.clone())
            .ok_or_else(|| EngineError::not_found(format!("active call {}", session_id)))?;

        if let Err(e) = self.provider.hangup(session_id).await {
            warn!("Provider hangup of {} failed, canceling locally: {}", session_id, e);
        }

        let (ack, released) = oneshot::channel();
        if control.send(Control::Hangup(ack)).is_err() {
            // attempt ended on its own meanwhile
            return Ok(());
        }
        let _ = released.await;
        info!("☎️ Call {} hung up by operator", session_id);
        Ok(())
    }

    /// Live attempts, optionally for one campaign
    pub fn active_calls(&self, campaign_id: Option<&CampaignId>) -> Vec<ActiveCallInfo> {
        let mut calls: Vec<ActiveCallInfo> = self
            .registry
            .iter()
            .filter(|entry| campaign_id.map_or(true, |c| entry.info.campaign_id.as_ref() == Some(c)))
            .map(|entry| entry.info.clone())
            .collect();
        calls.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        calls
    }

    /// Number of live scheduled attempts for a campaign
    pub fn active_count(&self, campaign_id: &CampaignId) -> usize {
        self.registry
            .iter()
            .filter(|entry| {
                entry.info.kind == AttemptKind::Scheduled
                    && entry.info.campaign_id.as_ref() == Some(campaign_id)
            })
            .count()
    }

    pub fn total_active(&self) -> usize {
        self.registry.len()
    }

    async fn drive(self: Arc<Self>, mut context: AttemptContext, mut receiver: mpsc::UnboundedReceiver<Control>) {
        let poll_interval = self.config.status_poll_interval();
        let status_timeout = self.config.status_timeout();
        let mut last_update = Instant::now();

        let terminal = loop {
            let silence = last_update.elapsed();
            if silence >= status_timeout {
                warn!(
                    "⏰ No status for session {} in {:?}, failing the attempt",
                    context.session_id, status_timeout
                );
                if let Err(e) = self.provider.hangup(&context.session_id).await {
                    debug!("Hangup after timeout of {} failed: {}", context.session_id, e);
                }
                break ProviderEvent::new(context.session_id.clone(), ProviderCallStatus::Failed);
            }

            let wait = poll_interval.min(status_timeout - silence);
            match tokio::time::timeout(wait, receiver.recv()).await {
                Ok(Some(Control::Event(event))) => {
                    last_update = Instant::now();
                    if let Some(terminal) = self.apply(&mut context, event).await {
                        break terminal;
                    }
                }
                Ok(Some(Control::Hangup(ack))) => {
                    context.hangup_ack = Some(ack);
                    break ProviderEvent::new(context.session_id.clone(), ProviderCallStatus::Canceled);
                }
                Ok(None) => {
                    break ProviderEvent::new(context.session_id.clone(), ProviderCallStatus::Failed);
                }
                Err(_) => {
                    if last_update.elapsed() >= status_timeout {
                        continue;
                    }
                    match self.provider.status(&context.session_id).await {
                        Ok(Some(event)) => {
                            last_update = Instant::now();
                            if let Some(terminal) = self.apply(&mut context, event).await {
                                break terminal;
                            }
                        }
                        Ok(None) => {}
                        Err(e) => debug!("Status poll for {} failed: {}", context.session_id, e),
                    }
                }
            }
        };

        self.finish(context, terminal).await;
    }

    /// Apply a live event; returns the event back if it is terminal
    async fn apply(&self, context: &mut AttemptContext, event: ProviderEvent) -> Option<ProviderEvent> {
        if event.status.is_terminal() {
            return Some(event);
        }
        if event.status.rank() <= context.call_status.rank() {
            // duplicate or out of order
            return None;
        }

        let now = Utc::now();
        context.call_status = event.status;
        if let Some(mut call) = self.registry.get_mut(&context.session_id) {
            call.info.status = event.status;
            call.info.last_update_at = now;
        }
        if let Err(e) = self.attempts.update_status(&context.session_id, event.status).await {
            warn!("Failed to record status of {}: {}", context.session_id, e);
        }

        if let (Some(lead), Some(target)) = (context.lead.as_ref(), event.status.live_lead_status()) {
            if target != context.lead_status && context.lead_status.can_transition_to(target) {
                match self
                    .leads
                    .mirror_status(lead, &context.session_id, context.lead_status, target, now)
                    .await
                {
                    Ok(true) => context.lead_status = target,
                    Ok(false) => debug!("Lead {} moved under session {}", lead.id, context.session_id),
                    Err(e) => warn!("Failed to mirror {} onto lead {}: {}", target, lead.id, e),
                }
            }
        }
        None
    }

    async fn finish(&self, mut context: AttemptContext, terminal: ProviderEvent) {
        // release slots first so the scheduler can dial again right away
        self.registry.remove(&context.session_id);
        drop(context.permits.take());
        if let Some(ack) = context.hangup_ack.take() {
            let _ = ack.send(());
        }

        let now = Utc::now();
        let outcome = terminal.status.outcome().unwrap_or(CallOutcome::Failed);
        let close = AttemptClose {
            status: terminal.status,
            outcome,
            ended_at: now,
            duration_seconds: terminal.duration_seconds,
            sentiment: terminal.sentiment,
        };

        match context.lead.as_ref() {
            Some(lead) => {
                let resolution = self.resolve(&context, outcome, now).await;
                self.finalize_lead(&context, lead, &close, resolution).await;
                self.stats
                    .record_call_metrics(&lead.campaign_id, close.duration_seconds, close.sentiment);
            }
            None => {
                if let Err(e) = self.attempts.close(&context.session_id, &close).await {
                    error!("Failed to close attempt {}: {}", context.session_id, e);
                }
            }
        }

        self.events.publish(EngineEvent::AttemptEnded {
            session_id: context.session_id.clone(),
            kind: context.kind,
            campaign_id: context.campaign_id.clone(),
            lead_id: context.lead.as_ref().map(|l| l.id.clone()),
            outcome,
            at: now,
        });
        info!("📴 Session {} ended: {}", context.session_id, outcome);
    }

    async fn resolve(&self, context: &AttemptContext, outcome: CallOutcome, now: chrono::DateTime<Utc>) -> LeadResolution {
        match outcome {
            CallOutcome::Completed | CallOutcome::Canceled => return LeadResolution::Complete,
            CallOutcome::Machine if self.config.machine_is_contact => return LeadResolution::Complete,
            _ => {}
        }

        // prefer the current policy; an edit while paused applies to in-flight leads too
        let current = match &context.campaign_id {
            Some(id) => self.campaigns.get(id).await.ok().flatten().map(|c| c.retry_policy),
            None => None,
        };
        let policy = current
            .or_else(|| context.retry_policy.clone())
            .unwrap_or(RetryPolicy {
                max_attempts: 1,
                retry_after_minutes: Vec::new(),
            });

        self.planner
            .plan(&policy, context.attempt_number, outcome, now)
            .into()
    }

    /// Apply `resolution` to the lead, retrying store failures with capped
    /// backoff until it lands or the lead is no longer bound to this session.
    async fn finalize_lead(&self, context: &AttemptContext, lead: &Lead, close: &AttemptClose, resolution: LeadResolution) {
        let mut expected = context.lead_status;
        let mut delay = self.config.finalize_retry_initial();
        let mut failures = 0u32;

        loop {
            match self
                .leads
                .finalize_attempt(lead, expected, &context.session_id, close, resolution)
                .await
            {
                Ok(true) => {
                    debug!(
                        "Lead {} -> {} after {}",
                        lead.id,
                        resolution.status(),
                        close.outcome
                    );
                    return;
                }
                Ok(false) => {
                    // our view of the lead status is stale; re-read and retry
                    match self.leads.get(&lead.id).await {
                        Ok(Some(current))
                            if current.active_session_id.as_deref() == Some(context.session_id.as_str()) =>
                        {
                            expected = current.status;
                            continue;
                        }
                        Ok(_) => {
                            warn!("Lead {} no longer bound to session {}", lead.id, context.session_id);
                            return;
                        }
                        Err(e) => warn!("Failed to reload lead {}: {}", lead.id, e),
                    }
                }
                Err(EngineError::InvalidTransition(reason)) => {
                    error!("Cannot finalize lead {}: {}", lead.id, reason);
                    return;
                }
                Err(e) => {
                    failures += 1;
                    warn!(
                        "Finalizing lead {} failed (try {}), retrying in {:?}: {}",
                        lead.id, failures, delay, e
                    );
                }
            }

            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(self.config.finalize_retry_max());
        }
    }
}
