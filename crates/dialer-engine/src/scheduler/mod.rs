//! # Dial Scheduler
//!
//! One [`DialScheduler`] per campaign. Each [`tick`](DialScheduler::tick)
//! makes at most one dial:
//!
//! 1. reload the campaign and ask the policy evaluator for permission
//! 2. take a campaign slot and an account slot
//! 3. wait out the pacing gate
//! 4. select and atomically claim the next eligible lead
//! 5. hand the lead and both slots to the lifecycle tracker
//!
//! [`run`](DialScheduler::run) drives ticks until the campaign stops
//! running or the loop is cancelled, sleeping only as long as the last
//! tick says nothing can happen.

pub mod budget;
pub mod pacing;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::campaign::{Campaign, CampaignId, RunState};
use crate::config::SchedulerConfig;
use crate::database::{CampaignStore, ClaimOutcome, LeadResolution, LeadStore};
use crate::error::{EngineError, Result};
use crate::events::{EngineEvent, EventBus};
use crate::lead::{CallOutcome, Lead, LeadId, LeadStatus};
use crate::policy::{DenyReason, PolicyEvaluator};
use crate::retry::RetryPlanner;
use crate::telephony::CallSessionId;
use crate::tracker::{AttemptPermits, CallLifecycleTracker};

use self::budget::ConcurrencyBudget;
use self::pacing::PacingGate;

/// Collaborators shared by every campaign's scheduler
#[derive(Clone)]
pub struct SchedulerContext {
    pub campaigns: CampaignStore,
    pub leads: LeadStore,
    pub policy: PolicyEvaluator,
    pub planner: RetryPlanner,
    pub tracker: Arc<CallLifecycleTracker>,
    pub account: Arc<ConcurrencyBudget>,
    pub events: EventBus,
    pub config: SchedulerConfig,
}

/// What a single tick did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// A lead was claimed and its call originated
    Dialed { lead_id: LeadId, session_id: CallSessionId },
    /// The provider refused the dial; the lead was cooled down or failed
    DialRejected { lead_id: LeadId },
    /// Policy forbids dialing now
    NotPermitted {
        reason: Option<DenyReason>,
        next_eligible_at: Option<DateTime<Utc>>,
    },
    /// No campaign or account slot is free
    AtCapacity,
    /// Pacing gate needs more time
    Throttled { ready_in: Duration },
    /// Nothing eligible right now, but work remains
    Idle { next_eligible_at: Option<DateTime<Utc>> },
    /// Nothing queued or in flight; the campaign moved to `completed`
    Completed,
    /// Campaign is no longer running
    Stopped,
}

enum Claim {
    Lead(Lead),
    /// Nothing claimable at `now`
    Nothing,
    /// Other engines fill the campaign's `max_concurrent`
    AtCapacity,
    Stopped,
}

enum Wait {
    Now,
    For(Duration),
    Slot,
}

pub struct DialScheduler {
    campaign_id: CampaignId,
    ctx: SchedulerContext,
    budget: Arc<ConcurrencyBudget>,
    pacing: Mutex<PacingGate>,
    calls_per_minute: Mutex<u32>,
}

impl DialScheduler {
    pub fn new(campaign: &Campaign, ctx: SchedulerContext, budget: Arc<ConcurrencyBudget>) -> Self {
        let pacing = PacingGate::new(
            campaign.pacing.calls_per_minute,
            ctx.config.pacing_burst,
            Instant::now(),
        );
        Self {
            campaign_id: campaign.id.clone(),
            ctx,
            budget,
            pacing: Mutex::new(pacing),
            calls_per_minute: Mutex::new(campaign.pacing.calls_per_minute),
        }
    }

    pub fn campaign_id(&self) -> &CampaignId {
        &self.campaign_id
    }

    pub fn budget(&self) -> &Arc<ConcurrencyBudget> {
        &self.budget
    }

    /// Pick up pacing edits made while the loop was paused
    fn sync_pacing(&self, campaign: &Campaign) {
        if campaign.pacing.max_concurrent != self.budget.limit() {
            self.budget.resize(campaign.pacing.max_concurrent);
        }
        let mut rate = self.calls_per_minute.lock();
        if *rate != campaign.pacing.calls_per_minute {
            *rate = campaign.pacing.calls_per_minute;
            self.pacing.lock().set_rate(*rate, Instant::now());
        }
    }

    /// Run one scheduling step at `now`
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<TickOutcome> {
        let campaign = match self.ctx.campaigns.get(&self.campaign_id).await? {
            Some(campaign) if campaign.run_state == RunState::Running => campaign,
            _ => return Ok(TickOutcome::Stopped),
        };
        self.sync_pacing(&campaign);

        let permission = self.ctx.policy.evaluate(&campaign, now)?;
        if !permission.permitted {
            return Ok(TickOutcome::NotPermitted {
                reason: permission.reason,
                next_eligible_at: permission.next_eligible_at,
            });
        }

        let Some(campaign_slot) = self.budget.try_acquire() else {
            return Ok(TickOutcome::AtCapacity);
        };
        let Some(account_slot) = self.ctx.account.try_acquire() else {
            return Ok(TickOutcome::AtCapacity);
        };

        let ready_in = self.pacing.lock().ready_in(Instant::now());
        if !ready_in.is_zero() {
            return Ok(TickOutcome::Throttled { ready_in });
        }

        let lead = match self.claim_next(&campaign, now).await? {
            Claim::Lead(lead) => lead,
            Claim::AtCapacity => return Ok(TickOutcome::AtCapacity),
            Claim::Stopped => return Ok(TickOutcome::Stopped),
            Claim::Nothing => {
                let pending = self.ctx.leads.pending_work(&campaign.id, now).await?;
                if pending.is_drained() {
                    return self.complete(&campaign, now).await;
                }
                return Ok(TickOutcome::Idle {
                    next_eligible_at: pending.next_eligible_at,
                });
            }
        };

        self.pacing.lock().try_consume(Instant::now());
        let lead_id = lead.id.clone();
        let permits = AttemptPermits {
            campaign: Some(campaign_slot),
            account: account_slot,
        };

        match self.ctx.tracker.begin_lead_attempt(&campaign, lead.clone(), permits).await {
            Ok(session_id) => Ok(TickOutcome::Dialed { lead_id, session_id }),
            Err(EngineError::Provider(reason)) => {
                self.handle_rejection(&campaign, &lead, &reason, now).await?;
                Ok(TickOutcome::DialRejected { lead_id })
            }
            Err(e) => {
                if let Err(requeue_err) = self.ctx.leads.requeue_unstarted(&lead, Utc::now()).await {
                    warn!("Failed to requeue lead {}: {}", lead.id, requeue_err);
                }
                Err(e)
            }
        }
    }

    /// Walk the eligible queue in dialing order, page by page, and claim
    /// the first lead whose own local window is open. Leads lost to another
    /// claimant are skipped.
    async fn claim_next(&self, campaign: &Campaign, now: DateTime<Utc>) -> Result<Claim> {
        let batch = self.ctx.config.candidate_batch;
        let mut windows: HashMap<Option<String>, bool> = HashMap::new();
        let mut after = None;

        loop {
            let candidates = self.ctx.leads.next_candidates(&campaign.id, now, after, batch).await?;
            let exhausted = candidates.len() < batch as usize;
            after = candidates.last().map(|lead| lead.order_index);

            for mut lead in candidates {
                let open = *windows.entry(lead.timezone.clone()).or_insert_with(|| {
                    self.ctx
                        .policy
                        .lead_window_open(campaign, lead.timezone.as_deref(), now)
                });
                if !open {
                    continue;
                }
                match self
                    .ctx
                    .leads
                    .try_claim(&lead, campaign.pacing.max_concurrent, now)
                    .await?
                {
                    ClaimOutcome::Claimed => {
                        lead.status = LeadStatus::Initiated;
                        return Ok(Claim::Lead(lead));
                    }
                    ClaimOutcome::Lost => {
                        debug!("Lost claim on lead {} in campaign {}", lead.id, campaign.id);
                    }
                    ClaimOutcome::AtCapacity => return Ok(Claim::AtCapacity),
                    ClaimOutcome::CampaignNotRunning => return Ok(Claim::Stopped),
                }
            }

            if exhausted {
                return Ok(Claim::Nothing);
            }
        }
    }

    async fn handle_rejection(&self, campaign: &Campaign, lead: &Lead, reason: &str, now: DateTime<Utc>) -> Result<()> {
        let failures = lead.dial_failures + 1;
        if failures < self.ctx.config.max_dial_failures {
            let until = now + self.ctx.config.dial_failure_cooldown();
            self.ctx.leads.release_claim(lead, until, now).await?;
            warn!(
                "🚫 Dial of lead {} rejected ({}/{}): {}; retrying after {}",
                lead.id, failures, self.ctx.config.max_dial_failures, reason, until
            );
        } else {
            let resolution: LeadResolution = self
                .ctx
                .planner
                .plan(&campaign.retry_policy, lead.attempts + 1, CallOutcome::Failed, now)
                .into();
            self.ctx.leads.fail_origination(lead, resolution, now).await?;
            warn!(
                "🚫 Dial of lead {} rejected {} times, counted as a failed attempt -> {}",
                lead.id,
                failures,
                resolution.status()
            );
        }
        Ok(())
    }

    async fn complete(&self, campaign: &Campaign, now: DateTime<Utc>) -> Result<TickOutcome> {
        if self
            .ctx
            .campaigns
            .transition(&campaign.id, RunState::Running, RunState::Completed, now)
            .await?
        {
            info!("🏁 Campaign {} completed", campaign.id);
            self.ctx.events.publish(EngineEvent::CampaignStateChanged {
                campaign_id: campaign.id.clone(),
                from: RunState::Running,
                to: RunState::Completed,
                at: now,
            });
            Ok(TickOutcome::Completed)
        } else {
            Ok(TickOutcome::Stopped)
        }
    }

    /// Tick until the campaign leaves `running` or `cancel` fires
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!("▶️ Dial loop started for campaign {}", self.campaign_id);
        let poll = self.ctx.config.poll_interval();
        let initial_backoff = Duration::from_millis(self.ctx.config.error_backoff_initial_ms);
        let max_backoff = Duration::from_millis(self.ctx.config.error_backoff_max_ms);
        let mut backoff = initial_backoff;

        loop {
            if cancel.is_cancelled() {
                break;
            }

            let wait = match self.tick(Utc::now()).await {
                Ok(outcome) => {
                    backoff = initial_backoff;
                    match outcome {
                        TickOutcome::Dialed { .. } | TickOutcome::DialRejected { .. } => Wait::Now,
                        TickOutcome::NotPermitted { next_eligible_at, .. } => Wait::For(until(next_eligible_at, poll)),
                        TickOutcome::Idle { next_eligible_at } => Wait::For(until(next_eligible_at, poll)),
                        TickOutcome::Throttled { ready_in } => Wait::For(ready_in.min(poll)),
                        TickOutcome::AtCapacity => Wait::Slot,
                        TickOutcome::Completed | TickOutcome::Stopped => break,
                    }
                }
                Err(e) => {
                    warn!(
                        "Dial loop for campaign {} failed, backing off {:?}: {}",
                        self.campaign_id, backoff, e
                    );
                    let wait = backoff;
                    backoff = (backoff * 2).min(max_backoff);
                    Wait::For(wait)
                }
            };

            match wait {
                Wait::Now => tokio::task::yield_now().await,
                Wait::For(duration) => {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(duration) => {}
                    }
                }
                Wait::Slot => {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = self.budget.slot_released() => {}
                        _ = self.ctx.account.slot_released() => {}
                        _ = tokio::time::sleep(poll) => {}
                    }
                }
            }
        }

        info!("⏹️ Dial loop stopped for campaign {}", self.campaign_id);
    }
}

/// Sleep until `next`, capped at `poll`
fn until(next: Option<DateTime<Utc>>, poll: Duration) -> Duration {
    match next {
        Some(at) => (at - Utc::now()).to_std().unwrap_or(Duration::ZERO).min(poll),
        None => poll,
    }
}
