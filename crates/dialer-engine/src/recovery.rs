//! # Orphan Recovery
//!
//! Engines sharing one database each hold a lease in `engine_instances`
//! and renew it every `heartbeat_interval_ms`. An in-flight lead or open
//! attempt belongs to the instance that claimed it; once that instance's
//! lease is older than `instance_lease_ms` any live engine may settle it:
//!
//! - claimed leads that never reached the provider go back to the queue
//! - leads bound to a session hang the session up and count the attempt
//!   as `failed` through the retry planner
//! - open test and manual attempts are closed as `failed`
//!
//! Calls owned by live instances, including this one, are never touched.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::campaign::RetryPolicy;
use crate::database::attempt_store::AttemptClose;
use crate::database::{AttemptStore, CampaignStore, InstanceId, InstanceStore, LeadResolution, LeadStore};
use crate::error::Result;
use crate::lead::CallOutcome;
use crate::retry::RetryPlanner;
use crate::telephony::{CallSessionId, ProviderCallStatus, TelephonyProvider};

#[derive(Clone)]
pub struct OrphanReaper {
    instance: InstanceId,
    instances: InstanceStore,
    campaigns: CampaignStore,
    leads: LeadStore,
    attempts: AttemptStore,
    provider: Arc<dyn TelephonyProvider>,
    planner: RetryPlanner,
    lease: chrono::Duration,
}

impl OrphanReaper {
    pub fn new(
        instance: InstanceId,
        instances: InstanceStore,
        campaigns: CampaignStore,
        leads: LeadStore,
        attempts: AttemptStore,
        provider: Arc<dyn TelephonyProvider>,
        planner: RetryPlanner,
        lease: chrono::Duration,
    ) -> Self {
        Self {
            instance,
            instances,
            campaigns,
            leads,
            attempts,
            provider,
            planner,
            lease,
        }
    }

    pub fn instance(&self) -> &InstanceId {
        &self.instance
    }

    /// Renew this instance's lease
    pub async fn heartbeat(&self, now: DateTime<Utc>) -> Result<()> {
        self.instances.heartbeat(&self.instance, now).await
    }

    /// Settle everything owned by instances whose lease expired before
    /// `now`. Returns how many leads and attempts were settled.
    pub async fn reap(&self, now: DateTime<Utc>) -> Result<usize> {
        let cutoff = now - self.lease;
        let orphans = self.leads.orphaned_in_flight(cutoff).await?;
        if !orphans.is_empty() {
            warn!("🔧 Recovering {} in-flight leads from expired engine instances", orphans.len());
        }
        let mut settled = 0;

        for lead in orphans {
            let Some(session) = lead.active_session_id.clone() else {
                if self.leads.requeue_unstarted(&lead, now).await? {
                    settled += 1;
                }
                continue;
            };
            let session_id = CallSessionId::from(session);
            if let Err(e) = self.provider.hangup(&session_id).await {
                debug!("Hangup of stale session {} failed: {}", session_id, e);
            }

            let policy = self
                .campaigns
                .get(&lead.campaign_id)
                .await?
                .map(|c| c.retry_policy)
                .unwrap_or(RetryPolicy {
                    max_attempts: 1,
                    retry_after_minutes: Vec::new(),
                });
            let resolution: LeadResolution = self
                .planner
                .plan(&policy, lead.attempts, CallOutcome::Failed, now)
                .into();
            if self
                .leads
                .finalize_attempt(&lead, lead.status, &session_id, &failed_close(now), resolution)
                .await?
            {
                settled += 1;
            }
        }

        for attempt in self.attempts.orphaned_open(cutoff).await? {
            if let Err(e) = self.provider.hangup(&attempt.session_id).await {
                debug!("Hangup of stale session {} failed: {}", attempt.session_id, e);
            }
            if self.attempts.close(&attempt.session_id, &failed_close(now)).await? {
                settled += 1;
            }
        }

        self.instances.forget_expired(cutoff).await?;
        if settled > 0 {
            info!("✅ Settled {} orphaned calls", settled);
        }
        Ok(settled)
    }

    /// Renew the lease and reap expired peers every `interval` until
    /// `cancel` fires
    pub async fn run(self, interval: std::time::Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let now = Utc::now();
                    if let Err(e) = self.heartbeat(now).await {
                        warn!("Heartbeat for instance {} failed: {}", self.instance, e);
                        continue;
                    }
                    if let Err(e) = self.reap(now).await {
                        warn!("Orphan recovery failed: {}", e);
                    }
                }
            }
        }
        debug!("Heartbeat loop for instance {} stopped", self.instance);
    }
}

fn failed_close(now: DateTime<Utc>) -> AttemptClose {
    AttemptClose {
        status: ProviderCallStatus::Failed,
        outcome: CallOutcome::Failed,
        ended_at: now,
        duration_seconds: None,
        sentiment: None,
    }
}
