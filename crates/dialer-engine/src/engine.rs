//! # Campaign Engine
//!
//! [`CampaignEngine`] wires the stores, policy evaluator, retry planner,
//! lifecycle tracker, gateway and stats together and exposes the operator
//! commands and read API used by dashboards.
//!
//! A running campaign owns one dial loop task. Loops are spawned by
//! [`CampaignEngine::start`] (for campaigns already running in the store)
//! and by run-state changes made after start. Pausing or stopping cancels
//! the loop only; calls already in flight finish on their own.
//!
//! Several engines may share one database. Each registers an instance
//! lease on construction and, once started, renews it and settles calls
//! left behind by instances whose lease expired (see [`crate::recovery`]).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::campaign::{Campaign, CampaignId, NewCampaign, RunState};
use crate::config::EngineConfig;
use crate::database::{AttemptStore, CampaignStore, EngineDatabase, InstanceId, InstanceStore, LeadStore};
use crate::error::{EngineError, Result};
use crate::events::{EngineEvent, EventBus};
use crate::gateway::CallGateway;
use crate::lead::{Lead, NewLead};
use crate::policy::PolicyEvaluator;
use crate::recovery::OrphanReaper;
use crate::retry::RetryPlanner;
use crate::scheduler::budget::ConcurrencyBudget;
use crate::scheduler::{DialScheduler, SchedulerContext};
use crate::stats::{CampaignStats, StatsAggregator};
use crate::telephony::{CallSessionId, ProviderEvent, ProviderEventSink, TelephonyProvider};
use crate::tracker::{ActiveCallInfo, CallLifecycleTracker, RouteOutcome};

struct CampaignLoop {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct CampaignEngine {
    config: EngineConfig,
    database: EngineDatabase,
    campaigns: CampaignStore,
    leads: LeadStore,
    attempts: AttemptStore,
    stats: Arc<StatsAggregator>,
    events: EventBus,
    provider: Arc<dyn TelephonyProvider>,
    tracker: Arc<CallLifecycleTracker>,
    gateway: CallGateway,
    scheduler_ctx: SchedulerContext,
    reaper: OrphanReaper,
    account: Arc<ConcurrencyBudget>,
    budgets: DashMap<CampaignId, Arc<ConcurrencyBudget>>,
    loops: DashMap<CampaignId, CampaignLoop>,
    started: AtomicBool,
    shutdown: CancellationToken,
    event_router: Mutex<Option<JoinHandle<()>>>,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
}

impl CampaignEngine {
    /// Open the configured database and build an engine on top of it
    pub async fn new(config: EngineConfig, provider: Arc<dyn TelephonyProvider>) -> Result<Self> {
        info!("🚀 Creating CampaignEngine ({})", config.general.service_name);
        let database = EngineDatabase::connect(&config.database).await?;
        Self::with_database(config, database, provider).await
    }

    /// Build an engine on an already opened database
    pub async fn with_database(
        config: EngineConfig,
        database: EngineDatabase,
        provider: Arc<dyn TelephonyProvider>,
    ) -> Result<Self> {
        config.validate().map_err(EngineError::configuration)?;
        database.initialize_schema().await?;

        let pool = database.pool().clone();
        let events = EventBus::new(config.monitoring.event_channel_capacity);
        let stats = Arc::new(StatsAggregator::new(pool.clone()));
        let campaigns = CampaignStore::new(pool.clone());
        let instance = InstanceId::new();
        let instances = InstanceStore::new(pool.clone());
        instances.heartbeat(&instance, Utc::now()).await?;
        let leads = LeadStore::new(pool.clone(), Arc::clone(&stats), events.clone(), instance.clone());
        let attempts = AttemptStore::new(pool);
        let planner = RetryPlanner::new(config.retry.delay_mode);
        let account = Arc::new(ConcurrencyBudget::new(
            "account",
            config.general.account_max_concurrent,
        ));

        let tracker = Arc::new(CallLifecycleTracker::new(
            Arc::clone(&provider),
            leads.clone(),
            campaigns.clone(),
            attempts.clone(),
            Arc::clone(&stats),
            events.clone(),
            planner,
            config.tracker.clone(),
        ));

        let gateway = CallGateway::new(
            campaigns.clone(),
            Arc::clone(&tracker),
            Arc::clone(&account),
            config.gateway.clone(),
        );

        let scheduler_ctx = SchedulerContext {
            campaigns: campaigns.clone(),
            leads: leads.clone(),
            policy: PolicyEvaluator::new(),
            planner,
            tracker: Arc::clone(&tracker),
            account: Arc::clone(&account),
            events: events.clone(),
            config: config.scheduler.clone(),
        };

        let reaper = OrphanReaper::new(
            instance,
            instances,
            campaigns.clone(),
            leads.clone(),
            attempts.clone(),
            Arc::clone(&provider),
            planner,
            config.general.instance_lease(),
        );

        info!(
            "✅ CampaignEngine ready with provider '{}' as instance {}",
            provider.name(),
            reaper.instance()
        );

        Ok(Self {
            config,
            database,
            campaigns,
            leads,
            attempts,
            stats,
            events,
            provider,
            tracker,
            gateway,
            scheduler_ctx,
            reaper,
            account,
            budgets: DashMap::new(),
            loops: DashMap::new(),
            started: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            event_router: Mutex::new(None),
            heartbeat: Mutex::new(None),
        })
    }

    /// Settle calls left behind by expired instances, start renewing this
    /// instance's lease, route provider events and resume the dial loops of
    /// running campaigns.
    pub async fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let now = Utc::now();
        self.reaper.heartbeat(now).await?;
        self.reaper.reap(now).await?;
        let heartbeat = tokio::spawn(
            self.reaper
                .clone()
                .run(self.config.general.heartbeat_interval(), self.shutdown.child_token()),
        );
        *self.heartbeat.lock() = Some(heartbeat);

        for campaign in self.campaigns.list().await? {
            self.stats.rebuild(&campaign.id).await?;
        }

        let (sink, mut receiver) = ProviderEventSink::channel();
        self.provider.attach_event_sink(sink);
        let tracker = Arc::clone(&self.tracker);
        let shutdown = self.shutdown.clone();
        let router = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    event = receiver.recv() => match event {
                        Some(event) => {
                            tracker.route_event(event);
                        }
                        None => break,
                    },
                }
            }
            debug!("Provider event router stopped");
        });
        *self.event_router.lock() = Some(router);

        let running = self.campaigns.list_in_state(RunState::Running).await?;
        for campaign in &running {
            self.spawn_loop(campaign);
        }

        info!("✅ CampaignEngine started, {} campaigns running", running.len());
        Ok(())
    }

    /// Stop every dial loop, the event router and the lease heartbeat.
    /// Calls in flight keep running until the process exits; once the
    /// lease lapses a peer engine settles them.
    pub async fn shutdown(&self) {
        info!("🛑 Shutting down CampaignEngine");
        self.shutdown.cancel();

        let ids: Vec<CampaignId> = self.loops.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.stop_loop(&id).await;
        }

        let router = self.event_router.lock().take();
        if let Some(router) = router {
            let _ = router.await;
        }
        let heartbeat = self.heartbeat.lock().take();
        if let Some(heartbeat) = heartbeat {
            let _ = heartbeat.await;
        }
        self.started.store(false, Ordering::SeqCst);
    }

    fn budget_for(&self, campaign: &Campaign) -> Arc<ConcurrencyBudget> {
        self.budgets
            .entry(campaign.id.clone())
            .or_insert_with(|| {
                Arc::new(ConcurrencyBudget::new(
                    format!("campaign-{}", campaign.id),
                    campaign.pacing.max_concurrent,
                ))
            })
            .clone()
    }

    fn spawn_loop(&self, campaign: &Campaign) {
        if let Some(existing) = self.loops.get(&campaign.id) {
            if !existing.handle.is_finished() {
                return;
            }
        }

        let scheduler = Arc::new(DialScheduler::new(
            campaign,
            self.scheduler_ctx.clone(),
            self.budget_for(campaign),
        ));
        let cancel = self.shutdown.child_token();
        let handle = tokio::spawn(scheduler.run(cancel.clone()));
        self.loops
            .insert(campaign.id.clone(), CampaignLoop { cancel, handle });
    }

    async fn stop_loop(&self, campaign_id: &CampaignId) {
        if let Some((_, campaign_loop)) = self.loops.remove(campaign_id) {
            campaign_loop.cancel.cancel();
            if let Err(e) = campaign_loop.handle.await {
                error!("Dial loop for campaign {} panicked: {}", campaign_id, e);
            }
        }
    }

    /// Whether a dial loop is currently running for the campaign
    pub fn is_dialing(&self, campaign_id: &CampaignId) -> bool {
        self.loops
            .get(campaign_id)
            .map(|l| !l.handle.is_finished())
            .unwrap_or(false)
    }

    /// A scheduler for driving a campaign by hand, sharing the campaign's
    /// concurrency budget with its loop.
    pub async fn dial_scheduler(&self, campaign_id: &CampaignId) -> Result<Arc<DialScheduler>> {
        let campaign = self.campaigns.require(campaign_id).await?;
        Ok(Arc::new(DialScheduler::new(
            &campaign,
            self.scheduler_ctx.clone(),
            self.budget_for(&campaign),
        )))
    }

    // === Operator commands ===

    pub async fn create_campaign(&self, definition: NewCampaign) -> Result<Campaign> {
        definition.validate(self.config.general.max_concurrent_ceiling)?;
        let campaign = self.campaigns.create(definition, Utc::now()).await?;
        self.stats.install_empty(&campaign.id);
        info!("📋 Created campaign {} '{}'", campaign.id, campaign.name);
        Ok(campaign)
    }

    /// Replace a campaign's definition. Refused while it is running.
    pub async fn update_campaign(&self, campaign_id: &CampaignId, definition: NewCampaign) -> Result<Campaign> {
        definition.validate(self.config.general.max_concurrent_ceiling)?;
        let campaign = self.campaigns.update(campaign_id, definition, Utc::now()).await?;
        if let Some(budget) = self.budgets.get(campaign_id) {
            if budget.limit() != campaign.pacing.max_concurrent {
                budget.resize(campaign.pacing.max_concurrent);
            }
        }
        info!("📝 Updated campaign {}", campaign_id);
        Ok(campaign)
    }

    /// Append a batch of leads to the campaign's queue. All or nothing.
    pub async fn import_leads(
        &self,
        campaign_id: &CampaignId,
        batch_label: &str,
        leads: Vec<NewLead>,
    ) -> Result<Vec<Lead>> {
        let campaign = self.campaigns.require(campaign_id).await?;
        if campaign.run_state == RunState::Stopped {
            return Err(EngineError::invalid_transition(format!(
                "campaign {} is stopped",
                campaign_id
            )));
        }
        let imported = self.leads.import(campaign_id, batch_label, leads, Utc::now()).await?;
        info!(
            "📥 Imported {} leads into campaign {} (batch '{}')",
            imported.len(),
            campaign_id,
            batch_label
        );
        Ok(imported)
    }

    /// Operator run-state change. Setting the current state again is a no-op.
    pub async fn set_campaign_run_state(&self, campaign_id: &CampaignId, target: RunState) -> Result<Campaign> {
        let campaign = self.campaigns.require(campaign_id).await?;
        let from = campaign.run_state;
        if from == target {
            return Ok(campaign);
        }
        if !from.operator_can_transition_to(target) {
            return Err(EngineError::invalid_transition(format!(
                "campaign {} cannot go from {} to {}",
                campaign_id, from, target
            )));
        }
        if target == RunState::Running {
            campaign.validate_for_dialing(self.config.general.max_concurrent_ceiling)?;
        }

        let now = Utc::now();
        if !self.campaigns.transition(campaign_id, from, target, now).await? {
            return Err(EngineError::invalid_transition(format!(
                "campaign {} changed state concurrently",
                campaign_id
            )));
        }
        let updated = self.campaigns.require(campaign_id).await?;

        if target == RunState::Running {
            if self.started.load(Ordering::SeqCst) {
                self.spawn_loop(&updated);
            }
        } else {
            self.stop_loop(campaign_id).await;
        }

        self.events.publish(EngineEvent::CampaignStateChanged {
            campaign_id: campaign_id.clone(),
            from,
            to: target,
            at: now,
        });
        info!("🔄 Campaign {} state: {} → {}", campaign_id, from, target);
        Ok(updated)
    }

    pub async fn trigger_test_call(&self, campaign_id: &CampaignId) -> Result<CallSessionId> {
        self.gateway.test_call(campaign_id).await
    }

    pub async fn trigger_manual_call(&self, assistant_id: &str, phone_number: &str) -> Result<CallSessionId> {
        self.gateway.manual_call(assistant_id, phone_number).await
    }

    pub async fn hangup(&self, session_id: &CallSessionId) -> Result<()> {
        self.tracker.hangup(session_id).await
    }

    /// Feed a provider status notification (webhook) into the tracker
    pub fn ingest_provider_event(&self, event: ProviderEvent) -> RouteOutcome {
        self.tracker.route_event(event)
    }

    /// Settle calls owned by instances whose lease has expired. Runs on
    /// every heartbeat once the engine is started.
    pub async fn reap_orphans(&self) -> Result<usize> {
        self.reaper.reap(Utc::now()).await
    }

    // === Read API ===

    pub async fn get_campaign(&self, campaign_id: &CampaignId) -> Result<Campaign> {
        self.campaigns.require(campaign_id).await
    }

    pub async fn list_campaigns(&self) -> Result<Vec<Campaign>> {
        self.campaigns.list().await
    }

    pub async fn get_campaign_stats(&self, campaign_id: &CampaignId) -> Result<CampaignStats> {
        self.campaigns.require(campaign_id).await?;
        self.stats
            .snapshot(campaign_id, self.tracker.active_count(campaign_id))
            .await
    }

    /// Recompute a campaign's counters from a full scan
    pub async fn rebuild_stats(&self, campaign_id: &CampaignId) -> Result<CampaignStats> {
        self.campaigns.require(campaign_id).await?;
        self.stats.rebuild(campaign_id).await?;
        self.get_campaign_stats(campaign_id).await
    }

    pub async fn list_leads(&self, campaign_id: &CampaignId, limit: u32) -> Result<Vec<Lead>> {
        self.campaigns.require(campaign_id).await?;
        self.leads.list(campaign_id, limit).await
    }

    pub fn get_active_calls(&self, campaign_id: Option<&CampaignId>) -> Vec<ActiveCallInfo> {
        self.tracker.active_calls(campaign_id)
    }

    /// Stats for every running campaign, for periodic status logging
    pub async fn running_campaign_stats(&self) -> Result<Vec<CampaignStats>> {
        let mut all = Vec::new();
        for campaign in self.campaigns.list_in_state(RunState::Running).await? {
            all.push(self.get_campaign_stats(&campaign.id).await?);
        }
        Ok(all)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    // === Accessors ===

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn instance_id(&self) -> &InstanceId {
        self.reaper.instance()
    }

    pub fn database(&self) -> &EngineDatabase {
        &self.database
    }

    pub fn leads(&self) -> &LeadStore {
        &self.leads
    }

    pub fn attempts(&self) -> &AttemptStore {
        &self.attempts
    }

    pub fn tracker(&self) -> &Arc<CallLifecycleTracker> {
        &self.tracker
    }

    pub fn account_budget(&self) -> &Arc<ConcurrencyBudget> {
        &self.account
    }
}
