//! Supervisor API for campaign oversight
//!
//! Read-only views dashboards poll: campaigns, leads, live calls and
//! per-campaign counters.

use std::sync::Arc;

use tokio::sync::broadcast;

use crate::campaign::{Campaign, CampaignId};
use crate::engine::CampaignEngine;
use crate::error::Result;
use crate::events::EngineEvent;
use crate::lead::Lead;
use crate::stats::CampaignStats;
use crate::tracker::ActiveCallInfo;

/// Default page size for lead listings
pub const DEFAULT_LEAD_LIMIT: u32 = 100;

#[derive(Clone)]
pub struct SupervisorApi {
    engine: Arc<CampaignEngine>,
}

impl SupervisorApi {
    pub fn new(engine: Arc<CampaignEngine>) -> Self {
        Self { engine }
    }

    pub async fn get_campaign(&self, campaign_id: &CampaignId) -> Result<Campaign> {
        self.engine.get_campaign(campaign_id).await
    }

    pub async fn list_campaigns(&self) -> Result<Vec<Campaign>> {
        self.engine.list_campaigns().await
    }

    /// Counters by status bucket; buckets always sum to `total_leads`
    pub async fn campaign_stats(&self, campaign_id: &CampaignId) -> Result<CampaignStats> {
        self.engine.get_campaign_stats(campaign_id).await
    }

    /// Leads in dial order
    pub async fn list_leads(&self, campaign_id: &CampaignId, limit: Option<u32>) -> Result<Vec<Lead>> {
        self.engine
            .list_leads(campaign_id, limit.unwrap_or(DEFAULT_LEAD_LIMIT))
            .await
    }

    /// Live calls of one campaign
    pub async fn active_calls(&self, campaign_id: &CampaignId) -> Result<Vec<ActiveCallInfo>> {
        self.engine.get_campaign(campaign_id).await?;
        Ok(self.engine.get_active_calls(Some(campaign_id)))
    }

    /// Every live call, including test and manual calls
    pub fn all_active_calls(&self) -> Vec<ActiveCallInfo> {
        self.engine.get_active_calls(None)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.engine.subscribe()
    }
}
