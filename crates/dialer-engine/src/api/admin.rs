//! Administrative API for campaign management
//!
//! This module provides the commands an operator uses to set up and run
//! campaigns, plus the out-of-band call triggers.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::campaign::{Campaign, CampaignId, NewCampaign, RunState};
use crate::engine::CampaignEngine;
use crate::error::Result;
use crate::lead::{Lead, NewLead};
use crate::telephony::{CallSessionId, ProviderEvent};
use crate::tracker::RouteOutcome;

/// Lead upload request body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportLeadsRequest {
    pub batch_label: String,
    pub leads: Vec<NewLead>,
}

/// Run-state change request body
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RunStateRequest {
    pub run_state: RunState,
}

/// Manual call request body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManualCallRequest {
    pub assistant_id: String,
    pub phone_number: String,
}

/// Administrative API for campaign management
///
/// - Campaign definition (create, update)
/// - Lead upload
/// - Run-state control
/// - Test, manual and hangup commands
#[derive(Clone)]
pub struct AdminApi {
    engine: Arc<CampaignEngine>,
}

impl AdminApi {
    /// Create a new admin API instance
    pub fn new(engine: Arc<CampaignEngine>) -> Self {
        Self { engine }
    }

    pub async fn create_campaign(&self, definition: NewCampaign) -> Result<Campaign> {
        self.engine.create_campaign(definition).await
    }

    /// Replace a campaign's definition; refused while it is running
    pub async fn update_campaign(&self, campaign_id: &CampaignId, definition: NewCampaign) -> Result<Campaign> {
        self.engine.update_campaign(campaign_id, definition).await
    }

    pub async fn import_leads(&self, campaign_id: &CampaignId, request: ImportLeadsRequest) -> Result<Vec<Lead>> {
        self.engine
            .import_leads(campaign_id, &request.batch_label, request.leads)
            .await
    }

    pub async fn set_run_state(&self, campaign_id: &CampaignId, run_state: RunState) -> Result<Campaign> {
        self.engine.set_campaign_run_state(campaign_id, run_state).await
    }

    pub async fn test_call(&self, campaign_id: &CampaignId) -> Result<CallSessionId> {
        self.engine.trigger_test_call(campaign_id).await
    }

    pub async fn manual_call(&self, request: &ManualCallRequest) -> Result<CallSessionId> {
        self.engine
            .trigger_manual_call(&request.assistant_id, &request.phone_number)
            .await
    }

    pub async fn hangup(&self, session_id: &CallSessionId) -> Result<()> {
        self.engine.hangup(session_id).await
    }

    /// Provider webhook entry point
    pub fn provider_event(&self, event: ProviderEvent) -> RouteOutcome {
        self.engine.ingest_provider_event(event)
    }
}
