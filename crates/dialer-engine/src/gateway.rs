//! Out-of-band single calls: campaign test calls and manual calls.
//!
//! Both bypass campaign pacing and never touch leads, but they share the
//! account-wide concurrency ceiling with scheduled dialing and are refused
//! immediately when it is reached.

use std::sync::Arc;

use tracing::info;

use crate::campaign::CampaignId;
use crate::config::GatewayConfig;
use crate::database::CampaignStore;
use crate::error::{EngineError, Result};
use crate::lead::validate_contact_number;
use crate::scheduler::budget::ConcurrencyBudget;
use crate::telephony::{CallSessionId, OriginateRequest};
use crate::tracker::{AttemptKind, CallLifecycleTracker};

#[derive(Clone)]
pub struct CallGateway {
    campaigns: CampaignStore,
    tracker: Arc<CallLifecycleTracker>,
    account: Arc<ConcurrencyBudget>,
    config: GatewayConfig,
}

impl CallGateway {
    pub fn new(
        campaigns: CampaignStore,
        tracker: Arc<CallLifecycleTracker>,
        account: Arc<ConcurrencyBudget>,
        config: GatewayConfig,
    ) -> Self {
        Self {
            campaigns,
            tracker,
            account,
            config,
        }
    }

    /// Call the campaign's test number with its caller id and assistant
    pub async fn test_call(&self, campaign_id: &CampaignId) -> Result<CallSessionId> {
        let campaign = self.campaigns.require(campaign_id).await?;

        let callee = campaign
            .test_number
            .clone()
            .ok_or_else(|| EngineError::invalid_input(format!("campaign {} has no test_number", campaign_id)))?;
        let caller_id = campaign
            .caller_id
            .clone()
            .ok_or_else(|| EngineError::configuration(format!("campaign {} has no caller_id", campaign_id)))?;
        let assistant_id = campaign
            .assistant_id
            .clone()
            .ok_or_else(|| EngineError::configuration(format!("campaign {} has no assistant_id", campaign_id)))?;

        let request = OriginateRequest {
            caller_id,
            callee_number: callee,
            assistant_id,
            campaign_id: Some(campaign.id.clone()),
            lead_id: None,
        };

        info!("🧪 Test call requested for campaign {}", campaign_id);
        self.place(AttemptKind::Test, request).await
    }

    /// Call `phone_number` with `assistant_id` from the default caller id
    pub async fn manual_call(&self, assistant_id: &str, phone_number: &str) -> Result<CallSessionId> {
        if assistant_id.trim().is_empty() {
            return Err(EngineError::invalid_input("assistant_id cannot be empty"));
        }
        let callee = validate_contact_number(phone_number)?;
        let caller_id = self
            .config
            .default_caller_id
            .clone()
            .ok_or_else(|| EngineError::configuration("gateway.default_caller_id is not set"))?;

        let request = OriginateRequest {
            caller_id,
            callee_number: callee,
            assistant_id: assistant_id.to_string(),
            campaign_id: None,
            lead_id: None,
        };

        self.place(AttemptKind::Manual, request).await
    }

    async fn place(&self, kind: AttemptKind, request: OriginateRequest) -> Result<CallSessionId> {
        let slot = self.account.try_acquire().ok_or_else(|| {
            EngineError::capacity_exhausted(format!(
                "account ceiling of {} concurrent calls reached",
                self.account.limit()
            ))
        })?;
        self.tracker.begin_adhoc_attempt(kind, request, slot).await
    }
}
