//! JSON-over-HTTP telephony provider.
//!
//! `POST {base}/calls` originates, `GET {base}/calls/{id}` reads status and
//! `POST {base}/calls/{id}/hangup` terminates. Status changes are expected
//! to arrive on the engine's `/provider/events` webhook.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{CallSessionId, OriginateRequest, ProviderCallStatus, ProviderEvent, TelephonyProvider};
use crate::campaign::CampaignId;
use crate::config::ProviderConfig;
use crate::error::{EngineError, Result};
use crate::lead::LeadId;

#[derive(Debug, Serialize)]
struct OriginateBody<'a> {
    caller_id: &'a str,
    callee_number: &'a str,
    assistant_id: &'a str,
    metadata: CallMetadata<'a>,
}

#[derive(Debug, Serialize)]
struct CallMetadata<'a> {
    campaign_id: Option<&'a CampaignId>,
    lead_id: Option<&'a LeadId>,
}

#[derive(Debug, Deserialize)]
struct OriginateResponse {
    session_id: String,
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    status: ProviderCallStatus,
    #[serde(default)]
    duration_seconds: Option<u32>,
    #[serde(default)]
    sentiment: Option<f64>,
}

#[derive(Clone)]
pub struct HttpTelephonyProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpTelephonyProvider {
    pub fn new(config: &ProviderConfig) -> Result<Self> {
        let base_url = config
            .base_url
            .as_deref()
            .ok_or_else(|| EngineError::configuration("provider base_url is required"))?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()
            .map_err(|e| EngineError::configuration(format!("http client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
        })
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }
}

fn provider_error(context: &str, err: reqwest::Error) -> EngineError {
    EngineError::provider(format!("{}: {}", context, err))
}

#[async_trait]
impl TelephonyProvider for HttpTelephonyProvider {
    fn name(&self) -> &str {
        "http"
    }

    async fn originate(&self, request: OriginateRequest) -> Result<CallSessionId> {
        let body = OriginateBody {
            caller_id: &request.caller_id,
            callee_number: &request.callee_number,
            assistant_id: &request.assistant_id,
            metadata: CallMetadata {
                campaign_id: request.campaign_id.as_ref(),
                lead_id: request.lead_id.as_ref(),
            },
        };

        let response = self
            .authorize(self.client.post(format!("{}/calls", self.base_url)))
            .json(&body)
            .send()
            .await
            .map_err(|e| provider_error("originate", e))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(EngineError::provider(format!(
                "originate rejected with {}: {}",
                status, detail
            )));
        }

        let created: OriginateResponse = response
            .json()
            .await
            .map_err(|e| provider_error("originate response", e))?;
        debug!("HTTP provider originated {}", created.session_id);
        Ok(CallSessionId(created.session_id))
    }

    async fn status(&self, session_id: &CallSessionId) -> Result<Option<ProviderEvent>> {
        let response = self
            .authorize(
                self.client
                    .get(format!("{}/calls/{}", self.base_url, session_id)),
            )
            .send()
            .await
            .map_err(|e| provider_error("status", e))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = response
            .error_for_status()
            .map_err(|e| provider_error("status", e))?;

        let body: StatusResponse = response
            .json()
            .await
            .map_err(|e| provider_error("status response", e))?;

        Ok(Some(ProviderEvent {
            session_id: session_id.clone(),
            status: body.status,
            duration_seconds: body.duration_seconds,
            sentiment: body.sentiment,
            occurred_at: Utc::now(),
        }))
    }

    async fn hangup(&self, session_id: &CallSessionId) -> Result<()> {
        let response = self
            .authorize(
                self.client
                    .post(format!("{}/calls/{}/hangup", self.base_url, session_id)),
            )
            .send()
            .await
            .map_err(|e| provider_error("hangup", e))?;

        if !response.status().is_success() {
            warn!("Hangup of {} returned {}", session_id, response.status());
            return Err(EngineError::provider(format!(
                "hangup of {} returned {}",
                session_id,
                response.status()
            )));
        }
        Ok(())
    }
}
