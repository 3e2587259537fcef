//! JSON REST routes over the admin and supervisor APIs.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::error;

use super::admin::{AdminApi, ImportLeadsRequest, ManualCallRequest, RunStateRequest};
use super::supervisor::SupervisorApi;
use crate::campaign::{Campaign, CampaignId, NewCampaign};
use crate::engine::CampaignEngine;
use crate::error::EngineError;
use crate::lead::Lead;
use crate::stats::CampaignStats;
use crate::telephony::{CallSessionId, ProviderEvent};
use crate::tracker::{ActiveCallInfo, RouteOutcome};

type ApiResult<T> = std::result::Result<T, EngineError>;

/// Shared handler state
#[derive(Clone)]
pub struct ApiState {
    pub admin: AdminApi,
    pub supervisor: SupervisorApi,
    pub service_name: String,
}

impl ApiState {
    pub fn new(engine: Arc<CampaignEngine>) -> Self {
        Self {
            service_name: engine.config().general.service_name.clone(),
            admin: AdminApi::new(Arc::clone(&engine)),
            supervisor: SupervisorApi::new(engine),
        }
    }
}

impl IntoResponse for EngineError {
    fn into_response(self) -> Response {
        let status = match &self {
            EngineError::Configuration(_) | EngineError::InvalidInput(_) => StatusCode::UNPROCESSABLE_ENTITY,
            EngineError::InvalidTransition(_) | EngineError::CapacityExhausted(_) => StatusCode::CONFLICT,
            EngineError::NotFound(_) => StatusCode::NOT_FOUND,
            EngineError::Provider(_) => StatusCode::BAD_GATEWAY,
            EngineError::Database(_) | EngineError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!("Request failed: {}", self);
        }
        let body = json!({ "error": self.to_string(), "code": self.code() });
        (status, Json(body)).into_response()
    }
}

#[derive(Debug, Deserialize)]
struct LeadQuery {
    limit: Option<u32>,
}

#[derive(Debug, Serialize)]
struct SessionResponse {
    session_id: CallSessionId,
}

#[derive(Debug, Serialize)]
struct ImportResponse {
    imported: usize,
    leads: Vec<Lead>,
}

/// Build the API router
pub fn router(engine: Arc<CampaignEngine>) -> Router {
    router_with_state(ApiState::new(engine))
}

pub fn router_with_state(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/campaigns", post(create_campaign).get(list_campaigns))
        .route("/campaigns/:id", get(get_campaign).put(update_campaign))
        .route("/campaigns/:id/run-state", put(set_run_state))
        .route("/campaigns/:id/leads", post(import_leads).get(list_leads))
        .route("/campaigns/:id/stats", get(campaign_stats))
        .route("/campaigns/:id/active-calls", get(active_calls))
        .route("/campaigns/:id/test-call", post(test_call))
        .route("/calls/manual", post(manual_call))
        .route("/calls/:session_id/hangup", post(hangup))
        .route("/provider/events", post(provider_event))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health(State(state): State<ApiState>) -> Json<serde_json::Value> {
    Json(json!({ "status": "ok", "service": state.service_name }))
}

async fn create_campaign(
    State(state): State<ApiState>,
    Json(definition): Json<NewCampaign>,
) -> ApiResult<(StatusCode, Json<Campaign>)> {
    let campaign = state.admin.create_campaign(definition).await?;
    Ok((StatusCode::CREATED, Json(campaign)))
}

async fn list_campaigns(State(state): State<ApiState>) -> ApiResult<Json<Vec<Campaign>>> {
    Ok(Json(state.supervisor.list_campaigns().await?))
}

async fn get_campaign(State(state): State<ApiState>, Path(id): Path<String>) -> ApiResult<Json<Campaign>> {
    Ok(Json(state.supervisor.get_campaign(&CampaignId::from(id)).await?))
}

async fn update_campaign(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(definition): Json<NewCampaign>,
) -> ApiResult<Json<Campaign>> {
    Ok(Json(
        state
            .admin
            .update_campaign(&CampaignId::from(id), definition)
            .await?,
    ))
}

async fn set_run_state(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(request): Json<RunStateRequest>,
) -> ApiResult<Json<Campaign>> {
    Ok(Json(
        state
            .admin
            .set_run_state(&CampaignId::from(id), request.run_state)
            .await?,
    ))
}

async fn import_leads(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(request): Json<ImportLeadsRequest>,
) -> ApiResult<(StatusCode, Json<ImportResponse>)> {
    let leads = state.admin.import_leads(&CampaignId::from(id), request).await?;
    Ok((
        StatusCode::CREATED,
        Json(ImportResponse {
            imported: leads.len(),
            leads,
        }),
    ))
}

async fn list_leads(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Query(query): Query<LeadQuery>,
) -> ApiResult<Json<Vec<Lead>>> {
    Ok(Json(
        state
            .supervisor
            .list_leads(&CampaignId::from(id), query.limit)
            .await?,
    ))
}

async fn campaign_stats(State(state): State<ApiState>, Path(id): Path<String>) -> ApiResult<Json<CampaignStats>> {
    Ok(Json(state.supervisor.campaign_stats(&CampaignId::from(id)).await?))
}

async fn active_calls(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Vec<ActiveCallInfo>>> {
    Ok(Json(state.supervisor.active_calls(&CampaignId::from(id)).await?))
}

async fn test_call(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> ApiResult<(StatusCode, Json<SessionResponse>)> {
    let session_id = state.admin.test_call(&CampaignId::from(id)).await?;
    Ok((StatusCode::ACCEPTED, Json(SessionResponse { session_id })))
}

async fn manual_call(
    State(state): State<ApiState>,
    Json(request): Json<ManualCallRequest>,
) -> ApiResult<(StatusCode, Json<SessionResponse>)> {
    let session_id = state.admin.manual_call(&request).await?;
    Ok((StatusCode::ACCEPTED, Json(SessionResponse { session_id })))
}

async fn hangup(State(state): State<ApiState>, Path(session_id): Path<String>) -> ApiResult<StatusCode> {
    state.admin.hangup(&CallSessionId::from(session_id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn provider_event(State(state): State<ApiState>, Json(event): Json<ProviderEvent>) -> StatusCode {
    match state.admin.provider_event(event) {
        RouteOutcome::Delivered | RouteOutcome::Buffered => StatusCode::ACCEPTED,
    }
}
