use std::str::FromStr;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, patch, post},
};
use serde::Deserialize;
use tokio::sync::broadcast;

use crate::engine::manager::CampaignManager;
use crate::engine::models::{
    CallOutcome, CampaignStatus, CreateCampaignRequest, UpdateCampaignRequest,
};
use crate::errors::EngineError;

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub manager: CampaignManager,
    pub events_tx: broadcast::Sender<String>,
}

pub type SharedState = Arc<AppState>;

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
pub struct ListQuery {
    pub status: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

/// Outcome webhook body from the telephony layer. Delivered at-least-once;
/// duplicates are absorbed downstream.
#[derive(Deserialize)]
pub struct OutcomeReport {
    pub placement_id: String,
    pub outcome: CallOutcome,
    #[serde(default)]
    pub duration_secs: u64,
    pub recording_url: Option<String>,
    pub transcript_id: Option<String>,
}

// ── Error handling ────────────────────────────────────────────────────

pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Validation(_) => ApiError::BadRequest(err.to_string()),
            EngineError::NotFound { .. } => ApiError::NotFound(err.to_string()),
            EngineError::InvalidState { .. } | EngineError::Conflict(_) => {
                ApiError::Conflict(err.to_string())
            }
            EngineError::Storage(e) => ApiError::Internal(e.to_string()),
        }
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/campaigns", get(list_campaigns).post(create_campaign))
        .route("/api/campaigns/{id}", get(get_campaign).patch(update_campaign).delete(delete_campaign))
        .route("/api/campaigns/{id}/start", post(start_campaign))
        .route("/api/campaigns/{id}/pause", post(pause_campaign))
        .route("/api/campaigns/{id}/resume", post(resume_campaign))
        .route("/api/campaigns/{id}/cancel", post(cancel_campaign))
        .route("/api/campaigns/{id}/stats", get(get_campaign_stats))
        .route("/api/campaigns/{id}/calls", get(get_campaign_calls))
        .route("/api/outcomes", post(report_outcome))
        .route("/health", get(health_check))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn create_campaign(
    State(state): State<SharedState>,
    Json(request): Json<CreateCampaignRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let campaign = state.manager.create(request).await?;
    Ok((StatusCode::CREATED, Json(campaign)))
}

async fn list_campaigns(
    State(state): State<SharedState>,
    Query(query): Query<ListQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let status = match query.status.as_deref() {
        Some(raw) => Some(
            CampaignStatus::from_str(raw)
                .map_err(|_| ApiError::BadRequest(format!("Invalid status: {}", raw)))?,
        ),
        None => None,
    };
    let limit = query.limit.unwrap_or(50).min(100);
    let offset = query.offset.unwrap_or(0);
    let campaigns = state.manager.list(status, limit, offset);
    Ok(Json(serde_json::json!({
        "count": campaigns.len(),
        "campaigns": campaigns,
    })))
}

async fn get_campaign(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let campaign = state.manager.get_snapshot(&id)?;
    Ok(Json(campaign))
}

async fn update_campaign(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(request): Json<UpdateCampaignRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let campaign = state.manager.update(&id, request).await?;
    Ok(Json(campaign))
}

async fn delete_campaign(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.manager.delete(&id).await?;
    Ok(Json(serde_json::json!({"deleted": id})))
}

async fn start_campaign(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let campaign = state.manager.start(&id).await?;
    Ok(Json(campaign))
}

async fn pause_campaign(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let campaign = state.manager.pause(&id).await?;
    Ok(Json(campaign))
}

async fn resume_campaign(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let campaign = state.manager.resume(&id).await?;
    Ok(Json(campaign))
}

async fn cancel_campaign(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let campaign = state.manager.cancel(&id).await?;
    Ok(Json(campaign))
}

async fn get_campaign_stats(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let stats = state.manager.stats(&id)?;
    Ok(Json(stats))
}

async fn get_campaign_calls(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let records = state.manager.call_records(&id).await?;
    Ok(Json(serde_json::json!({
        "count": records.len(),
        "calls": records,
    })))
}

/// Provider outcome webhook. Always 202: unknown or duplicate handles are
/// absorbed, never errors, so the provider has no reason to retry forever.
async fn report_outcome(
    State(state): State<SharedState>,
    Json(report): Json<OutcomeReport>,
) -> impl IntoResponse {
    state.manager.apply_outcome(
        &report.placement_id,
        report.outcome,
        report.duration_secs,
        report.recording_url,
        report.transcript_id,
    );
    StatusCode::ACCEPTED
}
