use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::db;
use crate::error::AppError;
use crate::models::{ChatMessage, Tier, TerminationReason};
use crate::orchestrator::StartSessionRequest;
use crate::session::SessionId;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct UploadDto {
    pub paper_id: String,
    pub text: String,
}

/// Body for `POST /api/research/sessions`.
#[derive(Debug, Deserialize)]
pub struct StartSessionRequestDto {
    pub user_id: String,
    pub tier: String,
    #[serde(default)]
    pub arxiv_ids: Vec<String>,
    #[serde(default)]
    pub uploads: Vec<UploadDto>,
}

#[derive(Debug, Serialize)]
pub struct StartSessionResponse {
    pub session_id: String,
    pub cache_name: String,
    pub cache_expires_at: chrono::DateTime<chrono::Utc>,
}

/// `POST /api/research/sessions` — the Orchestrator's HTTP entry point.
pub async fn start_session(
    State(state): State<AppState>,
    Json(req): Json<StartSessionRequestDto>,
) -> Result<Json<StartSessionResponse>, AppError> {
    let tier: Tier = req.tier.parse().map_err(AppError::BadInput)?;

    let uploads = req
        .uploads
        .into_iter()
        .map(|u| (u.paper_id, u.text.into_bytes()))
        .collect();

    let result = state
        .orchestrator
        .start_session(StartSessionRequest {
            user_id: req.user_id,
            tier,
            arxiv_ids: req.arxiv_ids,
            uploads,
        })
        .await?;

    Ok(Json(StartSessionResponse {
        session_id: result.session_id.to_string(),
        cache_name: result.cache_name,
        cache_expires_at: result.cache_expires_at,
    }))
}

/// `DELETE /api/research/sessions/:id` — HTTP-level terminate, for clients
/// that are between WebSocket connections.
pub async fn terminate_session(State(state): State<AppState>, Path(id): Path<String>) -> Result<StatusCode, AppError> {
    let session_id: SessionId = id.parse().map_err(|_| AppError::BadInput("invalid session id".to_string()))?;
    state.session_manager.terminate(session_id, TerminationReason::UserInitiated).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `GET /api/research/sessions/:id/messages` — read-only chat history, so
/// a client reconnecting after a dropped WebSocket can rehydrate turns
/// before resuming.
pub async fn list_messages(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<Vec<ChatMessage>>, AppError> {
    let messages = db::list_messages(&state.db, &id).await?;
    Ok(Json(messages))
}

/// Body for `POST /api/internal/topup`.
#[derive(Debug, Deserialize)]
pub struct TopupRequestDto {
    pub user_id: String,
    pub tier: String,
    pub delta_hours: f64,
}

/// `POST /api/internal/topup` — the boundary a payment webhook handler
/// (out of scope, §1) calls into once a purchase clears. Applies the
/// token-hour credit and publishes to `credit_update_<user-id>` so any
/// connected session's write/tick loop forwards it immediately instead of
/// waiting for the next `session_status` tick.
pub async fn topup(
    State(state): State<AppState>,
    Json(req): Json<TopupRequestDto>,
) -> Result<Json<crate::models::TierBudget>, AppError> {
    let tier: Tier = req.tier.parse().map_err(AppError::BadInput)?;
    let budget = state.cache_manager.topup(&req.user_id, tier, req.delta_hours).await?;

    let payload = json!({
        "tier": tier.as_str(),
        "tokenHoursBought": budget.token_hours_bought,
        "tokenHoursUsed": budget.token_hours_used,
    })
    .to_string();
    state.broker.publish(&format!("credit_update_{}", req.user_id), payload).await;

    Ok(Json(budget))
}

/// `GET /health` — extended beyond a bare liveness ping with the count of
/// live sessions, giving operators the same "is everything up" signal the
/// structured startup log gives at boot.
pub async fn health_check(State(state): State<AppState>) -> Json<serde_json::Value> {
    let live_sessions = state.session_manager.live_count().await;
    Json(json!({
        "status": "ok",
        "service": "research_session_backend",
        "live_sessions": live_sessions,
    }))
}

