use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};

use crate::errors::{MergeError, SessionError};

use super::activity::HookEvent;
use super::github::PrStatusReport;
use super::manager::{CreateSessionRequest, SessionManager};
use super::models::{AccessMode, AgentActivity, MergeMethod};

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub manager: Arc<SessionManager>,
}

pub type SharedState = Arc<AppState>;

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
pub struct AccessModeRequest {
    pub mode: AccessMode,
}

#[derive(Deserialize, Default)]
pub struct MergeRequest {
    #[serde(default)]
    pub method: Option<MergeMethod>,
    #[serde(default)]
    pub delete_branch: Option<bool>,
}

#[derive(Deserialize, Default)]
pub struct PublishRequest {
    #[serde(default)]
    pub message: Option<String>,
}

/// Either a direct activity value or a raw agent hook event.
#[derive(Deserialize)]
pub struct ActivityRequest {
    #[serde(default)]
    pub activity: Option<AgentActivity>,
    #[serde(default)]
    pub event: Option<HookEvent>,
}

#[derive(Serialize)]
pub struct CreateSessionResponse {
    pub id: String,
    pub warnings: Vec<String>,
}

// ── Error handling ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    BadGateway(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::BadGateway(msg) => (StatusCode::BAD_GATEWAY, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

impl From<SessionError> for ApiError {
    fn from(err: SessionError) -> Self {
        let message = err.to_string();
        match err {
            SessionError::NotFound { .. } => ApiError::NotFound(message),
            SessionError::InvalidTransition { .. }
            | SessionError::NotAttachable { .. }
            | SessionError::NotDeletable { .. }
            | SessionError::NotActive { .. }
            | SessionError::VersionConflict { .. }
            | SessionError::Merge(MergeError::NotMergeable { .. })
            | SessionError::Merge(MergeError::MergeConflict(_)) => ApiError::Conflict(message),
            SessionError::InvalidRequest(_)
            | SessionError::Merge(MergeError::MethodNotAllowed { .. }) => ApiError::BadRequest(message),
            SessionError::Merge(MergeError::RemoteError(_)) => ApiError::BadGateway(message),
            other => {
                tracing::error!(error = %other, "request failed");
                ApiError::Internal(message)
            }
        }
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/sessions", get(list_sessions).post(create_session))
        .route("/api/sessions/{id}", get(get_session).delete(delete_session))
        .route("/api/sessions/{id}/archive", post(archive_session))
        .route("/api/sessions/{id}/recreate", post(recreate_session))
        .route("/api/sessions/{id}/access-mode", post(update_access_mode))
        .route("/api/sessions/{id}/merge", post(merge_session))
        .route("/api/sessions/{id}/publish", post(publish_session))
        .route("/api/sessions/{id}/pr-status", post(report_pr_status))
        .route("/api/sessions/{id}/activity", post(report_activity))
        .route("/health", get(health_check))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn list_sessions(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.manager.list_sessions().await?))
}

async fn create_session(
    State(state): State<SharedState>,
    Json(req): Json<CreateSessionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let created = state.manager.create_session(req).await?;
    Ok((
        StatusCode::CREATED,
        Json(CreateSessionResponse {
            id: created.session.id,
            warnings: created.warnings,
        }),
    ))
}

async fn get_session(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.manager.get_session(&id).await?))
}

async fn delete_session(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.manager.delete_session(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn archive_session(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.manager.archive_session(&id).await?))
}

async fn recreate_session(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.manager.recreate_session(&id).await?))
}

async fn update_access_mode(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(req): Json<AccessModeRequest>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.manager.update_access_mode(&id, req.mode).await?))
}

async fn merge_session(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(req): Json<MergeRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let session = state
        .manager
        .merge(&id, req.method, req.delete_branch)
        .await?;
    Ok(Json(session))
}

async fn publish_session(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(req): Json<PublishRequest>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.manager.publish(&id, req.message).await?))
}

async fn report_pr_status(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(report): Json<PrStatusReport>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.manager.record_pr_status(&id, &report).await?))
}

async fn report_activity(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(req): Json<ActivityRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let activity = match (req.activity, req.event) {
        (Some(activity), _) => activity,
        (None, Some(event)) => event.activity(),
        (None, None) => {
            return Err(ApiError::BadRequest(
                "expected an 'activity' or 'event' field".to_string(),
            ));
        }
    };
    Ok(Json(state.manager.report_activity(&id, activity).await?))
}

// ── Tests ─────────────────────────────────────────────────────────────
