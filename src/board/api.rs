use std::sync::{Arc, Mutex};

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post, put},
};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use super::auth::ExpiringStore;
use super::db::DbHandle;
use super::engine::TransitionEngine;
use super::github::{DeviceFlow, TokenPoll};
use super::models::AgentMappings;
use super::poller::{PollerHandle, PollerStatus};
use super::webhook;
use super::ws;
use crate::errors::{GitHubErrorKind, WorkflowError};

/// Settings key under which an OAuth token obtained through the device flow
/// is stored.
pub const GITHUB_TOKEN_SETTING: &str = "github_token";

const DEFAULT_TRANSITION_LIMIT: usize = 100;
const MAX_TRANSITION_LIMIT: usize = 1000;

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub engine: Arc<TransitionEngine>,
    pub poller: Arc<PollerHandle>,
    pub db: DbHandle,
    pub ws_tx: broadcast::Sender<String>,
    pub webhook_secret: Option<String>,
    pub device_flow: Option<DeviceFlow>,
    /// Pending device codes, keyed by the user code shown to the operator.
    pub device_codes: Mutex<ExpiringStore<String, String>>,
}

pub type SharedState = Arc<AppState>;

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
pub struct CreateIssueRequest {
    pub title: String,
    #[serde(default)]
    pub body: String,
}

#[derive(Deserialize)]
pub struct TransitionRequest {
    pub to_status: String,
}

#[derive(Deserialize)]
pub struct TransitionsQuery {
    pub issue: Option<u64>,
    pub limit: Option<usize>,
}

#[derive(Deserialize)]
pub struct PollTokenRequest {
    pub user_code: String,
}

#[derive(Serialize)]
struct DeviceCodeReply {
    user_code: String,
    verification_uri: String,
    expires_in: u64,
    interval: u64,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    #[serde(flatten)]
    poller: PollerStatus,
}

// ── Error type ────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Unauthorized(String),
    Unprocessable(String),
    BadGateway(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            ApiError::Unprocessable(msg) => (StatusCode::UNPROCESSABLE_ENTITY, msg),
            ApiError::BadGateway(msg) => (StatusCode::BAD_GATEWAY, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

impl From<WorkflowError> for ApiError {
    fn from(err: WorkflowError) -> Self {
        let message = err.to_string();
        match err {
            WorkflowError::Configuration { .. } => ApiError::Unprocessable(message),
            WorkflowError::UnknownStatus { .. } => ApiError::BadRequest(message),
            WorkflowError::IssueNotOnProject { .. } => ApiError::NotFound(message),
            WorkflowError::GitHub(e) if e.kind() == GitHubErrorKind::NotFound => {
                ApiError::NotFound(message)
            }
            WorkflowError::GitHub(_) => ApiError::BadGateway(message),
            WorkflowError::Storage(_) => ApiError::Internal(message),
        }
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/projects/{project_id}/pipelines", get(list_pipelines))
        .route("/api/projects/{project_id}/transitions", get(list_transitions))
        .route("/api/projects/{project_id}/issues", post(create_issue))
        .route(
            "/api/projects/{project_id}/issues/{number}/transition",
            post(transition_issue),
        )
        .route("/api/projects/{project_id}/mappings", put(set_mappings))
        .route("/api/webhooks/github", post(github_webhook))
        .route("/api/github/device-code", post(github_device_code))
        .route("/api/github/poll", post(github_poll_token))
        .route("/api/github/disconnect", post(github_disconnect))
        .route("/ws", get(ws::ws_handler))
        .route("/health", get(health_check))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check(State(state): State<SharedState>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        poller: state.poller.status().await,
    })
}

async fn list_pipelines(
    State(state): State<SharedState>,
    Path(project_id): Path<String>,
) -> impl IntoResponse {
    Json(state.engine.pipeline_statuses(&project_id).await)
}

async fn list_transitions(
    State(state): State<SharedState>,
    Path(project_id): Path<String>,
    Query(query): Query<TransitionsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_TRANSITION_LIMIT)
        .clamp(1, MAX_TRANSITION_LIMIT);
    let transitions = state
        .engine
        .transitions(&project_id, query.issue, limit)
        .await?;
    Ok(Json(transitions))
}

async fn create_issue(
    State(state): State<SharedState>,
    Path(project_id): Path<String>,
    Json(req): Json<CreateIssueRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let title = req.title.trim();
    if title.is_empty() {
        return Err(ApiError::BadRequest("Issue title must not be empty".into()));
    }
    let created = state
        .engine
        .create_issue(&project_id, title, &req.body)
        .await?;
    Ok((StatusCode::CREATED, Json(created)))
}

async fn transition_issue(
    State(state): State<SharedState>,
    Path((project_id, number)): Path<(String, u64)>,
    Json(req): Json<TransitionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let outcome = state
        .engine
        .transition_manual(&project_id, number, req.to_status.trim())
        .await?;
    Ok(Json(outcome))
}

async fn set_mappings(
    State(state): State<SharedState>,
    Path(project_id): Path<String>,
    Json(mappings): Json<AgentMappings>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .engine
        .set_project_mappings(&project_id, mappings)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn github_webhook(
    State(state): State<SharedState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let secret = state
        .webhook_secret
        .as_deref()
        .ok_or_else(|| ApiError::Unauthorized("Webhook secret not configured".into()))?;
    let signature = headers
        .get(webhook::SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if !webhook::verify_signature(secret, &body, signature) {
        tracing::warn!("Rejected webhook with invalid signature");
        return Err(ApiError::Unauthorized("Invalid webhook signature".into()));
    }

    let event = headers
        .get(webhook::EVENT_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let payload: serde_json::Value = serde_json::from_slice(&body)
        .map_err(|e| ApiError::BadRequest(format!("Invalid webhook payload: {}", e)))?;

    let mut nudged = 0;
    if let Some(target) = webhook::parse_event(&event, &payload) {
        let runs = state.engine.tracker().list().await;
        let nudges = webhook::nudges_for(target, &runs, state.engine.configs().enabled_projects());
        for nudge in nudges {
            if state.poller.nudge(nudge) {
                nudged += 1;
            }
        }
    }
    tracing::debug!(event = %event, nudged, "Webhook accepted");
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({"event": event, "nudged": nudged})),
    ))
}

fn device_flow(state: &AppState) -> Result<&DeviceFlow, ApiError> {
    state
        .device_flow
        .as_ref()
        .ok_or_else(|| ApiError::BadRequest("GitHub OAuth client ID not configured".into()))
}

async fn github_device_code(
    State(state): State<SharedState>,
) -> Result<impl IntoResponse, ApiError> {
    let flow = device_flow(&state)?;
    let resp = flow
        .request_device_code()
        .await
        .map_err(|e| ApiError::BadGateway(e.to_string()))?;
    state
        .device_codes
        .lock()
        .map_err(|_| ApiError::Internal("Lock poisoned".into()))?
        .insert(resp.user_code.clone(), resp.device_code.clone());
    Ok(Json(DeviceCodeReply {
        user_code: resp.user_code,
        verification_uri: resp.verification_uri,
        expires_in: resp.expires_in,
        interval: resp.interval,
    }))
}

async fn github_poll_token(
    State(state): State<SharedState>,
    Json(req): Json<PollTokenRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let flow = device_flow(&state)?;
    let device_code = state
        .device_codes
        .lock()
        .map_err(|_| ApiError::Internal("Lock poisoned".into()))?
        .get(&req.user_code)
        .ok_or_else(|| ApiError::NotFound("Unknown or expired device code".into()))?;

    match flow
        .poll_for_token(&device_code)
        .await
        .map_err(|e| ApiError::BadGateway(e.to_string()))?
    {
        TokenPoll::Pending => Ok(Json(serde_json::json!({"status": "pending"}))),
        TokenPoll::Authorized(token) => {
            state
                .db
                .call(move |db| db.set_setting(GITHUB_TOKEN_SETTING, &token))
                .await
                .map_err(|e| ApiError::Internal(e.to_string()))?;
            if let Ok(mut codes) = state.device_codes.lock() {
                codes.remove(&req.user_code);
            }
            tracing::info!("GitHub device flow authorized");
            Ok(Json(serde_json::json!({"status": "authorized"})))
        }
    }
}

/// Forget a token stored by the device flow. The running client keeps its
/// credentials until restart.
async fn github_disconnect(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    state
        .db
        .call(|db| db.delete_setting(GITHUB_TOKEN_SETTING))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(StatusCode::NO_CONTENT)
}
