//! Axum route handlers.
//!
//! # Routes
//!
//! - `GET  /health`                      — liveness probe
//! - `GET  /sessions`                    — list sessions (id, turn count, has-analysis, excerpt)
//! - `POST /sessions`                    — start a session `{provocation, roster}`
//! - `GET  /sessions/{id}/state`         — scheduler state
//! - `GET  /sessions/{id}/turns`         — full turn log
//! - `GET  /sessions/{id}/metrics`       — per-turn metrics records
//! - `GET  /sessions/{id}/analysis`      — the Analysis, 404 "not ready" before end()
//! - `POST /sessions/{id}/pause`         — freeze at the next turn boundary
//! - `POST /sessions/{id}/resume`        — resume a paused session
//! - `POST /sessions/{id}/end`           — finalize and return the Analysis
//! - `POST /sessions/{id}/human`         — submit the human turn `{text}`
//! - `POST /sessions/{id}/force`         — force an agent `{agent_id}`
//! - `POST /sessions/{id}/inject`        — inject a system turn `{text}`

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;
use uuid::Uuid;

use crate::engine::DialogueEngine;
use crate::error::EngineError;
use crate::session::Roster;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<DialogueEngine>,
}

impl AppState {
    pub fn new(engine: Arc<DialogueEngine>) -> Self {
        Self { engine }
    }
}

/// Build the router with all routes.
pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/sessions", get(list_sessions).post(start_session))
        .route("/sessions/{id}/state", get(session_state))
        .route("/sessions/{id}/turns", get(session_turns))
        .route("/sessions/{id}/metrics", get(session_metrics))
        .route("/sessions/{id}/analysis", get(session_analysis))
        .route("/sessions/{id}/pause", post(pause_session))
        .route("/sessions/{id}/resume", post(resume_session))
        .route("/sessions/{id}/end", post(end_session))
        .route("/sessions/{id}/human", post(submit_human))
        .route("/sessions/{id}/force", post(force_invoke))
        .route("/sessions/{id}/inject", post(inject_prompt))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Map engine errors onto HTTP responses.
fn error_response(err: EngineError) -> (StatusCode, Json<Value>) {
    let status = match &err {
        EngineError::SessionNotFound { .. } | EngineError::UnknownAgent { .. } => {
            StatusCode::NOT_FOUND
        }
        EngineError::AnalysisNotReady { .. } => StatusCode::NOT_FOUND,
        EngineError::InvalidStateTransition { .. } => StatusCode::CONFLICT,
        EngineError::DataIntegrity { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        EngineError::TransientBackend { .. } => StatusCode::BAD_GATEWAY,
        EngineError::SessionGone { .. } | EngineError::Storage(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    let body = match &err {
        EngineError::AnalysisNotReady { .. } => json!({
            "status": "not_ready",
            "error": err.to_string(),
        }),
        _ => json!({ "error": err.to_string() }),
    };
    (status, Json(body))
}

type Handled = Result<Json<Value>, (StatusCode, Json<Value>)>;

async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": crate::VERSION,
        "service": "polylogue",
    }))
}

#[derive(Debug, Deserialize)]
struct StartRequest {
    provocation: String,
    roster: Roster,
}

#[derive(Debug, Serialize)]
struct StartResponse {
    session_id: Uuid,
}

async fn start_session(
    State(state): State<AppState>,
    Json(request): Json<StartRequest>,
) -> Handled {
    let session_id = state
        .engine
        .start(&request.provocation, request.roster)
        .map_err(error_response)?;
    Ok(Json(json!(StartResponse { session_id })))
}

async fn list_sessions(State(state): State<AppState>) -> Handled {
    let sessions = state.engine.list_sessions().map_err(error_response)?;
    Ok(Json(json!({ "sessions": sessions })))
}

async fn session_state(State(state): State<AppState>, Path(id): Path<Uuid>) -> Handled {
    let scheduler_state = state.engine.state(id).map_err(error_response)?;
    Ok(Json(json!({ "state": scheduler_state })))
}

async fn session_turns(State(state): State<AppState>, Path(id): Path<Uuid>) -> Handled {
    let turns = state.engine.turns(id).map_err(error_response)?;
    Ok(Json(json!({ "turns": turns })))
}

async fn session_metrics(State(state): State<AppState>, Path(id): Path<Uuid>) -> Handled {
    let metrics = state.engine.metrics(id).map_err(error_response)?;
    Ok(Json(json!({ "metrics": metrics })))
}

async fn session_analysis(State(state): State<AppState>, Path(id): Path<Uuid>) -> Handled {
    let analysis = state.engine.analysis(id).map_err(error_response)?;
    Ok(Json(json!({ "analysis": analysis })))
}

async fn pause_session(State(state): State<AppState>, Path(id): Path<Uuid>) -> Handled {
    state.engine.pause(id).await.map_err(error_response)?;
    Ok(Json(json!({ "status": "paused" })))
}

async fn resume_session(State(state): State<AppState>, Path(id): Path<Uuid>) -> Handled {
    state.engine.resume(id).await.map_err(error_response)?;
    Ok(Json(json!({ "status": "running" })))
}

async fn end_session(State(state): State<AppState>, Path(id): Path<Uuid>) -> Handled {
    let analysis = state.engine.end(id).await.map_err(error_response)?;
    Ok(Json(json!({ "analysis": analysis })))
}

#[derive(Debug, Deserialize)]
struct TextBody {
    text: String,
}

async fn submit_human(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<TextBody>,
) -> Handled {
    state
        .engine
        .submit_human_turn(id, &body.text)
        .await
        .map_err(error_response)?;
    Ok(Json(json!({ "status": "recorded" })))
}

#[derive(Debug, Deserialize)]
struct ForceBody {
    agent_id: String,
}

async fn force_invoke(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<ForceBody>,
) -> Handled {
    state
        .engine
        .force_invoke(id, &body.agent_id)
        .await
        .map_err(error_response)?;
    Ok(Json(json!({ "status": "queued" })))
}

async fn inject_prompt(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<TextBody>,
) -> Handled {
    state
        .engine
        .inject_prompt(id, &body.text)
        .await
        .map_err(error_response)?;
    Ok(Json(json!({ "status": "recorded" })))
}

// ============================================================================
// Tests
// ============================================================================
