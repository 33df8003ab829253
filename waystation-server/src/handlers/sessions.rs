//! Session routes, scoped to an agent.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use waystation_core::sessions::SessionPatch;
use waystation_core::types::{SessionMessage, SessionSummary};

use crate::error::{not_found, ApiResult};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RegisterSessionRequest {
    /// Caller-chosen id; generated when omitted.
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionDetailView {
    #[serde(flatten)]
    pub session: SessionSummary,
    pub messages: Vec<SessionMessage>,
}

fn require_agent(state: &AppState, slug: &str) -> ApiResult<()> {
    if state.agents.exists(slug) {
        Ok(())
    } else {
        Err(not_found(format!("agent {}", slug)))
    }
}

pub async fn list_sessions(
    State(state): State<AppState>,
    Path(slug): Path<String>,
) -> ApiResult<Json<Vec<SessionSummary>>> {
    require_agent(&state, &slug)?;
    Ok(Json(state.sessions.list_sessions(&slug)?))
}

pub async fn create_session(
    State(state): State<AppState>,
    Path(slug): Path<String>,
    Json(request): Json<RegisterSessionRequest>,
) -> ApiResult<(StatusCode, Json<SessionSummary>)> {
    require_agent(&state, &slug)?;
    let session_id = request
        .session_id
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    state
        .sessions
        .register_session(&slug, &session_id, request.name, None)
        .await?;
    let summary = state.sessions.get_session(&slug, &session_id)?;
    Ok((StatusCode::CREATED, Json(summary)))
}

pub async fn get_session(
    State(state): State<AppState>,
    Path((slug, session_id)): Path<(String, String)>,
) -> ApiResult<Json<SessionDetailView>> {
    require_agent(&state, &slug)?;
    let session = state.sessions.get_session(&slug, &session_id)?;
    let messages = state.sessions.get_messages(&slug, &session_id)?;
    Ok(Json(SessionDetailView { session, messages }))
}

pub async fn patch_session(
    State(state): State<AppState>,
    Path((slug, session_id)): Path<(String, String)>,
    Json(patch): Json<SessionPatch>,
) -> ApiResult<Json<SessionSummary>> {
    require_agent(&state, &slug)?;
    state.sessions.patch_session(&slug, &session_id, patch).await?;
    Ok(Json(state.sessions.get_session(&slug, &session_id)?))
}

pub async fn delete_session(
    State(state): State<AppState>,
    Path((slug, session_id)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    require_agent(&state, &slug)?;
    state.sessions.delete_session(&slug, &session_id).await?;
    Ok(StatusCode::NO_CONTENT)
}
