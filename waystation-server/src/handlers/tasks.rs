//! Scheduled task routes.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Deserialize;

use waystation_core::events::Event;
use waystation_core::types::{ScheduledTask, SessionSummary};
use waystation_core::NewTask;

use crate::error::{not_found, ApiResult};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CreateTaskRequest {
    pub agent_slug: String,
    #[serde(default)]
    pub name: Option<String>,
    pub prompt: String,
    pub next_execution_at: DateTime<Utc>,
    #[serde(default)]
    pub recurrence_minutes: Option<i64>,
}

pub async fn create_task(
    State(state): State<AppState>,
    Json(request): Json<CreateTaskRequest>,
) -> ApiResult<(StatusCode, Json<ScheduledTask>)> {
    if !state.agents.exists(&request.agent_slug) {
        return Err(not_found(format!("agent {}", request.agent_slug)));
    }
    let task = state.db.create_task(NewTask {
        agent_slug: request.agent_slug,
        name: request.name,
        prompt: request.prompt,
        next_execution_at: request.next_execution_at,
        recurrence_minutes: request.recurrence_minutes,
    })?;
    state.bus.publish(Event::ScheduledTaskCreated {
        task_id: task.id.clone(),
        agent_slug: task.agent_slug.clone(),
    });
    Ok((StatusCode::CREATED, Json(task)))
}

pub async fn list_tasks(State(state): State<AppState>) -> ApiResult<Json<Vec<ScheduledTask>>> {
    Ok(Json(state.db.list_tasks()?))
}

pub async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<ScheduledTask>> {
    let task = state
        .db
        .get_task(&id)?
        .ok_or_else(|| not_found(format!("scheduled task {}", id)))?;
    Ok(Json(task))
}

/// DELETE cancels a live task (the record stays, status `cancelled`);
/// deleting an already-finished task removes the record.
pub async fn delete_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    let task = state
        .db
        .get_task(&id)?
        .ok_or_else(|| not_found(format!("scheduled task {}", id)))?;
    if task.status.is_terminal() {
        state.db.delete_task(&id)?;
        Ok(StatusCode::NO_CONTENT.into_response())
    } else {
        let cancelled = state.db.cancel_task(&id)?;
        Ok(Json(cancelled).into_response())
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ResetTaskRequest {
    #[serde(default)]
    pub next_execution_at: Option<DateTime<Utc>>,
}

pub async fn reset_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Option<Json<ResetTaskRequest>>,
) -> ApiResult<Json<ScheduledTask>> {
    let next = body
        .and_then(|Json(request)| request.next_execution_at)
        .unwrap_or_else(Utc::now);
    let task = state.db.reset_task(&id, next)?;
    Ok(Json(task))
}

pub async fn task_sessions(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Vec<SessionSummary>>> {
    if state.db.get_task(&id)?.is_none() {
        return Err(not_found(format!("scheduled task {}", id)));
    }
    Ok(Json(state.sessions.sessions_for_task(&id)?))
}
