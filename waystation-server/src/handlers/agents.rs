//! Agent CRUD and container lifecycle routes.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;

use waystation_core::agents::{AgentDetail, AgentPatch, NewAgent};
use waystation_core::types::{AgentRecord, ContainerStatus};

use crate::error::{not_found, ApiResult};
use crate::state::AppState;

/// Listing entry: metadata plus the cached container status the sidebar
/// renders.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentView {
    #[serde(flatten)]
    pub record: AgentRecord,
    pub status: ContainerStatus,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentDetailView {
    #[serde(flatten)]
    pub detail: AgentDetail,
    pub status: ContainerStatus,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LifecycleView {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    pub status: ContainerStatus,
}

pub async fn list_agents(State(state): State<AppState>) -> ApiResult<Json<Vec<AgentView>>> {
    let records = state.agents.list()?;
    let views = records
        .into_iter()
        .map(|record| AgentView {
            status: state.manager.status(&record.slug),
            record,
        })
        .collect();
    Ok(Json(views))
}

pub async fn create_agent(
    State(state): State<AppState>,
    Json(new): Json<NewAgent>,
) -> ApiResult<(StatusCode, Json<AgentRecord>)> {
    let record = state.agents.create(new).await?;
    Ok((StatusCode::CREATED, Json(record)))
}

pub async fn get_agent(
    State(state): State<AppState>,
    Path(slug): Path<String>,
) -> ApiResult<Json<AgentDetailView>> {
    let detail = state.agents.get(&slug)?;
    Ok(Json(AgentDetailView {
        status: state.manager.status(&slug),
        detail,
    }))
}

pub async fn patch_agent(
    State(state): State<AppState>,
    Path(slug): Path<String>,
    Json(patch): Json<AgentPatch>,
) -> ApiResult<Json<AgentRecord>> {
    let record = state.agents.update(&slug, patch).await?;
    Ok(Json(record))
}

/// Delete = stop container → drop credentials → remove the directory
/// tree. Idempotent.
pub async fn delete_agent(
    State(state): State<AppState>,
    Path(slug): Path<String>,
) -> ApiResult<StatusCode> {
    if let Err(e) = state.manager.stop(&slug).await {
        tracing::warn!(agent = %slug, error = %e, "container stop during delete failed");
    }
    let _ = state.browser.stop_agent(&slug).await;
    state.db.revoke_tokens(&slug)?;
    state.agents.delete(&slug)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn start_agent(
    State(state): State<AppState>,
    Path(slug): Path<String>,
) -> ApiResult<Json<LifecycleView>> {
    if !state.agents.exists(&slug) {
        return Err(not_found(format!("agent {}", slug)));
    }
    let port = state.manager.start(&slug).await?;
    Ok(Json(LifecycleView {
        port: Some(port),
        status: state.manager.status(&slug),
    }))
}

pub async fn stop_agent(
    State(state): State<AppState>,
    Path(slug): Path<String>,
) -> ApiResult<Json<LifecycleView>> {
    if !state.agents.exists(&slug) {
        return Err(not_found(format!("agent {}", slug)));
    }
    state.manager.stop(&slug).await?;
    Ok(Json(LifecycleView {
        port: None,
        status: state.manager.status(&slug),
    }))
}
