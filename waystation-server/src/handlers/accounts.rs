//! Connected account routes: the global account registry plus per-agent
//! mappings and the audit log.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};

use waystation_core::types::{AuditEntry, ConnectedAccount};
use waystation_core::{Error, NewAccount};

use crate::error::{not_found, ApiResult};
use crate::state::AppState;

// ---------------------------------------------------------------------
// Global registry
// ---------------------------------------------------------------------

pub async fn list_accounts(
    State(state): State<AppState>,
) -> ApiResult<Json<Vec<ConnectedAccount>>> {
    Ok(Json(state.db.list_accounts()?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct InitiateRequest {
    pub toolkit_slug: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitiateResponse {
    pub connection_id: String,
    pub redirect_url: String,
}

/// Kick off the broker's auth flow; the UI opens `redirectUrl` and the
/// user finishes there.
pub async fn initiate_account(
    State(state): State<AppState>,
    Json(request): Json<InitiateRequest>,
) -> ApiResult<Json<InitiateResponse>> {
    let initiated = state
        .proxy
        .broker()
        .initiate_connection(&request.toolkit_slug)
        .await?;
    Ok(Json(InitiateResponse {
        connection_id: initiated.connection_id,
        redirect_url: initiated.redirect_url,
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CompleteRequest {
    pub toolkit_slug: String,
    pub connection_id: String,
    pub display_name: String,
}

/// Finish account registration once the broker reports the connection
/// active.
pub async fn complete_account(
    State(state): State<AppState>,
    Json(request): Json<CompleteRequest>,
) -> ApiResult<(StatusCode, Json<ConnectedAccount>)> {
    let active = state
        .proxy
        .broker()
        .connection_active(&request.connection_id)
        .await?;
    if !active {
        return Err(Error::Validation(
            "connection has not been authorized yet".into(),
        )
        .into());
    }
    let account = state.db.create_account(NewAccount {
        toolkit_slug: request.toolkit_slug,
        composio_connection_id: request.connection_id,
        display_name: request.display_name,
    })?;
    Ok((StatusCode::CREATED, Json(account)))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RenameRequest {
    pub display_name: String,
}

pub async fn rename_account(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<RenameRequest>,
) -> ApiResult<Json<ConnectedAccount>> {
    state.db.rename_account(&id, &request.display_name)?;
    let account = state
        .db
        .get_account(&id)?
        .ok_or_else(|| not_found(format!("account {}", id)))?;
    Ok(Json(account))
}

pub async fn delete_account(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    state.db.delete_account(&id)?;
    Ok(StatusCode::NO_CONTENT)
}

// ---------------------------------------------------------------------
// Per-agent mappings
// ---------------------------------------------------------------------

fn require_agent(state: &AppState, slug: &str) -> ApiResult<()> {
    if state.agents.exists(slug) {
        Ok(())
    } else {
        Err(not_found(format!("agent {}", slug)))
    }
}

pub async fn list_agent_accounts(
    State(state): State<AppState>,
    Path(slug): Path<String>,
) -> ApiResult<Json<Vec<ConnectedAccount>>> {
    require_agent(&state, &slug)?;
    Ok(Json(state.db.list_agent_accounts(&slug)?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct MapAccountRequest {
    pub account_id: String,
}

pub async fn map_agent_account(
    State(state): State<AppState>,
    Path(slug): Path<String>,
    Json(request): Json<MapAccountRequest>,
) -> ApiResult<StatusCode> {
    require_agent(&state, &slug)?;
    state.db.map_agent_account(&slug, &request.account_id)?;
    Ok(StatusCode::NO_CONTENT)
}

/// Unmapping never deletes the account itself.
pub async fn unmap_agent_account(
    State(state): State<AppState>,
    Path((slug, account_id)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    require_agent(&state, &slug)?;
    state.db.unmap_agent_account(&slug, &account_id)?;
    Ok(StatusCode::NO_CONTENT)
}

// ---------------------------------------------------------------------
// Audit log
// ---------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct AuditQuery {
    #[serde(default)]
    pub offset: u32,
    #[serde(default = "default_audit_limit")]
    pub limit: u32,
}

fn default_audit_limit() -> u32 {
    50
}

pub async fn agent_audit_log(
    State(state): State<AppState>,
    Path(slug): Path<String>,
    Query(query): Query<AuditQuery>,
) -> ApiResult<Json<Vec<AuditEntry>>> {
    require_agent(&state, &slug)?;
    Ok(Json(state.db.list_audit(
        &slug,
        query.offset,
        query.limit.min(500),
    )?))
}
