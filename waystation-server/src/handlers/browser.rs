//! Host browser routes.

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};

use waystation_core::events::Event;
use waystation_runtime::DetectResult;

use crate::error::ApiResult;
use crate::state::AppState;

pub async fn detect(State(state): State<AppState>) -> Json<DetectResult> {
    Json(state.browser.detect())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct LaunchRequest {
    pub agent_id: String,
    #[serde(default)]
    pub profile_id: Option<String>,
}

#[derive(Serialize)]
pub struct LaunchResponse {
    pub port: u16,
}

pub async fn launch_host_browser(
    State(state): State<AppState>,
    Json(request): Json<LaunchRequest>,
) -> ApiResult<Json<LaunchResponse>> {
    let port = state
        .browser
        .ensure_running(&request.agent_id, request.profile_id.as_deref())
        .await
        .map_err(waystation_core::Error::from)?;
    state.bus.publish(Event::BrowserActive {
        agent_id: request.agent_id,
        active: true,
    });
    Ok(Json(LaunchResponse { port }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct StopRequest {
    pub agent_id: String,
}

pub async fn stop_host_browser(
    State(state): State<AppState>,
    Json(request): Json<StopRequest>,
) -> ApiResult<StatusCode> {
    state
        .browser
        .stop_agent(&request.agent_id)
        .await
        .map_err(waystation_core::Error::from)?;
    state.bus.publish(Event::BrowserActive {
        agent_id: request.agent_id,
        active: false,
    });
    Ok(StatusCode::NO_CONTENT)
}
