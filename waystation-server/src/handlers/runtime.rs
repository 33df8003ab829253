//! Runtime readiness and availability routes — the poll targets the UI
//! reconciles against after subscribing to the event stream.

use std::collections::HashMap;

use axum::extract::State;
use axum::Json;
use serde::Serialize;

use waystation_core::types::RuntimeReadiness;
use waystation_runtime::{Availability, PullProgress};

use crate::error::ApiResult;
use crate::state::AppState;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeStatusView {
    pub readiness: RuntimeReadiness,
    /// Latest sample of an in-flight image pull, when one is running.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pull_progress: Option<PullProgress>,
    pub runners: HashMap<String, Availability>,
    pub has_running_agents: bool,
}

fn status_view(state: &AppState) -> RuntimeStatusView {
    RuntimeStatusView {
        readiness: state.readiness.current(),
        pull_progress: state.readiness.pull_progress(),
        runners: state
            .availability
            .snapshot()
            .into_iter()
            .map(|(kind, availability)| (kind.cli().to_string(), availability))
            .collect(),
        has_running_agents: state.manager.has_running_agents(),
    }
}

pub async fn runtime_status(State(state): State<AppState>) -> Json<RuntimeStatusView> {
    Json(status_view(&state))
}

/// Explicit re-probe of every runner, then a readiness re-check.
pub async fn refresh_runtime(State(state): State<AppState>) -> ApiResult<Json<RuntimeStatusView>> {
    for kind in state.runners.kinds() {
        if let Some(runner) = state.runners.get(kind) {
            state.availability.refresh(&runner).await;
        }
    }
    let settings = state.settings.load()?;
    let readiness = state.readiness.clone();
    let runner = state.manager.runner();
    tokio::spawn(async move {
        readiness.check(runner, settings.container.agent_image).await;
    });
    Ok(Json(status_view(&state)))
}
