//! Settings routes.

use axum::extract::State;
use axum::Json;
use serde::{Deserialize, Serialize};

use waystation_core::types::RunnerKind;
use waystation_core::{Error, Settings, SettingsUpdate};
use waystation_runtime::Availability;

use crate::error::{bad_request, ApiResult};
use crate::state::AppState;

pub async fn get_settings(State(state): State<AppState>) -> ApiResult<Json<Settings>> {
    Ok(Json(state.settings.load()?))
}

/// Merge-patch update. Container runner / resource limit changes are
/// refused with 409 while agents run, and the stored file is untouched
/// on refusal.
pub async fn put_settings(
    State(state): State<AppState>,
    Json(update): Json<SettingsUpdate>,
) -> ApiResult<Json<Settings>> {
    let has_running = state.manager.has_running_agents();
    let updated = state.settings.update(update, has_running).await?;

    // Propagate a runner swap to the manager and re-check readiness.
    if updated.container.container_runner != state.manager.runner().kind() {
        if let Some(runner) = state.runners.get(updated.container.container_runner) {
            if let Err(e) = state.manager.set_runner(runner.clone()) {
                tracing::warn!(error = %e, "runner swap raced a container start");
            } else {
                state.availability.invalidate(updated.container.container_runner);
                let readiness = state.readiness.clone();
                let image = updated.container.agent_image.clone();
                tokio::spawn(async move {
                    readiness.check(runner, image).await;
                });
            }
        }
    }
    state.manager.set_image_and_limits(
        updated.container.agent_image.clone(),
        updated.container.resource_limits.clone(),
    );

    Ok(Json(updated))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct StartRunnerRequest {
    pub runner: RunnerKind,
}

/// Start the selected runtime's daemon, then refresh its availability
/// probe and re-check readiness.
pub async fn start_runner(
    State(state): State<AppState>,
    Json(request): Json<StartRunnerRequest>,
) -> ApiResult<Json<Availability>> {
    let runner = state
        .runners
        .get(request.runner)
        .ok_or_else(|| bad_request(format!("unsupported runner {}", request.runner)))?;
    runner
        .start_daemon()
        .await
        .map_err(waystation_core::Error::from)?;

    let availability = state.availability.refresh(&runner).await;
    let settings = state.settings.load()?;
    let readiness = state.readiness.clone();
    tokio::spawn(async move {
        readiness.check(runner, settings.container.agent_image).await;
    });
    Ok(Json(availability))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ValidateKeyRequest {
    pub api_key: String,
}

#[derive(Serialize)]
pub struct ValidateKeyResponse {
    pub valid: bool,
}

/// Probe the Anthropic API with the candidate key.
pub async fn validate_anthropic_key(
    State(state): State<AppState>,
    Json(request): Json<ValidateKeyRequest>,
) -> ApiResult<Json<ValidateKeyResponse>> {
    if request.api_key.is_empty() {
        return Ok(Json(ValidateKeyResponse { valid: false }));
    }
    let url = format!("{}/v1/models", state.anthropic_base_url);
    let response = reqwest::Client::new()
        .get(&url)
        .header("x-api-key", &request.api_key)
        .header("anthropic-version", "2023-06-01")
        .timeout(std::time::Duration::from_secs(15))
        .send()
        .await
        .map_err(|e| Error::Upstream(format!("anthropic: {}", e)))?;
    Ok(Json(ValidateKeyResponse {
        valid: response.status().is_success(),
    }))
}

/// Stop everything and wipe all persisted state back to first-run.
pub async fn factory_reset(State(state): State<AppState>) -> ApiResult<Json<Settings>> {
    state.manager.stop_all().await;
    state.browser.stop_all().await;
    state.proxy.clear_token_cache();
    state.db.factory_reset()?;

    for record in state.agents.list()? {
        state.agents.delete(&record.slug)?;
    }

    let settings = state.settings.reset().await?;
    Ok(Json(settings))
}
