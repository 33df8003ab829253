//! Persisted application settings.
//!
//! Settings live in `settings.json` under the data directory. The field
//! set is closed: unknown fields are rejected on both load and update.
//! Updates are merge patches — an omitted section or field leaves the
//! stored value unchanged, and an empty-string API key deletes the key.
//!
//! Changing the container runner or resource limits is refused while any
//! agent container is running; the caller passes that fact in because the
//! settings layer has no view of container state.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::types::{ResourceLimits, RunnerKind};

/// Default agent container image reference.
pub const DEFAULT_AGENT_IMAGE: &str = "ghcr.io/waystation-app/agent:latest";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ContainerSettings {
    pub container_runner: RunnerKind,
    pub agent_image: String,
    pub resource_limits: ResourceLimits,
}

impl Default for ContainerSettings {
    fn default() -> Self {
        Self {
            container_runner: RunnerKind::Docker,
            agent_image: DEFAULT_AGENT_IMAGE.to_string(),
            resource_limits: ResourceLimits::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct AppSettings {
    pub show_menu_bar_icon: bool,
    /// Idle minutes before a running container is stopped; `0` disables.
    pub auto_sleep_timeout_minutes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chrome_profile_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub use_host_browser: Option<bool>,
    pub setup_completed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allow_prerelease_updates: Option<bool>,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            show_menu_bar_icon: true,
            auto_sleep_timeout_minutes: 30,
            chrome_profile_id: None,
            use_host_browser: None,
            setup_completed: false,
            allow_prerelease_updates: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ApiKeySettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub anthropic_api_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub composio_api_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub composio_user_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ModelSettings {
    pub agent_model: String,
    pub summarizer_model: String,
    pub browser_model: String,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            agent_model: "claude-sonnet-4-5".to_string(),
            summarizer_model: "claude-haiku-4-5".to_string(),
            browser_model: "claude-haiku-4-5".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct AgentLimits {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_thinking_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_turns: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_budget_usd: Option<f64>,
}

/// The full persisted settings document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct Settings {
    pub container: ContainerSettings,
    pub app: AppSettings,
    pub api_keys: ApiKeySettings,
    pub models: ModelSettings,
    pub skillsets: Vec<String>,
    pub custom_env_vars: BTreeMap<String, String>,
    pub agent_limits: AgentLimits,
}

// ---------------------------------------------------------------------------
// Merge-patch update payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ContainerUpdate {
    pub container_runner: Option<RunnerKind>,
    pub agent_image: Option<String>,
    pub resource_limits: Option<ResourceLimits>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct AppUpdate {
    pub show_menu_bar_icon: Option<bool>,
    pub auto_sleep_timeout_minutes: Option<u64>,
    pub chrome_profile_id: Option<String>,
    pub use_host_browser: Option<bool>,
    pub setup_completed: Option<bool>,
    pub allow_prerelease_updates: Option<bool>,
}

/// API-key fields: omitted leaves unchanged, empty string deletes.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ApiKeyUpdate {
    pub anthropic_api_key: Option<String>,
    pub composio_api_key: Option<String>,
    pub composio_user_id: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ModelUpdate {
    pub agent_model: Option<String>,
    pub summarizer_model: Option<String>,
    pub browser_model: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SettingsUpdate {
    pub container: Option<ContainerUpdate>,
    pub app: Option<AppUpdate>,
    pub api_keys: Option<ApiKeyUpdate>,
    pub models: Option<ModelUpdate>,
    pub skillsets: Option<Vec<String>>,
    pub custom_env_vars: Option<BTreeMap<String, String>>,
    pub agent_limits: Option<AgentLimits>,
}

fn apply_key(slot: &mut Option<String>, update: Option<String>) {
    match update {
        None => {}
        Some(value) if value.is_empty() => *slot = None,
        Some(value) => *slot = Some(value),
    }
}

impl Settings {
    /// Apply a merge patch, enforcing the running-agents restriction on
    /// container runner and resource limits.
    pub fn apply(&self, update: SettingsUpdate, has_running_agents: bool) -> Result<Settings> {
        let mut next = self.clone();

        if let Some(container) = update.container {
            let runner_change = container
                .container_runner
                .is_some_and(|runner| runner != next.container.container_runner);
            let limits_change = container
                .resource_limits
                .as_ref()
                .is_some_and(|limits| *limits != next.container.resource_limits);
            if has_running_agents && (runner_change || limits_change) {
                return Err(Error::Conflict(
                    "container runner and resource limits cannot change while agents are running"
                        .to_string(),
                ));
            }
            if let Some(runner) = container.container_runner {
                next.container.container_runner = runner;
            }
            if let Some(image) = container.agent_image {
                next.container.agent_image = image;
            }
            if let Some(limits) = container.resource_limits {
                next.container.resource_limits = limits;
            }
        }

        if let Some(app) = update.app {
            if let Some(v) = app.show_menu_bar_icon {
                next.app.show_menu_bar_icon = v;
            }
            if let Some(v) = app.auto_sleep_timeout_minutes {
                next.app.auto_sleep_timeout_minutes = v;
            }
            if let Some(v) = app.chrome_profile_id {
                next.app.chrome_profile_id = if v.is_empty() { None } else { Some(v) };
            }
            if let Some(v) = app.use_host_browser {
                next.app.use_host_browser = Some(v);
            }
            if let Some(v) = app.setup_completed {
                next.app.setup_completed = v;
            }
            if let Some(v) = app.allow_prerelease_updates {
                next.app.allow_prerelease_updates = Some(v);
            }
        }

        if let Some(keys) = update.api_keys {
            apply_key(&mut next.api_keys.anthropic_api_key, keys.anthropic_api_key);
            apply_key(&mut next.api_keys.composio_api_key, keys.composio_api_key);
            apply_key(&mut next.api_keys.composio_user_id, keys.composio_user_id);
        }

        if let Some(models) = update.models {
            if let Some(v) = models.agent_model {
                next.models.agent_model = v;
            }
            if let Some(v) = models.summarizer_model {
                next.models.summarizer_model = v;
            }
            if let Some(v) = models.browser_model {
                next.models.browser_model = v;
            }
        }

        if let Some(skillsets) = update.skillsets {
            next.skillsets = skillsets;
        }
        if let Some(env) = update.custom_env_vars {
            next.custom_env_vars = env;
        }
        if let Some(limits) = update.agent_limits {
            next.agent_limits = limits;
        }

        Ok(next)
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// File-backed settings store; all writes go through one async lock so a
/// concurrent update can never interleave with a save.
pub struct SettingsStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl SettingsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    /// Load settings, falling back to defaults when the file is missing.
    pub fn load(&self) -> Result<Settings> {
        match std::fs::read_to_string(&self.path) {
            Ok(raw) => serde_json::from_str(&raw)
                .map_err(|e| Error::Validation(format!("settings file: {}", e))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Settings::default()),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, settings: &Settings) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(settings)?;
        std::fs::write(&self.path, json)?;
        Ok(())
    }

    /// Apply an update and persist. Returns the stored settings on
    /// success; on conflict the file is left untouched.
    pub async fn update(
        &self,
        update: SettingsUpdate,
        has_running_agents: bool,
    ) -> Result<Settings> {
        let _guard = self.lock.lock().await;
        let current = self.load()?;
        let next = current.apply(update, has_running_agents)?;
        self.save(&next)?;
        Ok(next)
    }

    /// Replace the file with defaults (factory reset support).
    pub async fn reset(&self) -> Result<Settings> {
        let _guard = self.lock.lock().await;
        let defaults = Settings::default();
        self.save(&defaults)?;
        Ok(defaults)
    }
}
