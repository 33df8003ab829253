//! Process boot configuration.
//!
//! Everything the control plane reads from the environment is resolved
//! here, once, before any component is constructed. Services receive
//! values; nothing else in the tree touches `std::env`.

use std::path::{Path, PathBuf};

use crate::error::Result;

/// Default HTTP port when `PORT` is unset.
pub const DEFAULT_PORT: u16 = 4820;

/// Default deep-link scheme when `PROTOCOL_SCHEME` is unset.
pub const DEFAULT_PROTOCOL_SCHEME: &str = "waystation";

/// Fully-resolved boot configuration.
#[derive(Debug, Clone)]
pub struct BootConfig {
    /// Root of all persisted state.
    pub data_dir: PathBuf,
    /// HTTP listen port.
    pub port: u16,
    /// Deep-link callback scheme used by OAuth flows.
    pub protocol_scheme: String,
    /// Env-sourced fallback when the settings file has no Anthropic key.
    pub anthropic_api_key: Option<String>,
    /// Env-sourced fallback for the upstream broker key.
    pub composio_api_key: Option<String>,
    /// Env-sourced fallback for the broker user id.
    pub composio_user_id: Option<String>,
}

impl BootConfig {
    /// Resolve configuration from the environment.
    ///
    /// `DATA_DIR` overrides the platform data directory; a relative value
    /// is taken as-is (useful for development checkouts).
    pub fn from_env() -> Self {
        let data_dir = std::env::var_os("DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(default_data_dir);
        let port = std::env::var("PORT")
            .ok()
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(DEFAULT_PORT);
        let protocol_scheme = std::env::var("PROTOCOL_SCHEME")
            .unwrap_or_else(|_| DEFAULT_PROTOCOL_SCHEME.to_string());

        Self {
            data_dir,
            port,
            protocol_scheme,
            anthropic_api_key: non_empty_env("ANTHROPIC_API_KEY"),
            composio_api_key: non_empty_env("COMPOSIO_API_KEY"),
            composio_user_id: non_empty_env("COMPOSIO_USER_ID"),
        }
    }

    /// Construct for tests with an explicit data dir.
    pub fn for_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            port: DEFAULT_PORT,
            protocol_scheme: DEFAULT_PROTOCOL_SCHEME.to_string(),
            anthropic_api_key: None,
            composio_api_key: None,
            composio_user_id: None,
        }
    }

    pub fn agents_dir(&self) -> PathBuf {
        self.data_dir.join("agents")
    }

    pub fn browser_profiles_dir(&self) -> PathBuf {
        self.data_dir.join("host-browser-profiles")
    }

    pub fn settings_path(&self) -> PathBuf {
        self.data_dir.join("settings.json")
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("app.db")
    }

    /// Create the on-disk layout if missing.
    pub fn ensure_layout(&self) -> Result<()> {
        std::fs::create_dir_all(self.agents_dir())?;
        std::fs::create_dir_all(self.browser_profiles_dir())?;
        Ok(())
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| Path::new(".").to_path_buf())
        .join("waystation")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_paths() {
        let config = BootConfig::for_data_dir("/tmp/ws-data");
        assert_eq!(config.agents_dir(), PathBuf::from("/tmp/ws-data/agents"));
        assert_eq!(config.db_path(), PathBuf::from("/tmp/ws-data/app.db"));
        assert_eq!(
            config.settings_path(),
            PathBuf::from("/tmp/ws-data/settings.json")
        );
        assert_eq!(
            config.browser_profiles_dir(),
            PathBuf::from("/tmp/ws-data/host-browser-profiles")
        );
    }

    #[test]
    fn test_ensure_layout_creates_dirs() {
        let tmp = tempfile::tempdir().unwrap();
        let config = BootConfig::for_data_dir(tmp.path().join("data"));
        config.ensure_layout().unwrap();
        assert!(config.agents_dir().is_dir());
        assert!(config.browser_profiles_dir().is_dir());
    }
}
