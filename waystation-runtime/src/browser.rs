//! Host browser supervision.
//!
//! Launches the user's real browser with remote debugging enabled, one
//! process per agent, for the browser subagent to attach to over the
//! debugging protocol. Chrome refuses remote debugging on the user's
//! live profile, so each agent gets a scratch profile directory under
//! the data dir; the selected profile's session data is copied in on
//! first launch only.
//!
//! Invariants: at most one instance per agent, at most one in-flight
//! `ensure_running` per agent, and an external exit (the user quitting
//! the browser) fires the exit callback exactly once.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::process::Command;
use tokio::task::JoinHandle;

use crate::error::{RuntimeError, RuntimeResult};
use crate::ports::{alloc_free_port, port_open, wait_for_port};

const PORT_WAIT_TIMEOUT: Duration = Duration::from_secs(15);
const PORT_WAIT_INTERVAL: Duration = Duration::from_millis(500);

/// A profile found in the browser's user data directory.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BrowserProfile {
    pub id: String,
    pub name: String,
}

/// Result of scanning for an installed browser.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectResult {
    pub available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub browser: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    #[serde(default)]
    pub profiles: Vec<BrowserProfile>,
}

/// Callback invoked when a browser process exits without us asking.
pub type ExternalExitHandler = Arc<dyn Fn(&str) + Send + Sync>;

struct Instance {
    pid: u32,
    port: u16,
    #[allow(dead_code)]
    user_data_dir: PathBuf,
    intentional_stop: Arc<AtomicBool>,
    watcher: JoinHandle<()>,
}

/// Registry of per-agent host browser processes.
pub struct HostBrowserManager {
    profiles_dir: PathBuf,
    /// Overrides the detected binary; used by tests.
    browser_path: Mutex<Option<PathBuf>>,
    port_wait_timeout: Mutex<Duration>,
    registry: Arc<Mutex<HashMap<String, Instance>>>,
    op_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    on_external_exit: Mutex<Option<ExternalExitHandler>>,
}

impl HostBrowserManager {
    pub fn new(profiles_dir: impl Into<PathBuf>) -> Arc<Self> {
        Arc::new(Self {
            profiles_dir: profiles_dir.into(),
            browser_path: Mutex::new(None),
            port_wait_timeout: Mutex::new(PORT_WAIT_TIMEOUT),
            registry: Arc::new(Mutex::new(HashMap::new())),
            op_locks: Mutex::new(HashMap::new()),
            on_external_exit: Mutex::new(None),
        })
    }

    /// Install the external-exit callback. The server wires this to a
    /// `browser_active: false` event.
    pub fn set_external_exit_handler(&self, handler: ExternalExitHandler) {
        *self.on_external_exit.lock() = Some(handler);
    }

    /// Force a specific browser binary (tests).
    pub fn set_browser_path(&self, path: impl Into<PathBuf>) {
        *self.browser_path.lock() = Some(path.into());
    }

    /// Synchronous filesystem scan of well-known install locations.
    pub fn detect(&self) -> DetectResult {
        if let Some(path) = self.browser_path.lock().clone() {
            return DetectResult {
                available: true,
                browser: Some("chrome".into()),
                profiles: list_profiles(&path),
                path: Some(path),
            };
        }
        for (browser, path) in well_known_paths() {
            if path.exists() {
                return DetectResult {
                    available: true,
                    browser: Some(browser.to_string()),
                    profiles: list_profiles(&path),
                    path: Some(path),
                };
            }
        }
        DetectResult {
            available: false,
            browser: None,
            path: None,
            profiles: Vec::new(),
        }
    }

    /// Port of the agent's live instance, if any.
    pub fn active_port(&self, agent_id: &str) -> Option<u16> {
        self.registry.lock().get(agent_id).map(|entry| entry.port)
    }

    fn op_lock(&self, agent_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.op_locks
            .lock()
            .entry(agent_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    fn scratch_dir(&self, agent_id: &str) -> PathBuf {
        self.profiles_dir.join(agent_id)
    }

    /// Ensure a debugging-enabled browser is running for the agent and
    /// return its port. Re-entrant calls serialize; a live instance whose
    /// port still accepts connections is reused without spawning.
    pub async fn ensure_running(
        &self,
        agent_id: &str,
        profile_id: Option<&str>,
    ) -> RuntimeResult<u16> {
        let lock = self.op_lock(agent_id);
        let _guard = lock.lock().await;

        if let Some(port) = self.active_port(agent_id) {
            if port_open(port).await {
                return Ok(port);
            }
            // Stale entry: the process is gone or wedged.
            if let Some(entry) = self.registry.lock().remove(agent_id) {
                entry.intentional_stop.store(true, Ordering::SeqCst);
                entry.watcher.abort();
            }
        }

        let detect = self.detect();
        let binary = detect.path.ok_or_else(|| {
            RuntimeError::NotFound("no supported browser installed".to_string())
        })?;

        let port = alloc_free_port().await?;
        let scratch = self.scratch_dir(agent_id);
        let first_launch = !scratch.exists();
        std::fs::create_dir_all(&scratch)?;
        if first_launch {
            if let Some(profile) = profile_id {
                if let Err(e) = seed_profile(&binary, profile, &scratch) {
                    tracing::warn!(agent = agent_id, profile, error = %e, "profile copy failed; starting clean");
                }
            }
        }

        let args = launch_args(port, &scratch);
        let mut child = Command::new(&binary)
            .args(&args)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .spawn()?;
        let pid = child.id().ok_or_else(|| {
            RuntimeError::NotFound("browser process exited before it got a pid".to_string())
        })?;

        let wait_timeout = *self.port_wait_timeout.lock();
        if !wait_for_port(port, wait_timeout, PORT_WAIT_INTERVAL).await {
            let _ = child.kill().await;
            return Err(RuntimeError::StartTimeout(format!(
                "browser did not open debugging port {} within {:?}",
                port, wait_timeout
            )));
        }

        let intentional_stop = Arc::new(AtomicBool::new(false));
        let watcher = {
            let registry = self.registry.clone();
            let handler = self.on_external_exit.lock().clone();
            let intentional = intentional_stop.clone();
            let agent = agent_id.to_string();
            tokio::spawn(async move {
                let _ = child.wait().await;
                registry.lock().remove(&agent);
                if !intentional.load(Ordering::SeqCst) {
                    tracing::info!(agent = %agent, "host browser exited externally");
                    if let Some(handler) = handler {
                        handler(&agent);
                    }
                }
            })
        };

        self.registry.lock().insert(
            agent_id.to_string(),
            Instance {
                pid,
                port,
                user_data_dir: scratch,
                intentional_stop,
                watcher,
            },
        );
        tracing::info!(agent = agent_id, port, "host browser running");
        Ok(port)
    }

    /// Stop the agent's browser. The exit is flagged as intentional so
    /// the external-exit callback stays silent.
    pub async fn stop_agent(&self, agent_id: &str) -> RuntimeResult<()> {
        let lock = self.op_lock(agent_id);
        let _guard = lock.lock().await;

        let entry = self.registry.lock().remove(agent_id);
        let Some(entry) = entry else {
            return Ok(());
        };
        entry.intentional_stop.store(true, Ordering::SeqCst);
        terminate(entry.pid);
        Ok(())
    }

    pub async fn stop_all(&self) {
        let agent_ids: Vec<String> = self.registry.lock().keys().cloned().collect();
        for agent_id in agent_ids {
            if let Err(e) = self.stop_agent(&agent_id).await {
                tracing::warn!(agent = %agent_id, error = %e, "browser stop failed");
            }
        }
    }
}

fn launch_args(port: u16, user_data_dir: &Path) -> Vec<String> {
    vec![
        format!("--remote-debugging-port={}", port),
        "--remote-debugging-address=127.0.0.1".to_string(),
        "--no-first-run".to_string(),
        "--no-default-browser-check".to_string(),
        format!("--user-data-dir={}", user_data_dir.display()),
    ]
}

#[cfg(unix)]
fn terminate(pid: u32) {
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid;
    if let Err(e) = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        tracing::warn!(pid, error = %e, "SIGTERM failed");
    }
}

#[cfg(not(unix))]
fn terminate(pid: u32) {
    let _ = std::process::Command::new("taskkill")
        .args(["/PID", &pid.to_string()])
        .status();
}

#[cfg(target_os = "macos")]
fn well_known_paths() -> Vec<(&'static str, PathBuf)> {
    vec![
        (
            "chrome",
            PathBuf::from("/Applications/Google Chrome.app/Contents/MacOS/Google Chrome"),
        ),
        (
            "chromium",
            PathBuf::from("/Applications/Chromium.app/Contents/MacOS/Chromium"),
        ),
    ]
}

#[cfg(target_os = "linux")]
fn well_known_paths() -> Vec<(&'static str, PathBuf)> {
    vec![
        ("chrome", PathBuf::from("/usr/bin/google-chrome")),
        ("chrome", PathBuf::from("/usr/bin/google-chrome-stable")),
        ("chromium", PathBuf::from("/usr/bin/chromium")),
        ("chromium", PathBuf::from("/usr/bin/chromium-browser")),
    ]
}

#[cfg(target_os = "windows")]
fn well_known_paths() -> Vec<(&'static str, PathBuf)> {
    vec![(
        "chrome",
        PathBuf::from(r"C:\Program Files\Google\Chrome\Application\chrome.exe"),
    )]
}

/// Browser user data root for profile enumeration.
#[cfg(target_os = "macos")]
fn user_data_root() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join("Library/Application Support/Google/Chrome"))
}

#[cfg(target_os = "linux")]
fn user_data_root() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".config/google-chrome"))
}

#[cfg(target_os = "windows")]
fn user_data_root() -> Option<PathBuf> {
    dirs::data_local_dir().map(|dir| dir.join(r"Google\Chrome\User Data"))
}

fn list_profiles(_binary: &Path) -> Vec<BrowserProfile> {
    let Some(root) = user_data_root() else {
        return Vec::new();
    };
    let Ok(entries) = std::fs::read_dir(&root) else {
        return Vec::new();
    };
    let mut profiles = Vec::new();
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().to_string();
        if name == "Default" || name.starts_with("Profile ") {
            profiles.push(BrowserProfile {
                id: name.clone(),
                name,
            });
        }
    }
    profiles.sort_by(|a, b| a.id.cmp(&b.id));
    profiles
}

/// Copy the selected profile's session data into the scratch dir. Only
/// the lightweight session state is copied, not caches.
fn seed_profile(_binary: &Path, profile_id: &str, scratch: &Path) -> std::io::Result<()> {
    let Some(root) = user_data_root() else {
        return Ok(());
    };
    let source = root.join(profile_id);
    if !source.is_dir() {
        return Ok(());
    }
    let target = scratch.join("Default");
    std::fs::create_dir_all(&target)?;
    for file in ["Cookies", "Login Data", "Preferences", "Web Data"] {
        let from = source.join(file);
        if from.is_file() {
            std::fs::copy(&from, target.join(file))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_launch_args_shape() {
        let args = launch_args(9333, Path::new("/tmp/profile"));
        assert!(args.contains(&"--remote-debugging-port=9333".to_string()));
        assert!(args.contains(&"--remote-debugging-address=127.0.0.1".to_string()));
        assert!(args.contains(&"--no-first-run".to_string()));
        assert!(args.contains(&"--user-data-dir=/tmp/profile".to_string()));
    }

    #[tokio::test]
    async fn test_ensure_running_without_browser_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = HostBrowserManager::new(tmp.path());
        manager.set_browser_path(tmp.path().join("does-not-exist"));

        let err = manager.ensure_running("a1", None).await.unwrap_err();
        assert!(matches!(err, RuntimeError::Io(_)));
    }

    #[tokio::test]
    async fn test_ensure_running_times_out_when_port_never_opens() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = HostBrowserManager::new(tmp.path());
        // `sleep` swallows our flags and never opens a port.
        manager.set_browser_path("/bin/sleep");
        *manager.port_wait_timeout.lock() = Duration::from_millis(200);

        let result = manager.ensure_running("a1", None).await;
        assert!(matches!(result, Err(RuntimeError::StartTimeout(_))));
        assert!(manager.active_port("a1").is_none());
    }

    #[tokio::test]
    async fn test_stop_missing_agent_is_ok() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = HostBrowserManager::new(tmp.path());
        manager.stop_agent("ghost").await.unwrap();
    }

    #[test]
    fn test_scratch_dir_per_agent() {
        let manager = HostBrowserManager::new("/data/host-browser-profiles");
        assert_eq!(
            manager.scratch_dir("a1"),
            PathBuf::from("/data/host-browser-profiles/a1")
        );
    }
}
