//! Uniform interface over container runtimes.
//!
//! Docker, Podman, and the macOS-native `container` CLI all speak nearly
//! the same command language; the trait pins down the subset the control
//! plane needs and [`crate::cli_runner::CliRunner`] implements it by
//! shelling out. Tests substitute in-memory fakes.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;

use waystation_core::types::{ResourceLimits, RunnerKind};

use crate::error::RuntimeResult;

/// Result of probing a runtime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Availability {
    /// The CLI binary exists.
    pub installed: bool,
    /// The daemon answers.
    pub running: bool,
    /// We know how to start the daemon on this platform.
    pub can_start: bool,
}

/// Everything needed to run an agent container.
#[derive(Debug, Clone)]
pub struct RunSpec {
    pub agent_slug: String,
    pub image: String,
    pub limits: ResourceLimits,
    pub env: Vec<(String, String)>,
    /// Host path → container path bind mounts.
    pub mounts: Vec<(PathBuf, String)>,
}

/// Handle to a started container.
#[derive(Debug, Clone)]
pub struct RunningContainer {
    pub container_id: String,
    /// Host port mapped to the agent's in-container HTTP port.
    pub port: u16,
}

/// Point-in-time container state as the runtime reports it.
#[derive(Debug, Clone, Copy, Default)]
pub struct InspectResult {
    pub running: bool,
    pub port: Option<u16>,
}

/// Captured output of an exec.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

/// One layer's pull progress, as reported over the pull's progress sink
/// and surfaced by the runtime-status poll.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PullProgress {
    pub layer: String,
    pub percent: u8,
}

/// A container lifecycle event from the runtime's event stream.
#[derive(Debug, Clone)]
pub struct RuntimeEvent {
    /// Runtime action, e.g. `start`, `die`, `stop`.
    pub action: String,
}

/// The in-container HTTP port every agent image listens on.
pub const AGENT_CONTAINER_PORT: u16 = 8080;

/// Deterministic container name for an agent.
pub fn container_name(agent_slug: &str) -> String {
    format!("waystation-agent-{}", agent_slug)
}

/// Operations every supported runtime provides.
#[async_trait]
pub trait ContainerRunner: Send + Sync {
    fn kind(&self) -> RunnerKind;

    /// Probe the runtime. Never fails; absence is a state, not an error.
    async fn availability(&self) -> Availability;

    /// Start the daemon (Docker Desktop, podman machine, ...).
    async fn start_daemon(&self) -> RuntimeResult<()>;

    /// Is the image present locally?
    async fn image_exists(&self, image: &str) -> RuntimeResult<bool>;

    /// Pull an image, reporting per-layer progress on `progress`.
    async fn pull_image(
        &self,
        image: &str,
        progress: mpsc::Sender<PullProgress>,
    ) -> RuntimeResult<()>;

    /// Start an agent container and return its id and mapped host port.
    async fn run(&self, spec: &RunSpec) -> RuntimeResult<RunningContainer>;

    /// Stop (and remove) the agent's container. Missing containers are
    /// not an error.
    async fn stop(&self, agent_slug: &str) -> RuntimeResult<()>;

    /// Current state of the agent's container.
    async fn inspect(&self, agent_slug: &str) -> RuntimeResult<InspectResult>;

    /// Run a command inside the container.
    async fn exec(
        &self,
        agent_slug: &str,
        cmd: &[String],
        stdin: Option<&str>,
    ) -> RuntimeResult<ExecOutput>;

    /// Stream lifecycle events for the agent's container.
    async fn events(&self, agent_slug: &str) -> RuntimeResult<mpsc::Receiver<RuntimeEvent>>;
}

/// Registry of the runners this host supports.
#[derive(Clone)]
pub struct RunnerSet {
    runners: HashMap<RunnerKind, Arc<dyn ContainerRunner>>,
}

impl RunnerSet {
    pub fn new(runners: Vec<Arc<dyn ContainerRunner>>) -> Self {
        Self {
            runners: runners
                .into_iter()
                .map(|runner| (runner.kind(), runner))
                .collect(),
        }
    }

    pub fn get(&self, kind: RunnerKind) -> Option<Arc<dyn ContainerRunner>> {
        self.runners.get(&kind).cloned()
    }

    pub fn kinds(&self) -> Vec<RunnerKind> {
        self.runners.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_container_name() {
        assert_eq!(container_name("mail-bot-a1b2c3"), "waystation-agent-mail-bot-a1b2c3");
    }

    #[test]
    fn test_availability_default_is_absent() {
        let availability = Availability::default();
        assert!(!availability.installed);
        assert!(!availability.running);
        assert!(!availability.can_start);
    }
}
