//! Per-agent container lifecycle manager.
//!
//! Owns the status cache the UI polls, the per-agent operation locks that
//! linearize start/stop, the 2s status sync ticker, the 15s health
//! monitor, and an exit watcher per running container. All lifecycle
//! transitions are pushed as `agent_status_changed` events; health
//! problems surface as warnings, never as hard state changes.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::task::JoinHandle;

use waystation_core::error::{Error, Result};
use waystation_core::events::{Event, EventBus};
use waystation_core::types::{ContainerState, ContainerStatus, ResourceLimits, RuntimeReadiness};

use crate::readiness::ReadinessController;
use crate::runner::{ContainerRunner, RunSpec};

/// Concurrency bound for `stop_all`.
const STOP_ALL_PARALLELISM: usize = 4;

/// Tunables for the manager. Defaults match production; tests shrink the
/// intervals.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub image: String,
    pub limits: ResourceLimits,
    /// Extra environment for the agent container.
    pub env: Vec<(String, String)>,
    /// Root of agent directories; each agent's workspace is mounted at
    /// `/workspace`.
    pub agents_dir: PathBuf,
    pub start_timeout: Duration,
    pub sync_interval: Duration,
    pub health_interval: Duration,
}

impl ManagerConfig {
    pub fn new(image: impl Into<String>, agents_dir: impl Into<PathBuf>) -> Self {
        Self {
            image: image.into(),
            limits: ResourceLimits::default(),
            env: Vec::new(),
            agents_dir: agents_dir.into(),
            start_timeout: Duration::from_secs(60),
            sync_interval: Duration::from_secs(2),
            health_interval: Duration::from_secs(15),
        }
    }
}

/// Produces per-agent environment (e.g. the synthetic proxy token) at
/// container start time.
pub type EnvProvider = Arc<dyn Fn(&str) -> Vec<(String, String)> + Send + Sync>;

pub struct ContainerManager {
    runner: Mutex<Arc<dyn ContainerRunner>>,
    config: Mutex<ManagerConfig>,
    readiness: Arc<ReadinessController>,
    statuses: Mutex<HashMap<String, ContainerStatus>>,
    op_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    exit_watchers: Mutex<HashMap<String, JoinHandle<()>>>,
    monitors: Mutex<Vec<JoinHandle<()>>>,
    env_provider: Mutex<Option<EnvProvider>>,
    bus: Arc<EventBus>,
    http: reqwest::Client,
}

impl ContainerManager {
    pub fn new(
        runner: Arc<dyn ContainerRunner>,
        config: ManagerConfig,
        readiness: Arc<ReadinessController>,
        bus: Arc<EventBus>,
    ) -> Arc<Self> {
        Arc::new(Self {
            runner: Mutex::new(runner),
            config: Mutex::new(config),
            readiness,
            statuses: Mutex::new(HashMap::new()),
            op_locks: Mutex::new(HashMap::new()),
            exit_watchers: Mutex::new(HashMap::new()),
            monitors: Mutex::new(Vec::new()),
            env_provider: Mutex::new(None),
            bus,
            http: reqwest::Client::new(),
        })
    }

    /// Install a hook that contributes per-agent environment variables at
    /// start time.
    pub fn set_env_provider(&self, provider: EnvProvider) {
        *self.env_provider.lock() = Some(provider);
    }

    pub fn runner(&self) -> Arc<dyn ContainerRunner> {
        self.runner.lock().clone()
    }

    /// Swap the active runtime. Refused while any agent is running.
    pub fn set_runner(&self, runner: Arc<dyn ContainerRunner>) -> Result<()> {
        if self.has_running_agents() {
            return Err(Error::Conflict(
                "cannot change container runtime while agents are running".into(),
            ));
        }
        *self.runner.lock() = runner;
        Ok(())
    }

    pub fn set_image_and_limits(&self, image: String, limits: ResourceLimits) {
        let mut config = self.config.lock();
        config.image = image;
        config.limits = limits;
    }

    fn config_snapshot(&self) -> ManagerConfig {
        self.config.lock().clone()
    }

    // ------------------------------------------------------------------
    // Status cache
    // ------------------------------------------------------------------

    /// Lock-free-ish snapshot for one agent; unknown agents read as
    /// stopped.
    pub fn status(&self, agent_slug: &str) -> ContainerStatus {
        self.statuses
            .lock()
            .get(agent_slug)
            .cloned()
            .unwrap_or_else(ContainerStatus::stopped)
    }

    pub fn statuses(&self) -> HashMap<String, ContainerStatus> {
        self.statuses.lock().clone()
    }

    pub fn has_running_agents(&self) -> bool {
        self.statuses.lock().values().any(|status| {
            matches!(
                status.status,
                ContainerState::Running | ContainerState::Starting | ContainerState::Stopping
            )
        })
    }

    fn set_state(&self, agent_slug: &str, state: ContainerState, port: Option<u16>) {
        let changed = {
            let mut statuses = self.statuses.lock();
            let entry = statuses
                .entry(agent_slug.to_string())
                .or_insert_with(ContainerStatus::stopped);
            let changed = entry.status != state;
            entry.status = state;
            entry.port = port;
            match state {
                ContainerState::Running => {
                    if entry.started_at.is_none() {
                        entry.started_at = Some(Utc::now());
                    }
                }
                ContainerState::Stopped | ContainerState::Error => {
                    entry.started_at = None;
                    entry.warnings.clear();
                }
                _ => {}
            }
            changed
        };
        if changed {
            self.bus.publish(Event::AgentStatusChanged {
                agent_slug: agent_slug.to_string(),
                status: state,
            });
        }
    }

    fn op_lock(&self, agent_slug: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.op_locks
            .lock()
            .entry(agent_slug.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Seed the status cache by inspecting each known agent once.
    pub async fn initialize_agents(&self, agent_slugs: &[String]) {
        let runner = self.runner();
        for slug in agent_slugs {
            let status = match runner.inspect(slug).await {
                Ok(inspect) if inspect.running => ContainerStatus {
                    status: ContainerState::Running,
                    port: inspect.port,
                    warnings: Vec::new(),
                    started_at: Some(Utc::now()),
                },
                _ => ContainerStatus::stopped(),
            };
            self.statuses.lock().insert(slug.clone(), status);
        }
    }

    /// Start the agent's container. Idempotent: an already-running agent
    /// returns its existing port.
    pub async fn start(self: &Arc<Self>, agent_slug: &str) -> Result<u16> {
        let lock = self.op_lock(agent_slug);
        let _guard = lock.lock().await;

        let current = self.status(agent_slug);
        if current.status == ContainerState::Running {
            if let Some(port) = current.port {
                return Ok(port);
            }
        }

        match self.readiness.current() {
            RuntimeReadiness::RuntimeUnavailable => {
                return Err(Error::RuntimeUnavailable(
                    "container runtime is not running".into(),
                ));
            }
            RuntimeReadiness::PullingImage => {
                return Err(Error::ImagePullFailed(
                    "agent image pull is in progress; retry when it completes".into(),
                ));
            }
            _ => {}
        }

        let runner = self.runner();
        let config = self.config_snapshot();

        match runner.image_exists(&config.image).await {
            Ok(true) => {}
            Ok(false) => {
                self.readiness.begin_pull(runner.clone(), config.image.clone());
                return Err(Error::ImagePullFailed(
                    "agent image not present; pull started".into(),
                ));
            }
            Err(e) => return Err(e.into()),
        }

        self.set_state(agent_slug, ContainerState::Starting, None);

        let mut env = config.env.clone();
        if let Some(provider) = self.env_provider.lock().clone() {
            env.extend(provider(agent_slug));
        }
        let spec = RunSpec {
            agent_slug: agent_slug.to_string(),
            image: config.image.clone(),
            limits: config.limits.clone(),
            env,
            mounts: vec![(
                config.agents_dir.join(agent_slug).join("workspace"),
                "/workspace".to_string(),
            )],
        };

        let started = match runner.run(&spec).await {
            Ok(started) => started,
            Err(e) => {
                self.set_state(agent_slug, ContainerState::Error, None);
                return Err(e.into());
            }
        };

        if !self.wait_healthy(started.port, config.start_timeout).await {
            let _ = runner.stop(agent_slug).await;
            self.set_state(agent_slug, ContainerState::Error, None);
            return Err(Error::Internal(format!(
                "container for {} did not become healthy within {:?}",
                agent_slug, config.start_timeout
            )));
        }

        self.set_state(agent_slug, ContainerState::Running, Some(started.port));
        self.spawn_exit_watcher(agent_slug);
        tracing::info!(agent = agent_slug, port = started.port, "agent container running");
        Ok(started.port)
    }

    async fn wait_healthy(&self, port: u16, timeout: Duration) -> bool {
        let url = format!("http://127.0.0.1:{}/healthz", port);
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let probe = self
                .http
                .get(&url)
                .timeout(Duration::from_secs(2))
                .send()
                .await;
            if matches!(probe, Ok(response) if response.status().is_success()) {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }

    /// Stop the agent's container. Idempotent.
    pub async fn stop(&self, agent_slug: &str) -> Result<()> {
        let lock = self.op_lock(agent_slug);
        let _guard = lock.lock().await;

        if self.status(agent_slug).status == ContainerState::Stopped {
            return Ok(());
        }

        // Our own stop must not read as an external exit.
        if let Some(watcher) = self.exit_watchers.lock().remove(agent_slug) {
            watcher.abort();
        }

        self.set_state(agent_slug, ContainerState::Stopping, None);
        let runner = self.runner();
        if let Err(e) = runner.stop(agent_slug).await {
            self.set_state(agent_slug, ContainerState::Error, None);
            return Err(e.into());
        }
        self.set_state(agent_slug, ContainerState::Stopped, None);
        tracing::info!(agent = agent_slug, "agent container stopped");
        Ok(())
    }

    /// Best-effort parallel stop of everything, bounded.
    pub async fn stop_all(self: &Arc<Self>) {
        let slugs: Vec<String> = {
            let statuses = self.statuses.lock();
            statuses
                .iter()
                .filter(|(_, status)| status.status != ContainerState::Stopped)
                .map(|(slug, _)| slug.clone())
                .collect()
        };
        futures::stream::iter(slugs)
            .for_each_concurrent(STOP_ALL_PARALLELISM, |slug| {
                let manager = self.clone();
                async move {
                    if let Err(e) = manager.stop(&slug).await {
                        tracing::warn!(agent = %slug, error = %e, "stop failed during stop_all");
                    }
                }
            })
            .await;
    }

    // ------------------------------------------------------------------
    // Monitors
    // ------------------------------------------------------------------

    /// Reconcile the cache against `inspect` for every known agent.
    ///
    /// Agents mid-operation (lock held) are skipped; the next cycle
    /// catches them. Transient inspect errors raise a warning and retry
    /// on the next sync rather than flipping state.
    pub async fn sync_once(&self) {
        let slugs: Vec<String> = self.statuses.lock().keys().cloned().collect();
        let runner = self.runner();
        for slug in slugs {
            let lock = self.op_lock(&slug);
            let Ok(_guard) = lock.try_lock() else {
                continue;
            };
            match runner.inspect(&slug).await {
                Ok(inspect) => {
                    let cached = self.status(&slug);
                    match (cached.status, inspect.running) {
                        (ContainerState::Running, false) => {
                            tracing::warn!(agent = %slug, "container exited unexpectedly");
                            if let Some(watcher) = self.exit_watchers.lock().remove(&slug) {
                                watcher.abort();
                            }
                            self.set_state(&slug, ContainerState::Stopped, None);
                        }
                        (ContainerState::Stopped | ContainerState::Error, true) => {
                            self.set_state(&slug, ContainerState::Running, inspect.port);
                        }
                        (ContainerState::Running, true) if cached.port != inspect.port => {
                            self.set_state(&slug, ContainerState::Running, inspect.port);
                        }
                        _ => {}
                    }
                }
                Err(e) => {
                    self.push_warning(&slug, format!("status sync: {}", e));
                }
            }
        }
    }

    /// Probe `/healthz` on every running agent and update warnings.
    pub async fn health_once(&self) {
        let targets: Vec<(String, u16)> = {
            let statuses = self.statuses.lock();
            statuses
                .iter()
                .filter(|(_, status)| status.status == ContainerState::Running)
                .filter_map(|(slug, status)| status.port.map(|port| (slug.clone(), port)))
                .collect()
        };
        for (slug, port) in targets {
            let url = format!("http://127.0.0.1:{}/healthz", port);
            let probe = self
                .http
                .get(&url)
                .timeout(Duration::from_secs(5))
                .send()
                .await;
            match probe {
                Ok(response) if response.status().is_success() => self.clear_warnings(&slug),
                Ok(response) => {
                    self.push_warning(&slug, format!("health check returned {}", response.status()))
                }
                Err(e) => self.push_warning(&slug, format!("health check failed: {}", e)),
            }
        }
    }

    fn push_warning(&self, agent_slug: &str, warning: String) {
        let changed = {
            let mut statuses = self.statuses.lock();
            let entry = statuses
                .entry(agent_slug.to_string())
                .or_insert_with(ContainerStatus::stopped);
            if entry.warnings.contains(&warning) {
                false
            } else {
                entry.warnings.push(warning);
                true
            }
        };
        if changed {
            self.publish_health(agent_slug);
        }
    }

    fn clear_warnings(&self, agent_slug: &str) {
        let changed = {
            let mut statuses = self.statuses.lock();
            match statuses.get_mut(agent_slug) {
                Some(entry) if !entry.warnings.is_empty() => {
                    entry.warnings.clear();
                    true
                }
                _ => false,
            }
        };
        if changed {
            self.publish_health(agent_slug);
        }
    }

    fn publish_health(&self, agent_slug: &str) {
        let warnings = self.status(agent_slug).warnings;
        self.bus.publish(Event::ContainerHealthChanged {
            agent_slug: agent_slug.to_string(),
            warnings,
        });
    }

    /// Watch the runtime's event stream for this agent and reconcile as
    /// soon as the container dies, rather than waiting for the next sync.
    fn spawn_exit_watcher(self: &Arc<Self>, agent_slug: &str) {
        let manager = self.clone();
        let slug = agent_slug.to_string();
        let handle = tokio::spawn(async move {
            let runner = manager.runner();
            let Ok(mut rx) = runner.events(&slug).await else {
                // The sync ticker still catches exits.
                return;
            };
            while let Some(event) = rx.recv().await {
                if matches!(event.action.as_str(), "die" | "stop" | "kill") {
                    manager.sync_once().await;
                    break;
                }
            }
        });
        if let Some(previous) = self
            .exit_watchers
            .lock()
            .insert(agent_slug.to_string(), handle)
        {
            previous.abort();
        }
    }

    /// Start the status sync and health monitor tickers.
    pub fn spawn_monitors(self: &Arc<Self>) {
        let config = self.config_snapshot();

        let manager = self.clone();
        let sync = tokio::spawn(async move {
            let mut tick = tokio::time::interval(config.sync_interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tick.tick().await;
                manager.sync_once().await;
            }
        });

        let manager = self.clone();
        let health = tokio::spawn(async move {
            let mut tick = tokio::time::interval(config.health_interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tick.tick().await;
                manager.health_once().await;
            }
        });

        let mut monitors = self.monitors.lock();
        monitors.push(sync);
        monitors.push(health);
    }

    /// Stop monitors and containers. Called once at shutdown.
    pub async fn shutdown(self: &Arc<Self>) {
        for handle in self.monitors.lock().drain(..) {
            handle.abort();
        }
        for (_, handle) in self.exit_watchers.lock().drain() {
            handle.abort();
        }
        self.stop_all().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{RuntimeError, RuntimeResult};
    use crate::runner::{
        Availability, ExecOutput, InspectResult, PullProgress, RunningContainer, RuntimeEvent,
    };
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::io::AsyncWriteExt;
    use tokio::sync::mpsc;
    use waystation_core::types::RunnerKind;

    /// Minimal HTTP responder standing in for the in-container runtime's
    /// `/healthz`.
    async fn spawn_healthz_server() -> u16 {
        let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    use tokio::io::AsyncReadExt;
                    let _ = socket.read(&mut buf).await;
                    let _ = socket
                        .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 0\r\n\r\n")
                        .await;
                });
            }
        });
        port
    }

    #[derive(Default)]
    struct MockRunner {
        run_port: Mutex<Option<u16>>,
        run_calls: AtomicUsize,
        stop_calls: AtomicUsize,
        image_present: AtomicBool,
        inspect: Mutex<HashMap<String, InspectResult>>,
        inspect_fails: AtomicBool,
    }

    impl MockRunner {
        fn new(run_port: u16) -> Arc<Self> {
            let runner = Arc::new(Self::default());
            *runner.run_port.lock() = Some(run_port);
            runner.image_present.store(true, Ordering::SeqCst);
            runner
        }
    }

    #[async_trait]
    impl ContainerRunner for MockRunner {
        fn kind(&self) -> RunnerKind {
            RunnerKind::Docker
        }
        async fn availability(&self) -> Availability {
            Availability {
                installed: true,
                running: true,
                can_start: true,
            }
        }
        async fn start_daemon(&self) -> RuntimeResult<()> {
            Ok(())
        }
        async fn image_exists(&self, _image: &str) -> RuntimeResult<bool> {
            Ok(self.image_present.load(Ordering::SeqCst))
        }
        async fn pull_image(
            &self,
            _image: &str,
            _progress: mpsc::Sender<PullProgress>,
        ) -> RuntimeResult<()> {
            Ok(())
        }
        async fn run(&self, spec: &RunSpec) -> RuntimeResult<RunningContainer> {
            self.run_calls.fetch_add(1, Ordering::SeqCst);
            let port = self.run_port.lock().unwrap_or(0);
            self.inspect.lock().insert(
                spec.agent_slug.clone(),
                InspectResult {
                    running: true,
                    port: Some(port),
                },
            );
            Ok(RunningContainer {
                container_id: format!("cid-{}", spec.agent_slug),
                port,
            })
        }
        async fn stop(&self, agent_slug: &str) -> RuntimeResult<()> {
            self.stop_calls.fetch_add(1, Ordering::SeqCst);
            self.inspect
                .lock()
                .insert(agent_slug.to_string(), InspectResult::default());
            Ok(())
        }
        async fn inspect(&self, agent_slug: &str) -> RuntimeResult<InspectResult> {
            if self.inspect_fails.load(Ordering::SeqCst) {
                return Err(RuntimeError::CommandFailed {
                    command: "docker inspect".into(),
                    stderr: "daemon hiccup".into(),
                });
            }
            Ok(self
                .inspect
                .lock()
                .get(agent_slug)
                .copied()
                .unwrap_or_default())
        }
        async fn exec(
            &self,
            _agent_slug: &str,
            _cmd: &[String],
            _stdin: Option<&str>,
        ) -> RuntimeResult<ExecOutput> {
            Ok(ExecOutput {
                stdout: String::new(),
                stderr: String::new(),
                exit_code: 0,
            })
        }
        async fn events(&self, _agent_slug: &str) -> RuntimeResult<mpsc::Receiver<RuntimeEvent>> {
            // Never yields; exit detection in tests goes through sync.
            let (tx, rx) = mpsc::channel(1);
            std::mem::forget(tx);
            Ok(rx)
        }
    }

    fn build_manager(runner: Arc<MockRunner>) -> (Arc<ContainerManager>, Arc<EventBus>) {
        let bus = Arc::new(EventBus::new());
        let readiness = Arc::new(ReadinessController::new(bus.clone()));
        let mut config = ManagerConfig::new("test-image", "/tmp/agents");
        config.start_timeout = Duration::from_secs(5);
        let manager = ContainerManager::new(runner, config, readiness, bus.clone());
        (manager, bus)
    }

    #[tokio::test]
    async fn test_start_is_idempotent_same_port() {
        let port = spawn_healthz_server().await;
        let runner = MockRunner::new(port);
        let (manager, _bus) = build_manager(runner.clone());

        let first = manager.start("a1").await.unwrap();
        let second = manager.start("a1").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(runner.run_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_start_publishes_transitions() {
        let port = spawn_healthz_server().await;
        let runner = MockRunner::new(port);
        let (manager, bus) = build_manager(runner);
        let mut rx = bus.subscribe();

        manager.start("a1").await.unwrap();

        let mut states = Vec::new();
        while let Ok(line) = rx.try_recv() {
            let value: serde_json::Value = serde_json::from_str(&line).unwrap();
            if value["type"] == "agent_status_changed" {
                states.push(value["status"].as_str().unwrap().to_string());
            }
        }
        assert_eq!(states, vec!["starting", "running"]);
    }

    #[tokio::test]
    async fn test_start_missing_image_enqueues_pull() {
        let port = spawn_healthz_server().await;
        let runner = MockRunner::new(port);
        runner.image_present.store(false, Ordering::SeqCst);
        let (manager, _bus) = build_manager(runner);

        let err = manager.start("a1").await.unwrap_err();
        assert!(matches!(err, Error::ImagePullFailed(_)));
    }

    #[tokio::test]
    async fn test_start_unhealthy_container_errors_and_kills() {
        // Port that nothing listens on: the health wait must time out.
        let dead_port = crate::ports::alloc_free_port().await.unwrap();
        let runner = MockRunner::new(dead_port);
        let (manager, _bus) = build_manager(runner.clone());
        {
            let mut config = manager.config.lock();
            config.start_timeout = Duration::from_millis(300);
        }

        let err = manager.start("a1").await.unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
        assert_eq!(manager.status("a1").status, ContainerState::Error);
        assert_eq!(runner.stop_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stop_updates_cache_and_inspect_agrees() {
        let port = spawn_healthz_server().await;
        let runner = MockRunner::new(port);
        let (manager, _bus) = build_manager(runner.clone());

        manager.start("a1").await.unwrap();
        manager.stop("a1").await.unwrap();
        assert_eq!(manager.status("a1").status, ContainerState::Stopped);

        manager.sync_once().await;
        assert_eq!(manager.status("a1").status, ContainerState::Stopped);
    }

    #[tokio::test]
    async fn test_unexpected_exit_flips_to_stopped_once() {
        let port = spawn_healthz_server().await;
        let runner = MockRunner::new(port);
        let (manager, bus) = build_manager(runner.clone());
        manager.start("a1").await.unwrap();
        let mut rx = bus.subscribe();

        // Simulate the container dying behind our back.
        runner
            .inspect
            .lock()
            .insert("a1".into(), InspectResult::default());
        manager.sync_once().await;
        manager.sync_once().await;

        assert_eq!(manager.status("a1").status, ContainerState::Stopped);
        let mut stopped_events = 0;
        while let Ok(line) = rx.try_recv() {
            let value: serde_json::Value = serde_json::from_str(&line).unwrap();
            if value["type"] == "agent_status_changed" && value["status"] == "stopped" {
                stopped_events += 1;
            }
        }
        assert_eq!(stopped_events, 1);
    }

    #[tokio::test]
    async fn test_transient_inspect_error_is_warning_not_state_change() {
        let port = spawn_healthz_server().await;
        let runner = MockRunner::new(port);
        let (manager, _bus) = build_manager(runner.clone());
        manager.start("a1").await.unwrap();

        runner.inspect_fails.store(true, Ordering::SeqCst);
        manager.sync_once().await;

        let status = manager.status("a1");
        assert_eq!(status.status, ContainerState::Running);
        assert!(!status.warnings.is_empty());

        // Recovery clears on the next health pass.
        runner.inspect_fails.store(false, Ordering::SeqCst);
        manager.health_once().await;
        assert!(manager.status("a1").warnings.is_empty());
    }

    #[tokio::test]
    async fn test_health_warning_for_dead_endpoint() {
        let port = spawn_healthz_server().await;
        let runner = MockRunner::new(port);
        let (manager, bus) = build_manager(runner.clone());
        manager.start("a1").await.unwrap();
        let mut rx = bus.subscribe();

        // Point the cached status at a dead port.
        let dead_port = crate::ports::alloc_free_port().await.unwrap();
        manager
            .statuses
            .lock()
            .get_mut("a1")
            .unwrap()
            .port = Some(dead_port);

        manager.health_once().await;
        assert!(!manager.status("a1").warnings.is_empty());
        assert_eq!(manager.status("a1").status, ContainerState::Running);

        let line = rx.recv().await.unwrap();
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["type"], "container_health_changed");
    }

    #[tokio::test]
    async fn test_set_runner_refused_while_running() {
        let port = spawn_healthz_server().await;
        let runner = MockRunner::new(port);
        let (manager, _bus) = build_manager(runner.clone());
        manager.start("a1").await.unwrap();

        let replacement = MockRunner::new(port);
        let err = manager
            .set_runner(replacement as Arc<dyn ContainerRunner>)
            .unwrap_err();
        assert!(err.is_conflict());

        manager.stop("a1").await.unwrap();
        let replacement = MockRunner::new(port);
        manager
            .set_runner(replacement as Arc<dyn ContainerRunner>)
            .unwrap();
    }

    #[tokio::test]
    async fn test_stop_all_stops_everything() {
        let port = spawn_healthz_server().await;
        let runner = MockRunner::new(port);
        let (manager, _bus) = build_manager(runner.clone());
        manager.start("a1").await.unwrap();
        manager.start("a2").await.unwrap();

        manager.stop_all().await;
        assert_eq!(manager.status("a1").status, ContainerState::Stopped);
        assert_eq!(manager.status("a2").status, ContainerState::Stopped);
        assert!(!manager.has_running_agents());
    }

    #[tokio::test]
    async fn test_initialize_agents_seeds_cache() {
        let port = spawn_healthz_server().await;
        let runner = MockRunner::new(port);
        runner.inspect.lock().insert(
            "pre-existing".into(),
            InspectResult {
                running: true,
                port: Some(port),
            },
        );
        let (manager, _bus) = build_manager(runner);

        manager
            .initialize_agents(&["pre-existing".to_string(), "cold".to_string()])
            .await;
        assert_eq!(
            manager.status("pre-existing").status,
            ContainerState::Running
        );
        assert_eq!(manager.status("cold").status, ContainerState::Stopped);
    }
}
