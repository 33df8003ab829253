//! The `waystation` daemon.
//!
//! Boot order matters: configuration (env + settings file) is fully
//! resolved before any component is constructed, so no service ever
//! observes a half-initialized data directory or a stale runner choice.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use waystation_core::events::Event;
use waystation_core::types::RunnerKind;
use waystation_core::{
    AgentService, BootConfig, Database, EventBus, SessionService, SettingsStore,
};
use waystation_runtime::{
    AvailabilityCache, CliRunner, ContainerManager, ContainerRunner, HostBrowserManager,
    ManagerConfig, ReadinessController, RunnerSet,
};
use waystation_server::autosleep::AutoSleepMonitor;
use waystation_server::proxy::{ComposioBroker, ProxyService};
use waystation_server::scheduler::Scheduler;
use waystation_server::{build_router, AppState};

const COMPOSIO_BASE_URL: &str = "https://backend.composio.dev";
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(name = "waystation", about = "Control plane for the waystation agent workstation")]
struct Args {
    /// Data directory (overrides DATA_DIR).
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// HTTP listen port (overrides PORT).
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    // Resolve all configuration before constructing anything.
    let mut boot = BootConfig::from_env();
    if let Some(data_dir) = args.data_dir {
        boot.data_dir = data_dir;
    }
    if let Some(port) = args.port {
        boot.port = port;
    }
    boot.ensure_layout()?;

    let settings_store = Arc::new(SettingsStore::new(boot.settings_path()));
    let settings = settings_store.load()?;

    let db = Database::open(boot.db_path())?;
    let bus = Arc::new(EventBus::new());

    // Runtime stack.
    let runners = RunnerSet::new(vec![
        Arc::new(CliRunner::new(RunnerKind::Docker)) as Arc<dyn ContainerRunner>,
        Arc::new(CliRunner::new(RunnerKind::Podman)) as Arc<dyn ContainerRunner>,
        Arc::new(CliRunner::new(RunnerKind::Native)) as Arc<dyn ContainerRunner>,
    ]);
    let runner = runners
        .get(settings.container.container_runner)
        .ok_or_else(|| anyhow::anyhow!("configured runner is not supported on this host"))?;

    let availability = Arc::new(AvailabilityCache::new());
    availability.refresh(&runner).await;

    let readiness = Arc::new(ReadinessController::new(bus.clone()));
    let mut manager_config =
        ManagerConfig::new(settings.container.agent_image.clone(), boot.agents_dir());
    manager_config.limits = settings.container.resource_limits.clone();
    manager_config.env = container_env(&settings, &boot);
    let manager = ContainerManager::new(runner.clone(), manager_config, readiness.clone(), bus.clone());

    // Containers authenticate to the proxy with a per-agent synthetic
    // token injected at start time.
    {
        let db = db.clone();
        let proxy_port = boot.port;
        manager.set_env_provider(Arc::new(move |agent_slug| {
            let mut env = vec![(
                "WAYSTATION_PROXY_URL".to_string(),
                format!("http://host.docker.internal:{}/proxy", proxy_port),
            )];
            match db.ensure_token(agent_slug) {
                Ok(token) => env.push(("WAYSTATION_PROXY_TOKEN".to_string(), token)),
                Err(e) => tracing::warn!(agent = agent_slug, error = %e, "token mint failed"),
            }
            env
        }));
    }

    let agents = Arc::new(AgentService::new(boot.agents_dir()));
    let sessions = Arc::new(SessionService::new(boot.agents_dir()));

    // Seed the status cache, then keep it honest.
    let slugs: Vec<String> = agents.list()?.into_iter().map(|agent| agent.slug).collect();
    manager.initialize_agents(&slugs).await;
    manager.spawn_monitors();
    {
        let readiness = readiness.clone();
        let runner = runner.clone();
        let image = settings.container.agent_image.clone();
        tokio::spawn(async move {
            readiness.check(runner, image).await;
        });
    }

    // Host browser: external exits push an event and nudge the container.
    let browser = HostBrowserManager::new(boot.browser_profiles_dir());
    {
        let bus = bus.clone();
        let manager = manager.clone();
        browser.set_external_exit_handler(Arc::new(move |agent_id| {
            bus.publish(Event::BrowserActive {
                agent_id: agent_id.to_string(),
                active: false,
            });
            if let Some(port) = manager.status(agent_id).port {
                tokio::spawn(async move {
                    let url = format!("http://127.0.0.1:{}/browser/host-exited", port);
                    let _ = reqwest::Client::new()
                        .post(&url)
                        .timeout(Duration::from_secs(5))
                        .send()
                        .await;
                });
            }
        }));
    }

    // Credential proxy.
    let composio_api_key = settings
        .api_keys
        .composio_api_key
        .clone()
        .or_else(|| boot.composio_api_key.clone())
        .unwrap_or_default();
    let composio_user_id = settings
        .api_keys
        .composio_user_id
        .clone()
        .or_else(|| boot.composio_user_id.clone())
        .unwrap_or_default();
    let broker = Arc::new(ComposioBroker::new(
        COMPOSIO_BASE_URL,
        composio_api_key,
        composio_user_id,
    ));
    let proxy = Arc::new(ProxyService::new(db.clone(), broker));

    let state = AppState {
        db: db.clone(),
        agents,
        sessions: sessions.clone(),
        settings: settings_store.clone(),
        bus: bus.clone(),
        manager: manager.clone(),
        browser: browser.clone(),
        readiness,
        runners,
        availability,
        proxy,
        mcp_oauth: Arc::new(parking_lot::Mutex::new(HashMap::new())),
        protocol_scheme: boot.protocol_scheme.clone(),
        anthropic_base_url: "https://api.anthropic.com".to_string(),
    };

    // Background workers.
    let scheduler = Arc::new(Scheduler::new(
        db,
        sessions.clone(),
        manager.clone(),
        bus.clone(),
    ));
    let scheduler_handle = scheduler.spawn();
    let autosleep = AutoSleepMonitor::new(manager.clone(), sessions, settings_store);
    let autosleep_handle = autosleep.spawn();

    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", boot.port)).await?;
    tracing::info!(port = boot.port, data_dir = %boot.data_dir.display(), "waystation listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Shutdown: stop workers, then containers and browsers, then the
    // event stream; force-exit if cleanup hangs.
    tracing::info!("shutting down");
    scheduler_handle.abort();
    autosleep_handle.abort();
    let cleanup = async {
        manager.shutdown().await;
        browser.stop_all().await;
        bus.close_all();
    };
    if tokio::time::timeout(SHUTDOWN_GRACE, cleanup).await.is_err() {
        tracing::warn!("cleanup exceeded {:?}, forcing exit", SHUTDOWN_GRACE);
    }
    Ok(())
}

/// Environment every agent container receives.
fn container_env(
    settings: &waystation_core::Settings,
    boot: &BootConfig,
) -> Vec<(String, String)> {
    let mut env = Vec::new();
    if let Some(key) = settings
        .api_keys
        .anthropic_api_key
        .clone()
        .or_else(|| boot.anthropic_api_key.clone())
    {
        env.push(("ANTHROPIC_API_KEY".to_string(), key));
    }
    env.push((
        "WAYSTATION_AGENT_MODEL".to_string(),
        settings.models.agent_model.clone(),
    ));
    env.push((
        "WAYSTATION_SUMMARIZER_MODEL".to_string(),
        settings.models.summarizer_model.clone(),
    ));
    env.push((
        "WAYSTATION_BROWSER_MODEL".to_string(),
        settings.models.browser_model.clone(),
    ));
    for (key, value) in &settings.custom_env_vars {
        env.push((key.clone(), value.clone()));
    }
    env
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            tracing::error!(error = %e, "SIGTERM handler failed; ctrl-c only");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
