//! Shared fixture for integration tests: a full `AppState` wired to a
//! stub runner and a stub in-container agent.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use waystation_core::{
    AgentService, BootConfig, Database, EventBus, SessionService, SettingsStore,
};
use waystation_runtime::test_utils::{spawn_stub_agent, StubAgentLog, StubRunner};
use waystation_runtime::{
    AvailabilityCache, ContainerManager, ContainerRunner, HostBrowserManager, ManagerConfig,
    ReadinessController, RunnerSet,
};
use waystation_server::proxy::broker::{BrokeredToken, InitiatedConnection, TokenBroker};
use waystation_server::proxy::{Allowlist, ProxyService};
use waystation_server::AppState;

pub struct StaticBroker {
    pub token: String,
}

#[async_trait]
impl TokenBroker for StaticBroker {
    async fn initiate_connection(
        &self,
        _toolkit: &str,
    ) -> waystation_core::Result<InitiatedConnection> {
        Err(waystation_core::Error::Upstream("not used".into()))
    }
    async fn connection_active(&self, _connection_id: &str) -> waystation_core::Result<bool> {
        Ok(true)
    }
    async fn fetch_token(&self, _connection_id: &str) -> waystation_core::Result<BrokeredToken> {
        Ok(BrokeredToken {
            access_token: self.token.clone(),
            expires_at: Utc::now() + chrono::Duration::minutes(30),
        })
    }
}

pub struct Fixture {
    pub state: AppState,
    pub runner: Arc<StubRunner>,
    pub agent_log: Arc<StubAgentLog>,
    pub _tmp: tempfile::TempDir,
}

/// Build a fixture whose proxy reaches plain-HTTP loopback upstreams and
/// whose broker always vends `real-token`.
pub async fn fixture() -> Fixture {
    let tmp = tempfile::tempdir().unwrap();
    let boot = BootConfig::for_data_dir(tmp.path().join("data"));
    boot.ensure_layout().unwrap();

    let (agent_port, agent_log) = spawn_stub_agent().await;
    let runner = StubRunner::ready(agent_port);

    let bus = Arc::new(EventBus::new());
    let readiness = Arc::new(ReadinessController::new(bus.clone()));
    let mut config = ManagerConfig::new("test-image", boot.agents_dir());
    config.start_timeout = Duration::from_secs(5);
    let manager = ContainerManager::new(
        runner.clone() as Arc<dyn ContainerRunner>,
        config,
        readiness.clone(),
        bus.clone(),
    );
    readiness
        .check(runner.clone() as Arc<dyn ContainerRunner>, "test-image".into())
        .await;

    let db = Database::open_in_memory().unwrap();
    let mut allowlist = Allowlist::builtin();
    allowlist.insert("gmail", &["127.0.0.1"]);
    let proxy = ProxyService::new(
        db.clone(),
        Arc::new(StaticBroker {
            token: "real-token".into(),
        }),
    )
    .with_allowlist(allowlist)
    .with_upstream_scheme("http");

    let state = AppState {
        db: db.clone(),
        agents: Arc::new(AgentService::new(boot.agents_dir())),
        sessions: Arc::new(SessionService::new(boot.agents_dir())),
        settings: Arc::new(SettingsStore::new(boot.settings_path())),
        bus,
        manager,
        browser: HostBrowserManager::new(boot.browser_profiles_dir()),
        readiness,
        runners: RunnerSet::new(vec![runner.clone() as Arc<dyn ContainerRunner>]),
        availability: Arc::new(AvailabilityCache::new()),
        proxy: Arc::new(proxy),
        mcp_oauth: Arc::new(parking_lot::Mutex::new(HashMap::new())),
        protocol_scheme: "waystation".into(),
        anthropic_base_url: "http://127.0.0.1:9".into(),
    };

    Fixture {
        state,
        runner,
        agent_log,
        _tmp: tmp,
    }
}
