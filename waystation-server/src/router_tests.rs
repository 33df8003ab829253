use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use tower::ServiceExt;

use waystation_core::{
    AgentService, BootConfig, Database, EventBus, SessionService, SettingsStore,
};
use waystation_runtime::test_utils::{spawn_stub_agent, StubRunner};
use waystation_runtime::{
    AvailabilityCache, ContainerManager, ContainerRunner, HostBrowserManager, ManagerConfig,
    ReadinessController, RunnerSet,
};

use crate::proxy::broker::{BrokeredToken, InitiatedConnection, TokenBroker};
use crate::proxy::ProxyService;
use crate::state::AppState;

use super::build_router;

struct NullBroker;

#[async_trait::async_trait]
impl TokenBroker for NullBroker {
    async fn initiate_connection(
        &self,
        _toolkit: &str,
    ) -> waystation_core::Result<InitiatedConnection> {
        Err(waystation_core::Error::Upstream("no broker in tests".into()))
    }
    async fn connection_active(&self, _connection_id: &str) -> waystation_core::Result<bool> {
        Ok(true)
    }
    async fn fetch_token(&self, _connection_id: &str) -> waystation_core::Result<BrokeredToken> {
        Err(waystation_core::Error::Upstream("no broker in tests".into()))
    }
}

struct Harness {
    state: AppState,
    runner: Arc<StubRunner>,
    _tmp: tempfile::TempDir,
}

impl Harness {
    fn router(&self) -> axum::Router {
        build_router(self.state.clone())
    }
}

async fn harness_with(runner: Arc<StubRunner>) -> Harness {
    let tmp = tempfile::tempdir().unwrap();
    let boot = BootConfig::for_data_dir(tmp.path().join("data"));
    boot.ensure_layout().unwrap();

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
        proxy: Arc::new(ProxyService::new(db, Arc::new(NullBroker))),
        mcp_oauth: Arc::new(parking_lot::Mutex::new(HashMap::new())),
        protocol_scheme: "waystation".into(),
        anthropic_base_url: "http://127.0.0.1:9".into(),
    };
    Harness {
        state,
        runner,
        _tmp: tmp,
    }
}

async fn harness() -> Harness {
    let (port, _log) = spawn_stub_agent().await;
    harness_with(StubRunner::ready(port)).await
}

async fn send(
    router: axum::Router,
    method: &str,
    uri: &str,
    body: Option<serde_json::Value>,
) -> (StatusCode, serde_json::Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(value) => {
            builder = builder.header("content-type", "application/json");
            Body::from(value.to_string())
        }
        None => Body::empty(),
    };
    let response = router.oneshot(builder.body(body).unwrap()).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = if bytes.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null)
    };
    (status, value)
}

// ============================================================================
// Basics
// ============================================================================

#[tokio::test]
async fn test_healthz() {
    let harness = harness().await;
    let (status, body) = send(harness.router(), "GET", "/api/healthz", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ok"], true);
}

#[tokio::test]
async fn test_unknown_route_404() {
    let harness = harness().await;
    let (status, _) = send(harness.router(), "GET", "/api/bogus", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

// ============================================================================
// Agents
// ============================================================================

#[tokio::test]
async fn test_agent_crud_round_trip() {
    let harness = harness().await;

    let (status, created) = send(
        harness.router(),
        "POST",
        "/api/agents",
        Some(serde_json::json!({
            "name": "Mail Bot",
            "description": "answers email",
            "instructions": "Be concise.",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let slug = created["slug"].as_str().unwrap().to_string();
    assert!(slug.starts_with("mail-bot-"));

    let (status, fetched) = send(
        harness.router(),
        "GET",
        &format!("/api/agents/{}", slug),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fetched["name"], "Mail Bot");
    assert_eq!(fetched["description"], "answers email");
    assert_eq!(fetched["instructions"], "Be concise.");
    assert_eq!(fetched["status"]["status"], "stopped");

    let (status, _) = send(
        harness.router(),
        "DELETE",
        &format!("/api/agents/{}", slug),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, _) = send(
        harness.router(),
        "GET",
        &format!("/api/agents/{}", slug),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_agent_create_rejects_unknown_fields() {
    let harness = harness().await;
    let (status, _) = send(
        harness.router(),
        "POST",
        "/api/agents",
        Some(serde_json::json!({"name": "x", "bogus": true})),
    )
    .await;
    assert!(status.is_client_error());
}

#[tokio::test]
async fn test_start_twice_same_port_then_stop() {
    let harness = harness().await;
    let (_, created) = send(
        harness.router(),
        "POST",
        "/api/agents",
        Some(serde_json::json!({"name": "Runner"})),
    )
    .await;
    let slug = created["slug"].as_str().unwrap().to_string();

    let (status, first) = send(
        harness.router(),
        "POST",
        &format!("/api/agents/{}/start", slug),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let (_, second) = send(
        harness.router(),
        "POST",
        &format!("/api/agents/{}/start", slug),
        None,
    )
    .await;
    assert_eq!(first["port"], second["port"]);

    let (status, stopped) = send(
        harness.router(),
        "POST",
        &format!("/api/agents/{}/stop", slug),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stopped["status"]["status"], "stopped");
}

#[tokio::test]
async fn test_start_unknown_agent_404() {
    let harness = harness().await;
    let (status, _) = send(harness.router(), "POST", "/api/agents/ghost/start", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_start_with_runtime_down_is_503() {
    let harness = harness_with(StubRunner::daemon_down()).await;
    let (_, created) = send(
        harness.router(),
        "POST",
        "/api/agents",
        Some(serde_json::json!({"name": "Runner"})),
    )
    .await;
    let slug = created["slug"].as_str().unwrap().to_string();

    let (status, _) = send(
        harness.router(),
        "POST",
        &format!("/api/agents/{}/start", slug),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}

// ============================================================================
// Sessions
// ============================================================================

#[tokio::test]
async fn test_registered_session_lists_with_zero_messages() {
    let harness = harness().await;
    let (_, created) = send(
        harness.router(),
        "POST",
        "/api/agents",
        Some(serde_json::json!({"name": "Chat"})),
    )
    .await;
    let slug = created["slug"].as_str().unwrap().to_string();

    let (status, session) = send(
        harness.router(),
        "POST",
        &format!("/api/agents/{}/sessions", slug),
        Some(serde_json::json!({"sessionId": "s1", "name": "first chat"})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(session["messageCount"], 0);

    let (_, listed) = send(
        harness.router(),
        "GET",
        &format!("/api/agents/{}/sessions", slug),
        None,
    )
    .await;
    assert_eq!(listed.as_array().unwrap().len(), 1);
    assert_eq!(listed[0]["id"], "s1");
    assert_eq!(listed[0]["name"], "first chat");
}

// ============================================================================
// Settings
// ============================================================================

#[tokio::test]
async fn test_settings_runner_change_while_running_is_409() {
    let harness = harness().await;
    let (_, created) = send(
        harness.router(),
        "POST",
        "/api/agents",
        Some(serde_json::json!({"name": "Busy"})),
    )
    .await;
    let slug = created["slug"].as_str().unwrap().to_string();
    send(
        harness.router(),
        "POST",
        &format!("/api/agents/{}/start", slug),
        None,
    )
    .await;

    let (status, _) = send(
        harness.router(),
        "PUT",
        "/api/settings",
        Some(serde_json::json!({"container": {"containerRunner": "podman"}})),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    // Stored settings unchanged.
    let (_, settings) = send(harness.router(), "GET", "/api/settings", None).await;
    assert_eq!(settings["container"]["containerRunner"], "docker");
}

#[tokio::test]
async fn test_settings_update_round_trip() {
    let harness = harness().await;
    let (status, updated) = send(
        harness.router(),
        "PUT",
        "/api/settings",
        Some(serde_json::json!({"app": {"autoSleepTimeoutMinutes": 5}})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(updated["app"]["autoSleepTimeoutMinutes"], 5);

    let (_, fetched) = send(harness.router(), "GET", "/api/settings", None).await;
    assert_eq!(fetched["app"]["autoSleepTimeoutMinutes"], 5);
}

// ============================================================================
// Scheduled tasks
// ============================================================================

#[tokio::test]
async fn test_task_create_and_event() {
    let harness = harness().await;
    let mut events = harness.state.bus.subscribe();

    let (_, created) = send(
        harness.router(),
        "POST",
        "/api/agents",
        Some(serde_json::json!({"name": "Sched"})),
    )
    .await;
    let slug = created["slug"].as_str().unwrap().to_string();

    let (status, task) = send(
        harness.router(),
        "POST",
        "/api/scheduled-tasks",
        Some(serde_json::json!({
            "agentSlug": slug,
            "prompt": "summarize inbox",
            "nextExecutionAt": "2030-01-01T09:00:00Z",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(task["status"], "pending");

    let line = events.recv().await.unwrap();
    let event: serde_json::Value = serde_json::from_str(&line).unwrap();
    assert_eq!(event["type"], "scheduled_task_created");
    assert_eq!(event["agent_slug"], slug);
}

#[tokio::test]
async fn test_task_for_unknown_agent_404() {
    let harness = harness().await;
    let (status, _) = send(
        harness.router(),
        "POST",
        "/api/scheduled-tasks",
        Some(serde_json::json!({
            "agentSlug": "ghost",
            "prompt": "x",
            "nextExecutionAt": "2030-01-01T09:00:00Z",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

// ============================================================================
// Notifications
// ============================================================================

#[tokio::test]
async fn test_notification_read_cycle() {
    let harness = harness().await;
    let notification = harness
        .state
        .db
        .create_notification("Done", "task finished", None, None)
        .unwrap();

    let (_, count) = send(
        harness.router(),
        "GET",
        "/api/notifications/unread-count",
        None,
    )
    .await;
    assert_eq!(count["count"], 1);

    let (status, _) = send(
        harness.router(),
        "POST",
        &format!("/api/notifications/{}/read", notification.id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (_, count) = send(
        harness.router(),
        "GET",
        "/api/notifications/unread-count",
        None,
    )
    .await;
    assert_eq!(count["count"], 0);
}

// ============================================================================
// Runtime status
// ============================================================================

#[tokio::test]
async fn test_runtime_status_shape() {
    let harness = harness().await;
    harness
        .state
        .availability
        .refresh(&(harness.runner.clone() as Arc<dyn ContainerRunner>))
        .await;

    let (status, body) = send(harness.router(), "GET", "/api/runtime/status", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["readiness"]["state"], "ready");
    assert_eq!(body["runners"]["docker"]["running"], true);
    assert_eq!(body["hasRunningAgents"], false);
}
