//! Route table for the waystation control plane.

use axum::routing::{any, delete, get, post};
use axum::{Json, Router};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::browser_stream::browser_stream_handler;
use crate::handlers::{accounts, agents, browser, mcp, notifications, runtime, sessions, settings, tasks};
use crate::proxy::proxy_handler;
use crate::sse::event_stream;
use crate::state::AppState;

async fn healthz() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "ok": true }))
}

/// Build the full application router: the REST API under `/api` and the
/// credential proxy under `/proxy`.
pub fn build_router(state: AppState) -> Router {
    let api = Router::new()
        .route("/healthz", get(healthz))
        // Agents
        .route("/agents", get(agents::list_agents).post(agents::create_agent))
        .route(
            "/agents/:slug",
            get(agents::get_agent)
                .patch(agents::patch_agent)
                .delete(agents::delete_agent),
        )
        .route("/agents/:slug/start", post(agents::start_agent))
        .route("/agents/:slug/stop", post(agents::stop_agent))
        // Sessions
        .route(
            "/agents/:slug/sessions",
            get(sessions::list_sessions).post(sessions::create_session),
        )
        .route(
            "/agents/:slug/sessions/:session_id",
            get(sessions::get_session)
                .patch(sessions::patch_session)
                .delete(sessions::delete_session),
        )
        // Per-agent accounts + audit
        .route(
            "/agents/:slug/connected-accounts",
            get(accounts::list_agent_accounts).post(accounts::map_agent_account),
        )
        .route(
            "/agents/:slug/connected-accounts/:account_id",
            delete(accounts::unmap_agent_account),
        )
        .route("/agents/:slug/audit-log", get(accounts::agent_audit_log))
        // Browser stream
        .route("/agents/:slug/browser/stream", get(browser_stream_handler))
        // Global accounts
        .route("/connected-accounts", get(accounts::list_accounts))
        .route("/connected-accounts/initiate", post(accounts::initiate_account))
        .route("/connected-accounts/complete", post(accounts::complete_account))
        .route(
            "/connected-accounts/:id",
            delete(accounts::delete_account).patch(accounts::rename_account),
        )
        // Remote MCP servers
        .route("/remote-mcps", get(mcp::list_servers).post(mcp::create_server))
        .route("/remote-mcps/initiate-oauth", post(mcp::initiate_oauth))
        .route("/remote-mcps/oauth-callback", get(mcp::oauth_callback))
        .route(
            "/remote-mcps/:id",
            get(mcp::get_server)
                .patch(mcp::patch_server)
                .delete(mcp::delete_server),
        )
        .route("/remote-mcps/:id/discover-tools", post(mcp::discover_tools))
        .route("/remote-mcps/:id/test-connection", post(mcp::test_connection))
        // Scheduled tasks
        .route(
            "/scheduled-tasks",
            get(tasks::list_tasks).post(tasks::create_task),
        )
        .route(
            "/scheduled-tasks/:id",
            get(tasks::get_task).delete(tasks::delete_task),
        )
        .route("/scheduled-tasks/:id/sessions", get(tasks::task_sessions))
        .route("/scheduled-tasks/:id/reset", post(tasks::reset_task))
        // Settings
        .route(
            "/settings",
            get(settings::get_settings).put(settings::put_settings),
        )
        .route("/settings/start-runner", post(settings::start_runner))
        .route(
            "/settings/validate-anthropic-key",
            post(settings::validate_anthropic_key),
        )
        .route("/settings/factory-reset", post(settings::factory_reset))
        // Notifications + event stream
        .route("/notifications", get(notifications::list_notifications))
        .route("/notifications/stream", get(event_stream))
        .route("/notifications/unread-count", get(notifications::unread_count))
        .route("/notifications/:id/read", post(notifications::mark_read))
        .route("/notifications/read-all", post(notifications::mark_all_read))
        // Host browser
        .route("/browser/detect", get(browser::detect))
        .route(
            "/browser/launch-host-browser",
            post(browser::launch_host_browser),
        )
        .route("/browser/stop-host-browser", post(browser::stop_host_browser))
        // Runtime readiness
        .route("/runtime/status", get(runtime::runtime_status))
        .route("/runtime/refresh", post(runtime::refresh_runtime));

    Router::new()
        .nest("/api", api)
        .route("/proxy/:agent_slug/:account_id/*rest", any(proxy_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[cfg(test)]
#[path = "router_tests.rs"]
mod tests;
