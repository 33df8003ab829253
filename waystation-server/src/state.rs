//! Application state for the waystation server.

use std::sync::Arc;

use waystation_core::{
    AgentService, Database, EventBus, SessionService, SettingsStore,
};
use waystation_runtime::{
    AvailabilityCache, ContainerManager, HostBrowserManager, ReadinessController, RunnerSet,
};

use crate::handlers::mcp::OauthFlows;
use crate::proxy::ProxyService;

/// Shared application state, cloned into every handler.
///
/// All services are process-scoped: constructed once at boot, passed in
/// explicitly, and shut down deterministically. Nothing here is a global.
#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub agents: Arc<AgentService>,
    pub sessions: Arc<SessionService>,
    pub settings: Arc<SettingsStore>,
    pub bus: Arc<EventBus>,
    pub manager: Arc<ContainerManager>,
    pub browser: Arc<HostBrowserManager>,
    pub readiness: Arc<ReadinessController>,
    pub runners: RunnerSet,
    pub availability: Arc<AvailabilityCache>,
    pub proxy: Arc<ProxyService>,
    /// In-flight remote MCP OAuth flows, keyed by state parameter.
    pub mcp_oauth: Arc<OauthFlows>,
    /// Deep-link scheme for OAuth callbacks.
    pub protocol_scheme: String,
    /// Base URL for Anthropic key validation; overridden in tests.
    pub anthropic_base_url: String,
}
