//! Shared domain types for the control plane.
//!
//! Everything here is serde-serializable with camelCase field names, which
//! is the wire shape the UI consumes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A supported container runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunnerKind {
    Docker,
    Podman,
    /// The macOS-native `container` runtime.
    Native,
}

impl RunnerKind {
    /// CLI binary name for this runtime.
    pub fn cli(&self) -> &'static str {
        match self {
            Self::Docker => "docker",
            Self::Podman => "podman",
            Self::Native => "container",
        }
    }
}

impl std::fmt::Display for RunnerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.cli())
    }
}

/// CPU/memory limits applied to agent containers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ResourceLimits {
    /// Number of CPUs (fractional allowed).
    pub cpu: f64,
    /// Memory limit in runtime syntax, e.g. `"4g"`.
    pub memory: String,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            cpu: 2.0,
            memory: "4g".to_string(),
        }
    }
}

/// Agent metadata as stored in the instructions frontmatter.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRecord {
    pub slug: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Lifecycle state of an agent container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    Running,
    Stopped,
    Starting,
    Stopping,
    Error,
}

/// Cached per-agent container status.
///
/// `started_at` is in-memory bookkeeping for the auto-sleep monitor and is
/// not part of the wire shape the UI polls.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerStatus {
    pub status: ContainerState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(skip)]
    pub started_at: Option<DateTime<Utc>>,
}

impl ContainerStatus {
    pub fn stopped() -> Self {
        Self {
            status: ContainerState::Stopped,
            port: None,
            warnings: Vec::new(),
            started_at: None,
        }
    }
}

/// Readiness of the selected runtime + agent image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RuntimeReadiness {
    Unknown,
    Checking,
    Ready,
    PullingImage,
    Error { message: String },
    RuntimeUnavailable,
}

/// An authorized upstream identity, independent of any agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectedAccount {
    pub id: String,
    pub toolkit_slug: String,
    pub composio_connection_id: String,
    pub display_name: String,
    pub created_at: DateTime<Utc>,
}

/// Scheduled task lifecycle state. Only `pending` is eligible to fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Done,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "done" => Some(Self::Done),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    /// Terminal states can be reset but never fire again on their own.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Cancelled)
    }
}

/// A persisted intent to run a prompt on an agent at a future time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledTask {
    pub id: String,
    pub agent_slug: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub prompt: String,
    pub next_execution_at: DateTime<Utc>,
    /// Fixed re-arm interval; `None` means one-shot.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recurrence_minutes: Option<i64>,
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A user-visible notification record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub id: String,
    pub title: String,
    pub body: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_slug: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub read_at: Option<DateTime<Utc>>,
}

/// One proxied request, as recorded in the append-only audit log.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub id: i64,
    pub agent_slug: String,
    pub account_id: String,
    pub toolkit: String,
    pub target_host: String,
    pub target_path: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Authentication mode of a remote MCP server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum McpAuthType {
    None,
    Oauth,
    Bearer,
}

impl McpAuthType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Oauth => "oauth",
            Self::Bearer => "bearer",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "none" => Some(Self::None),
            "oauth" => Some(Self::Oauth),
            "bearer" => Some(Self::Bearer),
            _ => None,
        }
    }
}

/// Connection status of a remote MCP server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum McpStatus {
    Active,
    Error,
    AuthRequired,
}

impl McpStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Error => "error",
            Self::AuthRequired => "auth_required",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "error" => Some(Self::Error),
            "auth_required" => Some(Self::AuthRequired),
            _ => None,
        }
    }
}

/// A registered remote MCP server.
///
/// OAuth servers are only created through the OAuth flow; bearer/none
/// servers may be created directly after a connection probe.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteMcpServer {
    pub id: String,
    pub name: String,
    pub url: String,
    pub auth_type: McpAuthType,
    #[serde(skip_serializing, default)]
    pub access_token: Option<String>,
    #[serde(skip_serializing, default)]
    pub refresh_token: Option<String>,
    #[serde(skip_serializing, default)]
    pub oauth_client_secret: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools_json: Option<String>,
    pub status: McpStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools_discovered_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Role of a session message shown to the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

/// One user/assistant message from a session log.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMessage {
    pub role: MessageRole,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

/// A session as it appears in listings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub id: String,
    pub agent_slug: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub message_count: usize,
    #[serde(default)]
    pub starred: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scheduled_task_id: Option<String>,
}
