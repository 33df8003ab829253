//! # Waystation Core
//!
//! Domain model and storage layer for the waystation control plane: the
//! local process that manages a fleet of per-agent containers, mediates
//! their outbound API traffic, and pushes real-time events to the UI.
//!
//! This crate owns everything under the data directory (agents, sessions,
//! settings, the relational store) plus the in-process event bus. It knows
//! nothing about HTTP or container runtimes; those live in
//! `waystation-server` and `waystation-runtime`.
//!
//! ## Layout
//!
//! ```text
//! <dataDir>/
//!   agents/<slug>/workspace/instructions.md
//!   agents/<slug>/workspace/sessions.json
//!   agents/<slug>/workspace/.claude/projects/-workspace/<sessionId>.jsonl
//!   host-browser-profiles/<agentId>/
//!   settings.json
//!   app.db
//! ```

pub mod agents;
pub mod config;
pub mod error;
pub mod events;
pub mod pathlock;
pub mod sessions;
pub mod settings;
pub mod slug;
pub mod store;
pub mod types;

pub use agents::{AgentDetail, AgentPatch, AgentService, NewAgent};
pub use config::BootConfig;
pub use error::{Error, Result};
pub use events::{Event, EventBus, EventReceiver};
pub use sessions::{SessionPatch, SessionService};
pub use settings::{Settings, SettingsStore, SettingsUpdate};
pub use store::{Database, McpServerPatch, NewAccount, NewAuditEntry, NewMcpServer, NewTask};
pub use types::{
    AgentRecord, AuditEntry, ConnectedAccount, ContainerState, ContainerStatus, McpAuthType,
    McpStatus, MessageRole, Notification, RemoteMcpServer, ResourceLimits, RunnerKind,
    RuntimeReadiness, ScheduledTask, SessionMessage, SessionSummary, TaskStatus,
};
