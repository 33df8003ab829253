//! Relational store over SQLite.
//!
//! Single source of truth for connected accounts, proxy tokens, the audit
//! log, scheduled tasks, remote MCP servers, and notifications. All access
//! goes through [`Database`], which wraps one connection behind a mutex;
//! every operation is a short locked scope, which at desktop scale is the
//! whole transaction story.

mod accounts;
mod audit;
mod db;
mod mcp;
mod notifications;
mod tasks;
mod tokens;

pub use accounts::NewAccount;
pub use audit::NewAuditEntry;
pub use db::Database;
pub use mcp::{McpServerPatch, NewMcpServer};
pub use tasks::NewTask;
