//! Database connection wrapper.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::Connection;

use crate::error::{Error, Result};

/// Handle to the relational store.
///
/// Clones share one connection behind a mutex. SQLite serializes writers
/// anyway; keeping a single connection keeps WAL bookkeeping out of the
/// picture for a desktop-scale store.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (creating if needed) the store at `path` and apply the schema.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::Internal(format!("failed to create db directory: {}", e)))?;
        }
        let conn = Connection::open(&path)?;
        Self::init(conn)
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(include_str!("schema.sql"))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` with the locked connection.
    pub(crate) fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.conn.lock().unwrap();
        f(&conn)
    }

    /// Wipe every table. Factory reset support.
    pub fn factory_reset(&self) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute_batch(
                "DELETE FROM agent_accounts;
                 DELETE FROM connected_accounts;
                 DELETE FROM proxy_tokens;
                 DELETE FROM audit_log;
                 DELETE FROM scheduled_tasks;
                 DELETE FROM remote_mcp_servers;
                 DELETE FROM notifications;",
            )?;
            Ok(())
        })
    }
}

/// Timestamps are stored as unix milliseconds.
pub(crate) fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or_else(Utc::now)
}
