//! Append-only proxy audit log.

use chrono::Utc;
use rusqlite::{params, Row};

use super::db::{from_millis, to_millis, Database};
use crate::error::Result;
use crate::types::AuditEntry;

/// One row to append. The id and timestamp are assigned on write.
#[derive(Debug, Clone)]
pub struct NewAuditEntry {
    pub agent_slug: String,
    pub account_id: String,
    pub toolkit: String,
    pub target_host: String,
    pub target_path: String,
    pub method: String,
    pub status_code: Option<u16>,
    pub error_message: Option<String>,
}

fn row_to_entry(row: &Row<'_>) -> rusqlite::Result<AuditEntry> {
    Ok(AuditEntry {
        id: row.get(0)?,
        agent_slug: row.get(1)?,
        account_id: row.get(2)?,
        toolkit: row.get(3)?,
        target_host: row.get(4)?,
        target_path: row.get(5)?,
        method: row.get(6)?,
        status_code: row.get::<_, Option<i64>>(7)?.map(|code| code as u16),
        error_message: row.get(8)?,
        created_at: from_millis(row.get(9)?),
    })
}

impl Database {
    pub fn record_audit(&self, entry: NewAuditEntry) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO audit_log (agent_slug, account_id, toolkit, target_host, target_path,
                                        method, status_code, error_message, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    entry.agent_slug,
                    entry.account_id,
                    entry.toolkit,
                    entry.target_host,
                    entry.target_path,
                    entry.method,
                    entry.status_code.map(|code| code as i64),
                    entry.error_message,
                    to_millis(Utc::now()),
                ],
            )?;
            Ok(())
        })
    }

    /// Page through an agent's audit rows, newest first.
    pub fn list_audit(&self, agent_slug: &str, offset: u32, limit: u32) -> Result<Vec<AuditEntry>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, agent_slug, account_id, toolkit, target_host, target_path,
                        method, status_code, error_message, created_at
                 FROM audit_log WHERE agent_slug = ?1
                 ORDER BY created_at DESC, id DESC LIMIT ?2 OFFSET ?3",
            )?;
            let entries = stmt
                .query_map(params![agent_slug, limit, offset], row_to_entry)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(entries)
        })
    }

    /// Count rows matching `(agent, account, host, path, method)`; the
    /// proxy invariant tests key on this.
    pub fn count_audit_matching(
        &self,
        agent_slug: &str,
        account_id: &str,
        target_host: &str,
        target_path: &str,
        method: &str,
    ) -> Result<i64> {
        self.with_conn(|conn| {
            let count = conn.query_row(
                "SELECT count(*) FROM audit_log
                 WHERE agent_slug = ?1 AND account_id = ?2 AND target_host = ?3
                   AND target_path = ?4 AND method = ?5",
                params![agent_slug, account_id, target_host, target_path, method],
                |row| row.get(0),
            )?;
            Ok(count)
        })
    }
}
