//! Connected accounts and their agent mappings.
//!
//! Accounts exist independent of agents; the `agent_accounts` table is a
//! plain many-to-many mapping, and removing the last mapping leaves the
//! account in place.

use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};
use uuid::Uuid;

use super::db::{from_millis, to_millis, Database};
use crate::error::{Error, Result};
use crate::types::ConnectedAccount;

/// Payload for registering a newly authorized upstream identity.
#[derive(Debug, Clone)]
pub struct NewAccount {
    pub toolkit_slug: String,
    pub composio_connection_id: String,
    pub display_name: String,
}

fn row_to_account(row: &Row<'_>) -> rusqlite::Result<ConnectedAccount> {
    Ok(ConnectedAccount {
        id: row.get(0)?,
        toolkit_slug: row.get(1)?,
        composio_connection_id: row.get(2)?,
        display_name: row.get(3)?,
        created_at: from_millis(row.get(4)?),
    })
}

const ACCOUNT_COLS: &str = "id, toolkit_slug, composio_connection_id, display_name, created_at";

impl Database {
    pub fn create_account(&self, new: NewAccount) -> Result<ConnectedAccount> {
        let account = ConnectedAccount {
            id: Uuid::new_v4().to_string(),
            toolkit_slug: new.toolkit_slug,
            composio_connection_id: new.composio_connection_id,
            display_name: new.display_name,
            created_at: Utc::now(),
        };
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO connected_accounts (id, toolkit_slug, composio_connection_id, display_name, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    account.id,
                    account.toolkit_slug,
                    account.composio_connection_id,
                    account.display_name,
                    to_millis(account.created_at),
                ],
            )?;
            Ok(())
        })?;
        Ok(account)
    }

    pub fn list_accounts(&self) -> Result<Vec<ConnectedAccount>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {ACCOUNT_COLS} FROM connected_accounts ORDER BY created_at DESC"
            ))?;
            let accounts = stmt
                .query_map([], row_to_account)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(accounts)
        })
    }

    pub fn get_account(&self, id: &str) -> Result<Option<ConnectedAccount>> {
        self.with_conn(|conn| {
            let account = conn
                .query_row(
                    &format!("SELECT {ACCOUNT_COLS} FROM connected_accounts WHERE id = ?1"),
                    params![id],
                    row_to_account,
                )
                .optional()?;
            Ok(account)
        })
    }

    pub fn rename_account(&self, id: &str, display_name: &str) -> Result<()> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE connected_accounts SET display_name = ?2 WHERE id = ?1",
                params![id, display_name],
            )?;
            if changed == 0 {
                return Err(Error::NotFound(format!("account {}", id)));
            }
            Ok(())
        })
    }

    /// Delete the account and (via cascade) all of its agent mappings.
    pub fn delete_account(&self, id: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "DELETE FROM connected_accounts WHERE id = ?1",
                params![id],
            )?;
            Ok(())
        })
    }

    pub fn map_agent_account(&self, agent_slug: &str, account_id: &str) -> Result<()> {
        self.with_conn(|conn| {
            let exists: Option<String> = conn
                .query_row(
                    "SELECT id FROM connected_accounts WHERE id = ?1",
                    params![account_id],
                    |row| row.get(0),
                )
                .optional()?;
            if exists.is_none() {
                return Err(Error::NotFound(format!("account {}", account_id)));
            }
            conn.execute(
                "INSERT OR IGNORE INTO agent_accounts (agent_slug, account_id) VALUES (?1, ?2)",
                params![agent_slug, account_id],
            )?;
            Ok(())
        })
    }

    /// Remove a mapping; the account itself is untouched.
    pub fn unmap_agent_account(&self, agent_slug: &str, account_id: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "DELETE FROM agent_accounts WHERE agent_slug = ?1 AND account_id = ?2",
                params![agent_slug, account_id],
            )?;
            Ok(())
        })
    }

    pub fn list_agent_accounts(&self, agent_slug: &str) -> Result<Vec<ConnectedAccount>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {ACCOUNT_COLS} FROM connected_accounts a
                 JOIN agent_accounts m ON m.account_id = a.id
                 WHERE m.agent_slug = ?1 ORDER BY a.created_at DESC"
            ))?;
            let accounts = stmt
                .query_map(params![agent_slug], row_to_account)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(accounts)
        })
    }

    /// Join agent × account; `None` when the account does not exist or is
    /// not mapped to this agent.
    pub fn resolve_agent_account(
        &self,
        agent_slug: &str,
        account_id: &str,
    ) -> Result<Option<ConnectedAccount>> {
        self.with_conn(|conn| {
            let account = conn
                .query_row(
                    &format!(
                        "SELECT {ACCOUNT_COLS} FROM connected_accounts a
                         JOIN agent_accounts m ON m.account_id = a.id
                         WHERE m.agent_slug = ?1 AND a.id = ?2"
                    ),
                    params![agent_slug, account_id],
                    row_to_account,
                )
                .optional()?;
            Ok(account)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_gmail_account() -> NewAccount {
        NewAccount {
            toolkit_slug: "gmail".into(),
            composio_connection_id: "conn-1".into(),
            display_name: "work@example.com".into(),
        }
    }

    #[test]
    fn test_create_and_get() {
        let db = Database::open_in_memory().unwrap();
        let account = db.create_account(new_gmail_account()).unwrap();

        let fetched = db.get_account(&account.id).unwrap().unwrap();
        assert_eq!(fetched.toolkit_slug, "gmail");
        assert_eq!(fetched.display_name, "work@example.com");
    }

    #[test]
    fn test_mapping_resolution() {
        let db = Database::open_in_memory().unwrap();
        let account = db.create_account(new_gmail_account()).unwrap();

        assert!(db.resolve_agent_account("a1", &account.id).unwrap().is_none());

        db.map_agent_account("a1", &account.id).unwrap();
        let resolved = db.resolve_agent_account("a1", &account.id).unwrap();
        assert!(resolved.is_some());

        // Other agents see nothing.
        assert!(db.resolve_agent_account("a2", &account.id).unwrap().is_none());
    }

    #[test]
    fn test_unmap_keeps_account() {
        let db = Database::open_in_memory().unwrap();
        let account = db.create_account(new_gmail_account()).unwrap();
        db.map_agent_account("a1", &account.id).unwrap();
        db.unmap_agent_account("a1", &account.id).unwrap();

        assert!(db.get_account(&account.id).unwrap().is_some());
        assert!(db.list_agent_accounts("a1").unwrap().is_empty());
    }

    #[test]
    fn test_delete_cascades_mappings() {
        let db = Database::open_in_memory().unwrap();
        let account = db.create_account(new_gmail_account()).unwrap();
        db.map_agent_account("a1", &account.id).unwrap();
        db.delete_account(&account.id).unwrap();

        assert!(db.list_agent_accounts("a1").unwrap().is_empty());
    }

    #[test]
    fn test_map_unknown_account_is_not_found() {
        let db = Database::open_in_memory().unwrap();
        let err = db.map_agent_account("a1", "missing").unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_rename() {
        let db = Database::open_in_memory().unwrap();
        let account = db.create_account(new_gmail_account()).unwrap();
        db.rename_account(&account.id, "personal@example.com").unwrap();
        let fetched = db.get_account(&account.id).unwrap().unwrap();
        assert_eq!(fetched.display_name, "personal@example.com");

        assert!(db.rename_account("missing", "x").unwrap_err().is_not_found());
    }
}
