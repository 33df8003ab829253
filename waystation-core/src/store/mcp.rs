//! Remote MCP server registry.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use uuid::Uuid;

use super::db::{from_millis, to_millis, Database};
use crate::error::{Error, Result};
use crate::types::{McpAuthType, McpStatus, RemoteMcpServer};

/// Payload for registering a server.
///
/// OAuth servers are only created by the OAuth callback, which supplies
/// the tokens; bearer/none servers come straight from the API after a
/// connection probe.
#[derive(Debug, Clone)]
pub struct NewMcpServer {
    pub name: String,
    pub url: String,
    pub auth_type: McpAuthType,
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub oauth_client_secret: Option<String>,
}

/// Field-level patch; `None` leaves the stored value unchanged.
#[derive(Debug, Clone, Default)]
pub struct McpServerPatch {
    pub name: Option<String>,
    pub url: Option<String>,
    pub access_token: Option<String>,
}

const MCP_COLS: &str = "id, name, url, auth_type, access_token, refresh_token, \
                        oauth_client_secret, tools_json, status, error_message, \
                        tools_discovered_at, created_at, updated_at";

fn row_to_server(row: &Row<'_>) -> rusqlite::Result<RemoteMcpServer> {
    let auth: String = row.get(3)?;
    let status: String = row.get(8)?;
    Ok(RemoteMcpServer {
        id: row.get(0)?,
        name: row.get(1)?,
        url: row.get(2)?,
        auth_type: McpAuthType::parse(&auth).unwrap_or(McpAuthType::None),
        access_token: row.get(4)?,
        refresh_token: row.get(5)?,
        oauth_client_secret: row.get(6)?,
        tools_json: row.get(7)?,
        status: McpStatus::parse(&status).unwrap_or(McpStatus::Error),
        error_message: row.get(9)?,
        tools_discovered_at: row.get::<_, Option<i64>>(10)?.map(from_millis),
        created_at: from_millis(row.get(11)?),
        updated_at: from_millis(row.get(12)?),
    })
}

impl Database {
    pub fn create_mcp_server(&self, new: NewMcpServer) -> Result<RemoteMcpServer> {
        let now = Utc::now();
        let server = RemoteMcpServer {
            id: Uuid::new_v4().to_string(),
            name: new.name,
            url: new.url,
            auth_type: new.auth_type,
            access_token: new.access_token,
            refresh_token: new.refresh_token,
            oauth_client_secret: new.oauth_client_secret,
            tools_json: None,
            status: McpStatus::Active,
            error_message: None,
            tools_discovered_at: None,
            created_at: now,
            updated_at: now,
        };
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO remote_mcp_servers
                     (id, name, url, auth_type, access_token, refresh_token,
                      oauth_client_secret, tools_json, status, error_message,
                      tools_discovered_at, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, NULL, ?8, NULL, NULL, ?9, ?9)",
                params![
                    server.id,
                    server.name,
                    server.url,
                    server.auth_type.as_str(),
                    server.access_token,
                    server.refresh_token,
                    server.oauth_client_secret,
                    server.status.as_str(),
                    to_millis(now),
                ],
            )?;
            Ok(())
        })?;
        Ok(server)
    }

    pub fn list_mcp_servers(&self) -> Result<Vec<RemoteMcpServer>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {MCP_COLS} FROM remote_mcp_servers ORDER BY created_at DESC"
            ))?;
            let servers = stmt
                .query_map([], row_to_server)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(servers)
        })
    }

    pub fn get_mcp_server(&self, id: &str) -> Result<Option<RemoteMcpServer>> {
        self.with_conn(|conn| {
            let server = conn
                .query_row(
                    &format!("SELECT {MCP_COLS} FROM remote_mcp_servers WHERE id = ?1"),
                    params![id],
                    row_to_server,
                )
                .optional()?;
            Ok(server)
        })
    }

    pub fn patch_mcp_server(&self, id: &str, patch: McpServerPatch) -> Result<RemoteMcpServer> {
        let server = self
            .get_mcp_server(id)?
            .ok_or_else(|| Error::NotFound(format!("remote MCP server {}", id)))?;
        let name = patch.name.unwrap_or(server.name);
        let url = patch.url.unwrap_or(server.url);
        let access_token = patch.access_token.or(server.access_token);
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE remote_mcp_servers
                 SET name = ?2, url = ?3, access_token = ?4, updated_at = ?5
                 WHERE id = ?1",
                params![id, name, url, access_token, to_millis(Utc::now())],
            )?;
            Ok(())
        })?;
        self.get_mcp_server(id)?
            .ok_or_else(|| Error::NotFound(format!("remote MCP server {}", id)))
    }

    /// Record a successful tool discovery.
    pub fn set_mcp_tools(&self, id: &str, tools_json: &str, at: DateTime<Utc>) -> Result<()> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE remote_mcp_servers
                 SET tools_json = ?2, tools_discovered_at = ?3, status = 'active',
                     error_message = NULL, updated_at = ?4
                 WHERE id = ?1",
                params![id, tools_json, to_millis(at), to_millis(Utc::now())],
            )?;
            if changed == 0 {
                return Err(Error::NotFound(format!("remote MCP server {}", id)));
            }
            Ok(())
        })
    }

    pub fn set_mcp_status(
        &self,
        id: &str,
        status: McpStatus,
        error_message: Option<&str>,
    ) -> Result<()> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE remote_mcp_servers
                 SET status = ?2, error_message = ?3, updated_at = ?4
                 WHERE id = ?1",
                params![id, status.as_str(), error_message, to_millis(Utc::now())],
            )?;
            if changed == 0 {
                return Err(Error::NotFound(format!("remote MCP server {}", id)));
            }
            Ok(())
        })
    }

    pub fn delete_mcp_server(&self, id: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "DELETE FROM remote_mcp_servers WHERE id = ?1",
                params![id],
            )?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bearer_server() -> NewMcpServer {
        NewMcpServer {
            name: "docs".into(),
            url: "https://mcp.example.com".into(),
            auth_type: McpAuthType::Bearer,
            access_token: Some("tok".into()),
            refresh_token: None,
            oauth_client_secret: None,
        }
    }

    #[test]
    fn test_create_defaults_active() {
        let db = Database::open_in_memory().unwrap();
        let server = db.create_mcp_server(bearer_server()).unwrap();
        assert_eq!(server.status, McpStatus::Active);
        assert!(server.tools_json.is_none());
    }

    #[test]
    fn test_patch_preserves_omitted_fields() {
        let db = Database::open_in_memory().unwrap();
        let server = db.create_mcp_server(bearer_server()).unwrap();

        let patched = db
            .patch_mcp_server(
                &server.id,
                McpServerPatch {
                    name: Some("documentation".into()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(patched.name, "documentation");
        assert_eq!(patched.url, server.url);
        assert_eq!(patched.access_token.as_deref(), Some("tok"));
    }

    #[test]
    fn test_tool_discovery_clears_error() {
        let db = Database::open_in_memory().unwrap();
        let server = db.create_mcp_server(bearer_server()).unwrap();
        db.set_mcp_status(&server.id, McpStatus::Error, Some("connect refused"))
            .unwrap();

        db.set_mcp_tools(&server.id, r#"[{"name":"search"}]"#, Utc::now())
            .unwrap();
        let fetched = db.get_mcp_server(&server.id).unwrap().unwrap();
        assert_eq!(fetched.status, McpStatus::Active);
        assert!(fetched.error_message.is_none());
        assert!(fetched.tools_discovered_at.is_some());
    }

    #[test]
    fn test_missing_server_not_found() {
        let db = Database::open_in_memory().unwrap();
        assert!(db
            .set_mcp_status("missing", McpStatus::Error, None)
            .unwrap_err()
            .is_not_found());
    }
}
