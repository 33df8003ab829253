//! Synthetic proxy tokens.
//!
//! A token is an opaque bearer string bound to one agent slug, usable only
//! against the credential proxy. Validation is a single indexed lookup;
//! rotation deletes the agent's previous tokens.

use chrono::{Duration, Utc};
use rand::Rng;
use rusqlite::{params, OptionalExtension};

use super::db::{to_millis, Database};
use crate::error::Result;

const TOKEN_PREFIX: &str = "wst_";
const TOKEN_BYTES: usize = 24;

fn generate_token() -> String {
    let mut rng = rand::thread_rng();
    let mut hex = String::with_capacity(TOKEN_PREFIX.len() + TOKEN_BYTES * 2);
    hex.push_str(TOKEN_PREFIX);
    for _ in 0..TOKEN_BYTES {
        let byte: u8 = rng.gen();
        hex.push_str(&format!("{:02x}", byte));
    }
    hex
}

impl Database {
    /// Mint a token for `agent_slug` with an optional TTL.
    pub fn mint_token(&self, agent_slug: &str, ttl: Option<Duration>) -> Result<String> {
        let token = generate_token();
        let now = Utc::now();
        let expires_at = ttl.map(|ttl| to_millis(now + ttl));
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO proxy_tokens (token, agent_slug, expires_at, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![token, agent_slug, expires_at, to_millis(now)],
            )?;
            Ok(())
        })?;
        Ok(token)
    }

    /// Resolve a bearer string to its bound agent slug.
    ///
    /// Returns `None` for unknown or expired tokens.
    pub fn validate_token(&self, token: &str) -> Result<Option<String>> {
        let now = to_millis(Utc::now());
        self.with_conn(|conn| {
            let slug = conn
                .query_row(
                    "SELECT agent_slug FROM proxy_tokens
                     WHERE token = ?1 AND (expires_at IS NULL OR expires_at > ?2)",
                    params![token, now],
                    |row| row.get::<_, String>(0),
                )
                .optional()?;
            Ok(slug)
        })
    }

    /// Return a still-valid token for the agent, minting one if needed.
    pub fn ensure_token(&self, agent_slug: &str) -> Result<String> {
        let now = to_millis(Utc::now());
        let existing = self.with_conn(|conn| {
            let token = conn
                .query_row(
                    "SELECT token FROM proxy_tokens
                     WHERE agent_slug = ?1 AND (expires_at IS NULL OR expires_at > ?2)
                     ORDER BY created_at DESC LIMIT 1",
                    params![agent_slug, now],
                    |row| row.get::<_, String>(0),
                )
                .optional()?;
            Ok(token)
        })?;
        match existing {
            Some(token) => Ok(token),
            None => self.mint_token(agent_slug, None),
        }
    }

    /// Replace all of an agent's tokens with a fresh one.
    pub fn rotate_token(&self, agent_slug: &str, ttl: Option<Duration>) -> Result<String> {
        self.revoke_tokens(agent_slug)?;
        self.mint_token(agent_slug, ttl)
    }

    /// Delete every token bound to `agent_slug`.
    pub fn revoke_tokens(&self, agent_slug: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "DELETE FROM proxy_tokens WHERE agent_slug = ?1",
                params![agent_slug],
            )?;
            Ok(())
        })
    }
}
