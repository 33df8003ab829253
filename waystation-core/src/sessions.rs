//! Session listings over append-only JSONL logs.
//!
//! The in-container runtime owns the log files; the control plane only
//! reads them. A sidecar file (`sessions.json` in the agent workspace)
//! maps session ids to metadata so a session can be listed before its log
//! materializes — the scheduler registers sessions eagerly this way.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::pathlock::PathLocks;
use crate::types::{MessageRole, SessionMessage, SessionSummary};

/// Where the in-container runtime materializes session logs, relative to
/// the agent workspace.
pub const SESSION_LOG_DIR: &str = ".claude/projects/-workspace";

/// Sidecar file name, relative to the agent workspace.
pub const SIDECAR_FILE: &str = "sessions.json";

const NAME_LIMIT: usize = 50;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SidecarEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    starred: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    scheduled_task_id: Option<String>,
}

type Sidecar = BTreeMap<String, SidecarEntry>;

/// One line of a session log. Anything that is not a `user` or
/// `assistant` record (tool use, tool results, summaries) is counted for
/// activity but filtered from message reads.
#[derive(Debug, Deserialize)]
struct LogRecord {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    content: Option<serde_json::Value>,
    #[serde(default)]
    message: Option<serde_json::Value>,
    #[serde(default)]
    timestamp: Option<DateTime<Utc>>,
}

impl LogRecord {
    fn text(&self) -> Option<String> {
        let value = self.content.as_ref().or_else(|| {
            self.message
                .as_ref()
                .and_then(|message| message.get("content"))
        })?;
        match value {
            serde_json::Value::String(text) => Some(text.clone()),
            serde_json::Value::Array(blocks) => {
                let joined: Vec<&str> = blocks
                    .iter()
                    .filter_map(|block| block.get("text").and_then(|text| text.as_str()))
                    .collect();
                if joined.is_empty() {
                    None
                } else {
                    Some(joined.join("\n"))
                }
            }
            _ => None,
        }
    }
}

/// Updatable sidecar fields.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SessionPatch {
    pub name: Option<String>,
    pub starred: Option<bool>,
}

/// Read-side service over agent session logs and sidecars.
pub struct SessionService {
    agents_dir: PathBuf,
    locks: PathLocks,
}

impl SessionService {
    pub fn new(agents_dir: impl Into<PathBuf>) -> Self {
        Self {
            agents_dir: agents_dir.into(),
            locks: PathLocks::new(),
        }
    }

    fn workspace_dir(&self, agent_slug: &str) -> PathBuf {
        self.agents_dir.join(agent_slug).join("workspace")
    }

    fn sidecar_path(&self, agent_slug: &str) -> PathBuf {
        self.workspace_dir(agent_slug).join(SIDECAR_FILE)
    }

    fn log_dir(&self, agent_slug: &str) -> PathBuf {
        self.workspace_dir(agent_slug).join(SESSION_LOG_DIR)
    }

    fn log_path(&self, agent_slug: &str, session_id: &str) -> PathBuf {
        self.log_dir(agent_slug).join(format!("{}.jsonl", session_id))
    }

    fn read_sidecar(&self, agent_slug: &str) -> Result<Sidecar> {
        match std::fs::read_to_string(self.sidecar_path(agent_slug)) {
            Ok(raw) => Ok(serde_json::from_str(&raw)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Sidecar::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn modify_sidecar<F>(&self, agent_slug: &str, modify: F) -> Result<()>
    where
        F: FnOnce(&mut Sidecar) -> Result<()>,
    {
        let path = self.sidecar_path(agent_slug);
        let lock = self.locks.lock_for(&path);
        let _guard = lock.lock().await;

        let mut sidecar = self.read_sidecar(agent_slug)?;
        modify(&mut sidecar)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, serde_json::to_string_pretty(&sidecar)?)?;
        Ok(())
    }

    /// Register a session before its log exists. It shows up in listings
    /// immediately with `messageCount = 0`.
    pub async fn register_session(
        &self,
        agent_slug: &str,
        session_id: &str,
        name: Option<String>,
        scheduled_task_id: Option<String>,
    ) -> Result<()> {
        self.modify_sidecar(agent_slug, |sidecar| {
            sidecar
                .entry(session_id.to_string())
                .or_insert_with(|| SidecarEntry {
                    name,
                    created_at: Utc::now(),
                    starred: None,
                    scheduled_task_id,
                });
            Ok(())
        })
        .await
    }

    /// Rename or star a session.
    pub async fn patch_session(
        &self,
        agent_slug: &str,
        session_id: &str,
        patch: SessionPatch,
    ) -> Result<()> {
        let has_log = self.log_path(agent_slug, session_id).exists();
        self.modify_sidecar(agent_slug, |sidecar| {
            if !sidecar.contains_key(session_id) {
                if !has_log {
                    return Err(Error::NotFound(format!("session {}", session_id)));
                }
                // Log-only session: materialize a sidecar entry to hang
                // the metadata on.
                sidecar.insert(
                    session_id.to_string(),
                    SidecarEntry {
                        name: None,
                        created_at: Utc::now(),
                        starred: None,
                        scheduled_task_id: None,
                    },
                );
            }
            if let Some(entry) = sidecar.get_mut(session_id) {
                if let Some(name) = patch.name {
                    entry.name = if name.is_empty() { None } else { Some(name) };
                }
                if let Some(starred) = patch.starred {
                    entry.starred = Some(starred);
                }
            }
            Ok(())
        })
        .await
    }

    /// Remove a session's log file and sidecar entry.
    pub async fn delete_session(&self, agent_slug: &str, session_id: &str) -> Result<()> {
        match std::fs::remove_file(self.log_path(agent_slug, session_id)) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.modify_sidecar(agent_slug, |sidecar| {
            sidecar.remove(session_id);
            Ok(())
        })
        .await
    }

    fn read_log(&self, agent_slug: &str, session_id: &str) -> Result<Vec<LogRecord>> {
        let raw = match std::fs::read_to_string(self.log_path(agent_slug, session_id)) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut records = Vec::new();
        for line in raw.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<LogRecord>(line) {
                Ok(record) => records.push(record),
                Err(e) => {
                    tracing::debug!(session = session_id, error = %e, "skipping malformed log line");
                }
            }
        }
        Ok(records)
    }

    fn summarize(
        &self,
        agent_slug: &str,
        session_id: &str,
        sidecar_entry: Option<&SidecarEntry>,
    ) -> Result<SessionSummary> {
        let records = self.read_log(agent_slug, session_id)?;
        let message_count = records
            .iter()
            .filter(|record| record.kind == "user" || record.kind == "assistant")
            .count();
        let first_user_text = records
            .iter()
            .find(|record| record.kind == "user")
            .and_then(LogRecord::text);
        let first_ts = records.iter().find_map(|record| record.timestamp);
        let last_ts = records.iter().rev().find_map(|record| record.timestamp);

        let created_at = sidecar_entry
            .map(|entry| entry.created_at)
            .or(first_ts)
            .unwrap_or_else(Utc::now);
        let last_activity_at = last_ts.unwrap_or(created_at);

        let name = sidecar_entry
            .and_then(|entry| entry.name.clone())
            .or_else(|| first_user_text.map(|text| truncate_name(&text)))
            .unwrap_or_else(|| session_id.to_string());

        Ok(SessionSummary {
            id: session_id.to_string(),
            agent_slug: agent_slug.to_string(),
            name,
            created_at,
            last_activity_at,
            message_count,
            starred: sidecar_entry.and_then(|entry| entry.starred).unwrap_or(false),
            scheduled_task_id: sidecar_entry.and_then(|entry| entry.scheduled_task_id.clone()),
        })
    }

    /// Merge sidecar entries with log files on disk: exactly one entry
    /// per session id, sorted by last activity descending.
    pub fn list_sessions(&self, agent_slug: &str) -> Result<Vec<SessionSummary>> {
        let sidecar = self.read_sidecar(agent_slug)?;
        let mut ids: Vec<String> = sidecar.keys().cloned().collect();

        if let Ok(entries) = std::fs::read_dir(self.log_dir(agent_slug)) {
            for entry in entries.flatten() {
                let path = entry.path();
                if path.extension().and_then(|ext| ext.to_str()) != Some("jsonl") {
                    continue;
                }
                if let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) {
                    if !sidecar.contains_key(stem) {
                        ids.push(stem.to_string());
                    }
                }
            }
        }

        let mut summaries = Vec::with_capacity(ids.len());
        for id in ids {
            summaries.push(self.summarize(agent_slug, &id, sidecar.get(&id))?);
        }
        summaries.sort_by(|a, b| b.last_activity_at.cmp(&a.last_activity_at));
        Ok(summaries)
    }

    /// User/assistant messages of one session, in log order.
    pub fn get_messages(&self, agent_slug: &str, session_id: &str) -> Result<Vec<SessionMessage>> {
        let sidecar = self.read_sidecar(agent_slug)?;
        let has_log = self.log_path(agent_slug, session_id).exists();
        if !has_log && !sidecar.contains_key(session_id) {
            return Err(Error::NotFound(format!("session {}", session_id)));
        }

        let messages = self
            .read_log(agent_slug, session_id)?
            .into_iter()
            .filter_map(|record| {
                let role = match record.kind.as_str() {
                    "user" => MessageRole::User,
                    "assistant" => MessageRole::Assistant,
                    _ => return None,
                };
                Some(SessionMessage {
                    role,
                    content: record.text().unwrap_or_default(),
                    timestamp: record.timestamp,
                })
            })
            .collect();
        Ok(messages)
    }

    pub fn get_session(&self, agent_slug: &str, session_id: &str) -> Result<SessionSummary> {
        let sidecar = self.read_sidecar(agent_slug)?;
        let has_log = self.log_path(agent_slug, session_id).exists();
        if !has_log && !sidecar.contains_key(session_id) {
            return Err(Error::NotFound(format!("session {}", session_id)));
        }
        self.summarize(agent_slug, session_id, sidecar.get(session_id))
    }

    /// Linear scan over agent directories; acceptable at desktop scale.
    pub fn find_session_across_agents(&self, session_id: &str) -> Result<Option<SessionSummary>> {
        for slug in self.agent_slugs()? {
            match self.get_session(&slug, session_id) {
                Ok(summary) => return Ok(Some(summary)),
                Err(Error::NotFound(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }

    /// Sessions spawned by a scheduled task, across all agents.
    pub fn sessions_for_task(&self, task_id: &str) -> Result<Vec<SessionSummary>> {
        let mut out = Vec::new();
        for slug in self.agent_slugs()? {
            for summary in self.list_sessions(&slug)? {
                if summary.scheduled_task_id.as_deref() == Some(task_id) {
                    out.push(summary);
                }
            }
        }
        out.sort_by(|a, b| b.last_activity_at.cmp(&a.last_activity_at));
        Ok(out)
    }

    /// Timestamp of the most recent activity for an agent, if any. The
    /// auto-sleep monitor combines this with the container start time.
    pub fn last_activity(&self, agent_slug: &str) -> Result<Option<DateTime<Utc>>> {
        Ok(self
            .list_sessions(agent_slug)?
            .first()
            .map(|summary| summary.last_activity_at))
    }

    fn agent_slugs(&self) -> Result<Vec<String>> {
        let mut slugs = Vec::new();
        let entries = match std::fs::read_dir(&self.agents_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(slugs),
            Err(e) => return Err(e.into()),
        };
        for entry in entries.flatten() {
            if entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false) {
                slugs.push(entry.file_name().to_string_lossy().to_string());
            }
        }
        Ok(slugs)
    }
}

fn truncate_name(text: &str) -> String {
    let trimmed = text.trim();
    if trimmed.chars().count() <= NAME_LIMIT {
        trimmed.to_string()
    } else {
        trimmed.chars().take(NAME_LIMIT).collect()
    }
}

/// Test-support helper: append one raw record to a session log the way
/// the in-container runtime would.
pub fn append_log_record(path: &Path, record: &serde_json::Value) -> std::io::Result<()> {
    use std::io::Write;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    writeln!(file, "{}", record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Fixture {
        _tmp: tempfile::TempDir,
        service: SessionService,
        agents_dir: PathBuf,
    }

    fn fixture() -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let agents_dir = tmp.path().join("agents");
        std::fs::create_dir_all(agents_dir.join("a1/workspace")).unwrap();
        Fixture {
            service: SessionService::new(&agents_dir),
            agents_dir,
            _tmp: tmp,
        }
    }

    fn log_path(fixture: &Fixture, agent: &str, session: &str) -> PathBuf {
        fixture
            .agents_dir
            .join(agent)
            .join("workspace")
            .join(SESSION_LOG_DIR)
            .join(format!("{}.jsonl", session))
    }

    fn user_line(text: &str, ts: &str) -> serde_json::Value {
        json!({"type": "user", "message": {"role": "user", "content": text}, "timestamp": ts})
    }

    fn assistant_line(text: &str, ts: &str) -> serde_json::Value {
        json!({
            "type": "assistant",
            "message": {"role": "assistant", "content": [{"type": "text", "text": text}]},
            "timestamp": ts
        })
    }

    #[tokio::test]
    async fn test_registered_session_listed_before_log_exists() {
        let fx = fixture();
        fx.service
            .register_session("a1", "s1", Some("digest".into()), Some("task-1".into()))
            .await
            .unwrap();

        let sessions = fx.service.list_sessions("a1").unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].id, "s1");
        assert_eq!(sessions[0].name, "digest");
        assert_eq!(sessions[0].message_count, 0);
        assert_eq!(sessions[0].scheduled_task_id.as_deref(), Some("task-1"));
    }

    #[tokio::test]
    async fn test_message_count_tracks_appended_entries() {
        let fx = fixture();
        fx.service
            .register_session("a1", "s1", None, None)
            .await
            .unwrap();

        let path = log_path(&fx, "a1", "s1");
        append_log_record(&path, &user_line("hello", "2026-08-01T10:00:00Z")).unwrap();
        append_log_record(&path, &assistant_line("hi", "2026-08-01T10:00:05Z")).unwrap();
        // Tool records count toward activity but not messageCount.
        append_log_record(
            &path,
            &json!({"type": "tool_use", "timestamp": "2026-08-01T10:00:06Z"}),
        )
        .unwrap();

        let sessions = fx.service.list_sessions("a1").unwrap();
        assert_eq!(sessions[0].message_count, 2);
    }

    #[tokio::test]
    async fn test_exactly_one_entry_per_session_id() {
        let fx = fixture();
        fx.service
            .register_session("a1", "s1", None, None)
            .await
            .unwrap();
        let path = log_path(&fx, "a1", "s1");
        append_log_record(&path, &user_line("hello", "2026-08-01T10:00:00Z")).unwrap();

        let sessions = fx.service.list_sessions("a1").unwrap();
        assert_eq!(sessions.len(), 1);
    }

    #[tokio::test]
    async fn test_name_derived_from_first_user_message() {
        let fx = fixture();
        let path = log_path(&fx, "a1", "s2");
        let long = "x".repeat(80);
        append_log_record(&path, &user_line(&long, "2026-08-01T10:00:00Z")).unwrap();

        let sessions = fx.service.list_sessions("a1").unwrap();
        assert_eq!(sessions[0].name.chars().count(), 50);
    }

    #[tokio::test]
    async fn test_sorted_by_last_activity_descending() {
        let fx = fixture();
        append_log_record(
            &log_path(&fx, "a1", "old"),
            &user_line("old", "2026-08-01T08:00:00Z"),
        )
        .unwrap();
        append_log_record(
            &log_path(&fx, "a1", "new"),
            &user_line("new", "2026-08-01T12:00:00Z"),
        )
        .unwrap();

        let sessions = fx.service.list_sessions("a1").unwrap();
        assert_eq!(sessions[0].id, "new");
        assert_eq!(sessions[1].id, "old");
    }

    #[tokio::test]
    async fn test_get_messages_filters_non_chat_records() {
        let fx = fixture();
        let path = log_path(&fx, "a1", "s1");
        append_log_record(&path, &user_line("hello", "2026-08-01T10:00:00Z")).unwrap();
        append_log_record(&path, &json!({"type": "tool_result", "content": "42"})).unwrap();
        append_log_record(&path, &assistant_line("hi", "2026-08-01T10:00:05Z")).unwrap();

        let messages = fx.service.get_messages("a1", "s1").unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, MessageRole::User);
        assert_eq!(messages[0].content, "hello");
        assert_eq!(messages[1].role, MessageRole::Assistant);
        assert_eq!(messages[1].content, "hi");
    }

    #[tokio::test]
    async fn test_get_messages_unknown_session_not_found() {
        let fx = fixture();
        assert!(fx
            .service
            .get_messages("a1", "missing")
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn test_patch_and_delete() {
        let fx = fixture();
        fx.service
            .register_session("a1", "s1", None, None)
            .await
            .unwrap();
        fx.service
            .patch_session(
                "a1",
                "s1",
                SessionPatch {
                    name: Some("renamed".into()),
                    starred: Some(true),
                },
            )
            .await
            .unwrap();

        let session = fx.service.get_session("a1", "s1").unwrap();
        assert_eq!(session.name, "renamed");
        assert!(session.starred);

        fx.service.delete_session("a1", "s1").await.unwrap();
        assert!(fx.service.get_session("a1", "s1").unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_find_session_across_agents() {
        let fx = fixture();
        std::fs::create_dir_all(fx.agents_dir.join("a2/workspace")).unwrap();
        fx.service
            .register_session("a2", "s9", None, None)
            .await
            .unwrap();

        let found = fx.service.find_session_across_agents("s9").unwrap().unwrap();
        assert_eq!(found.agent_slug, "a2");
        assert!(fx.service.find_session_across_agents("nope").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_sessions_for_task() {
        let fx = fixture();
        fx.service
            .register_session("a1", "s1", None, Some("task-7".into()))
            .await
            .unwrap();
        fx.service
            .register_session("a1", "s2", None, None)
            .await
            .unwrap();

        let sessions = fx.service.sessions_for_task("task-7").unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].id, "s1");
    }

    #[tokio::test]
    async fn test_last_activity() {
        let fx = fixture();
        assert!(fx.service.last_activity("a1").unwrap().is_none());

        append_log_record(
            &log_path(&fx, "a1", "s1"),
            &user_line("hi", "2026-08-01T10:00:00Z"),
        )
        .unwrap();
        let last = fx.service.last_activity("a1").unwrap().unwrap();
        assert_eq!(last, "2026-08-01T10:00:00Z".parse::<DateTime<Utc>>().unwrap());
    }
}
