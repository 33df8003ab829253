//! Directory-backed agent store.
//!
//! An agent is a directory under `<dataDir>/agents/` keyed by its slug,
//! holding a `workspace/` subtree and an `instructions.md` whose YAML
//! frontmatter carries `{name, description?, createdAt}`. The slug and the
//! directory name are the same thing, and `createdAt` is set once at
//! creation and never mutated.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::pathlock::PathLocks;
use crate::slug::generate_slug;
use crate::types::AgentRecord;

/// File name of the instructions document inside an agent workspace.
pub const INSTRUCTIONS_FILE: &str = "instructions.md";

/// Payload for creating an agent.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct NewAgent {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub instructions: String,
}

/// Merge patch for an agent. The slug never changes, even when the name
/// does.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct AgentPatch {
    pub name: Option<String>,
    pub description: Option<String>,
    pub instructions: Option<String>,
}

/// Full agent view: metadata plus the instructions body.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentDetail {
    #[serde(flatten)]
    pub record: AgentRecord,
    pub instructions: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Frontmatter {
    name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    #[serde(default)]
    created_at: Option<DateTime<Utc>>,
}

fn render_instructions(front: &Frontmatter, body: &str) -> Result<String> {
    let yaml = serde_yaml::to_string(front)
        .map_err(|e| Error::Internal(format!("frontmatter: {}", e)))?;
    Ok(format!("---\n{}---\n\n{}", yaml, body))
}

fn parse_instructions(raw: &str) -> Result<(Frontmatter, String)> {
    let rest = raw
        .strip_prefix("---\n")
        .ok_or_else(|| Error::Internal("instructions file has no frontmatter".into()))?;
    let (yaml, body) = rest
        .split_once("\n---")
        .ok_or_else(|| Error::Internal("unterminated frontmatter".into()))?;
    let front: Frontmatter = serde_yaml::from_str(yaml)
        .map_err(|e| Error::Internal(format!("frontmatter: {}", e)))?;
    Ok((front, body.trim_start_matches('\n').to_string()))
}

/// Filesystem store for agents.
pub struct AgentService {
    agents_dir: PathBuf,
    locks: PathLocks,
}

impl AgentService {
    pub fn new(agents_dir: impl Into<PathBuf>) -> Self {
        Self {
            agents_dir: agents_dir.into(),
            locks: PathLocks::new(),
        }
    }

    pub fn agent_dir(&self, slug: &str) -> PathBuf {
        self.agents_dir.join(slug)
    }

    pub fn workspace_dir(&self, slug: &str) -> PathBuf {
        self.agent_dir(slug).join("workspace")
    }

    fn instructions_path(&self, slug: &str) -> PathBuf {
        self.workspace_dir(slug).join(INSTRUCTIONS_FILE)
    }

    pub fn exists(&self, slug: &str) -> bool {
        self.agent_dir(slug).is_dir()
    }

    /// Create an agent directory, generating a unique slug from the name.
    pub async fn create(&self, new: NewAgent) -> Result<AgentRecord> {
        let name = new.name.trim();
        if name.is_empty() {
            return Err(Error::Validation("agent name cannot be empty".into()));
        }
        let slug = generate_slug(name, |candidate| self.exists(candidate))?;
        let record = AgentRecord {
            slug: slug.clone(),
            name: name.to_string(),
            description: new.description.clone(),
            created_at: Utc::now(),
        };

        std::fs::create_dir_all(self.workspace_dir(&slug))?;
        let front = Frontmatter {
            name: record.name.clone(),
            description: record.description.clone(),
            created_at: Some(record.created_at),
        };
        let path = self.instructions_path(&slug);
        let lock = self.locks.lock_for(&path);
        let _guard = lock.lock().await;
        std::fs::write(&path, render_instructions(&front, &new.instructions)?)?;
        Ok(record)
    }

    fn read_record(&self, slug: &str) -> Result<(AgentRecord, String)> {
        let path = self.instructions_path(slug);
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::NotFound(format!("agent {}", slug)));
            }
            Err(e) => return Err(e.into()),
        };
        let (front, body) = parse_instructions(&raw)?;
        let record = AgentRecord {
            slug: slug.to_string(),
            name: front.name,
            description: front.description,
            // Old agents may predate the createdAt field.
            created_at: front.created_at.unwrap_or_else(Utc::now),
        };
        Ok((record, body))
    }

    pub fn get(&self, slug: &str) -> Result<AgentDetail> {
        let (record, instructions) = self.read_record(slug)?;
        Ok(AgentDetail {
            record,
            instructions,
        })
    }

    /// Scan agent directories, newest first. Unreadable entries are
    /// skipped with a warning rather than failing the listing.
    pub fn list(&self) -> Result<Vec<AgentRecord>> {
        let mut records = Vec::new();
        let entries = match std::fs::read_dir(&self.agents_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(records),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let slug = entry.file_name().to_string_lossy().to_string();
            match self.read_record(&slug) {
                Ok((record, _)) => records.push(record),
                Err(e) => {
                    tracing::warn!(slug = %slug, error = %e, "skipping unreadable agent dir");
                }
            }
        }
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(records)
    }

    /// Apply a metadata/instructions patch. `createdAt` and the slug are
    /// preserved.
    pub async fn update(&self, slug: &str, patch: AgentPatch) -> Result<AgentRecord> {
        let path = self.instructions_path(slug);
        let lock = self.locks.lock_for(&path);
        let _guard = lock.lock().await;

        let (mut record, body) = self.read_record(slug)?;
        if let Some(name) = patch.name {
            let name = name.trim().to_string();
            if name.is_empty() {
                return Err(Error::Validation("agent name cannot be empty".into()));
            }
            record.name = name;
        }
        if let Some(description) = patch.description {
            record.description = if description.is_empty() {
                None
            } else {
                Some(description)
            };
        }
        let body = patch.instructions.unwrap_or(body);

        let front = Frontmatter {
            name: record.name.clone(),
            description: record.description.clone(),
            created_at: Some(record.created_at),
        };
        std::fs::write(&path, render_instructions(&front, &body)?)?;
        Ok(record)
    }

    /// Remove the agent directory tree. Idempotent: deleting a missing
    /// agent succeeds.
    pub fn delete(&self, slug: &str) -> Result<()> {
        match std::fs::remove_dir_all(self.agent_dir(slug)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn agents_dir(&self) -> &Path {
        &self.agents_dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> (tempfile::TempDir, AgentService) {
        let tmp = tempfile::tempdir().unwrap();
        let service = AgentService::new(tmp.path().join("agents"));
        (tmp, service)
    }

    fn new_agent(name: &str) -> NewAgent {
        NewAgent {
            name: name.into(),
            description: Some("test agent".into()),
            instructions: "Be helpful.".into(),
        }
    }

    #[tokio::test]
    async fn test_create_get_round_trip() {
        let (_tmp, service) = service();
        let record = service.create(new_agent("Mail Bot")).await.unwrap();
        assert!(record.slug.starts_with("mail-bot-"));

        let detail = service.get(&record.slug).unwrap();
        assert_eq!(detail.record.name, "Mail Bot");
        assert_eq!(detail.record.description.as_deref(), Some("test agent"));
        assert_eq!(detail.instructions, "Be helpful.");
        assert_eq!(detail.record.created_at, record.created_at);
    }

    #[tokio::test]
    async fn test_create_empty_name_rejected() {
        let (_tmp, service) = service();
        let err = service.create(new_agent("   ")).await.unwrap_err();
        assert!(err.is_validation());
    }

    #[tokio::test]
    async fn test_list_sorted_newest_first() {
        let (_tmp, service) = service();
        let first = service.create(new_agent("First")).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let second = service.create(new_agent("Second")).await.unwrap();

        let list = service.list().unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].slug, second.slug);
        assert_eq!(list[1].slug, first.slug);
    }

    #[tokio::test]
    async fn test_list_tolerates_missing_created_at() {
        let (_tmp, service) = service();
        let dir = service.workspace_dir("legacy-abc123");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join(INSTRUCTIONS_FILE),
            "---\nname: Legacy\n---\n\nold agent\n",
        )
        .unwrap();

        let list = service.list().unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].name, "Legacy");
    }

    #[tokio::test]
    async fn test_update_preserves_slug_and_created_at() {
        let (_tmp, service) = service();
        let record = service.create(new_agent("Mail Bot")).await.unwrap();

        let updated = service
            .update(
                &record.slug,
                AgentPatch {
                    name: Some("Inbox Bot".into()),
                    description: None,
                    instructions: Some("Answer email.".into()),
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.slug, record.slug);
        assert_eq!(updated.name, "Inbox Bot");
        assert_eq!(updated.created_at, record.created_at);

        let detail = service.get(&record.slug).unwrap();
        assert_eq!(detail.instructions, "Answer email.");
        assert_eq!(detail.record.description.as_deref(), Some("test agent"));
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let (_tmp, service) = service();
        let record = service.create(new_agent("Mail Bot")).await.unwrap();
        service.delete(&record.slug).unwrap();
        assert!(service.get(&record.slug).unwrap_err().is_not_found());
        // Second delete is fine.
        service.delete(&record.slug).unwrap();
    }

    #[test]
    fn test_frontmatter_round_trip() {
        let front = Frontmatter {
            name: "Bot".into(),
            description: None,
            created_at: Some(Utc::now()),
        };
        let raw = render_instructions(&front, "body text").unwrap();
        let (parsed, body) = parse_instructions(&raw).unwrap();
        assert_eq!(parsed.name, "Bot");
        assert_eq!(body, "body text");
    }

    #[test]
    fn test_parse_rejects_missing_frontmatter() {
        assert!(parse_instructions("just a body").is_err());
    }
}
