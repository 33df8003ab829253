//! Scheduled task records and their state machine.
//!
//! Only `pending` tasks are eligible to fire. The scheduler transitions
//! them `pending → running → done | failed`; recurring tasks re-arm on
//! success by moving `next_execution_at` forward and reverting to
//! `pending`. Cancellation is legal from any non-terminal state; reset
//! returns a terminal task to `pending`.

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, OptionalExtension, Row};
use uuid::Uuid;

use super::db::{from_millis, to_millis, Database};
use crate::error::{Error, Result};
use crate::types::{ScheduledTask, TaskStatus};

/// Payload for creating a task.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub agent_slug: String,
    pub name: Option<String>,
    pub prompt: String,
    pub next_execution_at: DateTime<Utc>,
    pub recurrence_minutes: Option<i64>,
}

const TASK_COLS: &str = "id, agent_slug, name, prompt, next_execution_at, recurrence_minutes, \
                         status, last_error, created_at";

fn row_to_task(row: &Row<'_>) -> rusqlite::Result<ScheduledTask> {
    let status: String = row.get(6)?;
    Ok(ScheduledTask {
        id: row.get(0)?,
        agent_slug: row.get(1)?,
        name: row.get(2)?,
        prompt: row.get(3)?,
        next_execution_at: from_millis(row.get(4)?),
        recurrence_minutes: row.get(5)?,
        status: TaskStatus::parse(&status).unwrap_or(TaskStatus::Failed),
        last_error: row.get(7)?,
        created_at: from_millis(row.get(8)?),
    })
}

impl Database {
    pub fn create_task(&self, new: NewTask) -> Result<ScheduledTask> {
        if new.prompt.trim().is_empty() {
            return Err(Error::Validation("task prompt cannot be empty".into()));
        }
        if new.recurrence_minutes.is_some_and(|minutes| minutes <= 0) {
            return Err(Error::Validation(
                "recurrence must be a positive number of minutes".into(),
            ));
        }
        let task = ScheduledTask {
            id: Uuid::new_v4().to_string(),
            agent_slug: new.agent_slug,
            name: new.name,
            prompt: new.prompt,
            next_execution_at: new.next_execution_at,
            recurrence_minutes: new.recurrence_minutes,
            status: TaskStatus::Pending,
            last_error: None,
            created_at: Utc::now(),
        };
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO scheduled_tasks (id, agent_slug, name, prompt, next_execution_at,
                                              recurrence_minutes, status, last_error, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, NULL, ?8)",
                params![
                    task.id,
                    task.agent_slug,
                    task.name,
                    task.prompt,
                    to_millis(task.next_execution_at),
                    task.recurrence_minutes,
                    task.status.as_str(),
                    to_millis(task.created_at),
                ],
            )?;
            Ok(())
        })?;
        Ok(task)
    }

    pub fn get_task(&self, id: &str) -> Result<Option<ScheduledTask>> {
        self.with_conn(|conn| {
            let task = conn
                .query_row(
                    &format!("SELECT {TASK_COLS} FROM scheduled_tasks WHERE id = ?1"),
                    params![id],
                    row_to_task,
                )
                .optional()?;
            Ok(task)
        })
    }

    pub fn list_tasks(&self) -> Result<Vec<ScheduledTask>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {TASK_COLS} FROM scheduled_tasks ORDER BY next_execution_at ASC"
            ))?;
            let tasks = stmt
                .query_map([], row_to_task)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(tasks)
        })
    }

    /// Pending tasks whose `next_execution_at` has passed.
    pub fn due_tasks(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledTask>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {TASK_COLS} FROM scheduled_tasks
                 WHERE status = 'pending' AND next_execution_at <= ?1
                 ORDER BY next_execution_at ASC"
            ))?;
            let tasks = stmt
                .query_map(params![to_millis(now)], row_to_task)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(tasks)
        })
    }

    /// Claim a pending task for execution. Returns false if the task was
    /// no longer pending (raced with a cancel or another tick).
    pub fn mark_task_running(&self, id: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE scheduled_tasks SET status = 'running' WHERE id = ?1 AND status = 'pending'",
                params![id],
            )?;
            Ok(changed == 1)
        })
    }

    /// Record success. Recurring tasks re-arm and revert to pending.
    pub fn mark_task_done(&self, id: &str, completed_at: DateTime<Utc>) -> Result<ScheduledTask> {
        let task = self
            .get_task(id)?
            .ok_or_else(|| Error::NotFound(format!("scheduled task {}", id)))?;
        let (status, next) = match task.recurrence_minutes {
            Some(minutes) => (
                TaskStatus::Pending,
                completed_at + Duration::minutes(minutes),
            ),
            None => (TaskStatus::Done, task.next_execution_at),
        };
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE scheduled_tasks
                 SET status = ?2, next_execution_at = ?3, last_error = NULL
                 WHERE id = ?1",
                params![id, status.as_str(), to_millis(next)],
            )?;
            Ok(())
        })?;
        self.get_task(id)?
            .ok_or_else(|| Error::NotFound(format!("scheduled task {}", id)))
    }

    pub fn mark_task_failed(&self, id: &str, error: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE scheduled_tasks SET status = 'failed', last_error = ?2 WHERE id = ?1",
                params![id, error],
            )?;
            Ok(())
        })
    }

    /// Cancel any non-terminal task.
    pub fn cancel_task(&self, id: &str) -> Result<ScheduledTask> {
        let task = self
            .get_task(id)?
            .ok_or_else(|| Error::NotFound(format!("scheduled task {}", id)))?;
        if task.status.is_terminal() {
            return Err(Error::Validation(format!(
                "task is already {}",
                task.status.as_str()
            )));
        }
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE scheduled_tasks SET status = 'cancelled' WHERE id = ?1",
                params![id],
            )?;
            Ok(())
        })?;
        self.get_task(id)?
            .ok_or_else(|| Error::NotFound(format!("scheduled task {}", id)))
    }

    /// Return a terminal task to pending so it fires again.
    pub fn reset_task(&self, id: &str, next_execution_at: DateTime<Utc>) -> Result<ScheduledTask> {
        let task = self
            .get_task(id)?
            .ok_or_else(|| Error::NotFound(format!("scheduled task {}", id)))?;
        if !task.status.is_terminal() {
            return Err(Error::Validation(format!(
                "only finished tasks can be reset (task is {})",
                task.status.as_str()
            )));
        }
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE scheduled_tasks
                 SET status = 'pending', last_error = NULL, next_execution_at = ?2
                 WHERE id = ?1",
                params![id, to_millis(next_execution_at)],
            )?;
            Ok(())
        })?;
        self.get_task(id)?
            .ok_or_else(|| Error::NotFound(format!("scheduled task {}", id)))
    }

    pub fn delete_task(&self, id: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute("DELETE FROM scheduled_tasks WHERE id = ?1", params![id])?;
            Ok(())
        })
    }
}
