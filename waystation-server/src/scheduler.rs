//! Task scheduler.
//!
//! Ticks every 30 seconds, claims due `pending` tasks, wakes the agent's
//! container, registers a session eagerly (so it lists immediately with
//! zero messages), and delivers the prompt to the in-container runtime
//! over its mapped port. One task failing never takes the scheduler
//! down; the error lands in `last_error` and the loop moves on.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use waystation_core::events::Event;
use waystation_core::types::ScheduledTask;
use waystation_core::{Database, Error, EventBus, Result, SessionService};
use waystation_runtime::ContainerManager;

const DEFAULT_TICK: Duration = Duration::from_secs(30);

pub struct Scheduler {
    db: Database,
    sessions: Arc<SessionService>,
    manager: Arc<ContainerManager>,
    bus: Arc<EventBus>,
    client: reqwest::Client,
    tick_interval: Duration,
}

impl Scheduler {
    pub fn new(
        db: Database,
        sessions: Arc<SessionService>,
        manager: Arc<ContainerManager>,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            db,
            sessions,
            manager,
            bus,
            client: reqwest::Client::new(),
            tick_interval: DEFAULT_TICK,
        }
    }

    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    /// Spawn the ticker. Aborted at shutdown via the returned handle.
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let scheduler = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(scheduler.tick_interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tick.tick().await;
                scheduler.tick_once().await;
            }
        })
    }

    /// One scheduling pass over due tasks.
    pub async fn tick_once(&self) {
        let due = match self.db.due_tasks(Utc::now()) {
            Ok(due) => due,
            Err(e) => {
                tracing::error!(error = %e, "due-task query failed");
                return;
            }
        };
        for task in due {
            // Claim; a racing cancel loses nothing.
            match self.db.mark_task_running(&task.id) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    tracing::error!(task = %task.id, error = %e, "claim failed");
                    continue;
                }
            }
            match self.execute(&task).await {
                Ok(session_id) => {
                    if let Err(e) = self.db.mark_task_done(&task.id, Utc::now()) {
                        tracing::error!(task = %task.id, error = %e, "completion record failed");
                        continue;
                    }
                    self.notify(
                        &task,
                        "Scheduled task completed",
                        &format!(
                            "{} ran on {}",
                            task.name.as_deref().unwrap_or("Task"),
                            task.agent_slug
                        ),
                        Some(&session_id),
                    );
                }
                Err(e) => {
                    tracing::warn!(task = %task.id, error = %e, "scheduled task failed");
                    if let Err(record_err) = self.db.mark_task_failed(&task.id, &e.to_string()) {
                        tracing::error!(task = %task.id, error = %record_err, "failure record failed");
                    }
                    self.notify(
                        &task,
                        "Scheduled task failed",
                        &e.to_string(),
                        None,
                    );
                }
            }
        }
    }

    /// Wake the container, register the session, deliver the prompt.
    /// Returns the session id.
    async fn execute(&self, task: &ScheduledTask) -> Result<String> {
        let port = self.manager.start(&task.agent_slug).await?;

        let session_id = Uuid::new_v4().to_string();
        self.sessions
            .register_session(
                &task.agent_slug,
                &session_id,
                task.name.clone(),
                Some(task.id.clone()),
            )
            .await?;

        let url = format!("http://127.0.0.1:{}/sessions", port);
        let response = self
            .client
            .post(&url)
            .timeout(Duration::from_secs(30))
            .json(&serde_json::json!({
                "sessionId": session_id,
                "prompt": task.prompt,
            }))
            .send()
            .await
            .map_err(|e| Error::Upstream(format!("prompt delivery: {}", e)))?;
        if !response.status().is_success() {
            return Err(Error::Upstream(format!(
                "agent runtime rejected the task prompt with {}",
                response.status()
            )));
        }
        Ok(session_id)
    }

    fn notify(&self, task: &ScheduledTask, title: &str, body: &str, session_id: Option<&str>) {
        if let Err(e) =
            self.db
                .create_notification(title, body, session_id, Some(&task.agent_slug))
        {
            tracing::warn!(error = %e, "notification record failed");
        }
        self.bus.publish(Event::OsNotification {
            title: title.to_string(),
            body: body.to_string(),
            session_id: session_id.map(String::from),
            agent_slug: Some(task.agent_slug.clone()),
        });
    }
}
