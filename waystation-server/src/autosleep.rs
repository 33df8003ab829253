//! Auto-sleep monitor.
//!
//! Ticks every minute and stops containers that have been idle past the
//! configured threshold. Idleness is measured from the later of the most
//! recent session activity and the container start time; a threshold of
//! zero disables the monitor.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;

use waystation_core::types::ContainerState;
use waystation_core::{SessionService, SettingsStore};
use waystation_runtime::ContainerManager;

const DEFAULT_TICK: Duration = Duration::from_secs(60);

pub struct AutoSleepMonitor {
    manager: Arc<ContainerManager>,
    sessions: Arc<SessionService>,
    settings: Arc<SettingsStore>,
}

impl AutoSleepMonitor {
    pub fn new(
        manager: Arc<ContainerManager>,
        sessions: Arc<SessionService>,
        settings: Arc<SettingsStore>,
    ) -> Arc<Self> {
        Arc::new(Self {
            manager,
            sessions,
            settings,
        })
    }

    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let monitor = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(DEFAULT_TICK);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tick.tick().await;
                monitor.tick_once().await;
            }
        })
    }

    /// One idleness pass over running containers.
    pub async fn tick_once(&self) {
        self.tick_at(Utc::now()).await;
    }

    /// Idleness pass against an explicit clock.
    pub async fn tick_at(&self, now: chrono::DateTime<Utc>) {
        let timeout_minutes = match self.settings.load() {
            Ok(settings) => settings.app.auto_sleep_timeout_minutes,
            Err(e) => {
                tracing::error!(error = %e, "settings load failed in auto-sleep");
                return;
            }
        };
        if timeout_minutes == 0 {
            return;
        }
        let threshold = chrono::Duration::minutes(timeout_minutes as i64);

        for (slug, status) in self.manager.statuses() {
            if status.status != ContainerState::Running {
                continue;
            }
            let Some(started_at) = status.started_at else {
                continue;
            };
            let last_activity = self
                .sessions
                .last_activity(&slug)
                .unwrap_or_default()
                .map_or(started_at, |activity| activity.max(started_at));

            if now - last_activity > threshold {
                tracing::info!(agent = %slug, "stopping idle container");
                if let Err(e) = self.manager.stop(&slug).await {
                    tracing::warn!(agent = %slug, error = %e, "auto-sleep stop failed");
                }
            }
        }
    }
}
