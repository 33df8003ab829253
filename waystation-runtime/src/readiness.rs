//! Image readiness state machine.
//!
//! ```text
//! UNKNOWN → CHECKING → READY
//!                    → PULLING_IMAGE → READY | ERROR
//!                    → RUNTIME_UNAVAILABLE
//! ```
//!
//! Every transition publishes `runtime_readiness_changed` on the event
//! bus. Pull progress stays off the bus — the runner reports it over its
//! own sink and the controller keeps only the latest sample, which the
//! runtime-status poll exposes. A pull can be cancelled by the user,
//! which aborts the child process and lands in `ERROR`.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use waystation_core::events::{Event, EventBus};
use waystation_core::types::RuntimeReadiness;

use crate::runner::{ContainerRunner, PullProgress};

/// Owns the readiness state and the in-flight pull task, if any.
pub struct ReadinessController {
    state: Mutex<RuntimeReadiness>,
    pull_task: Mutex<Option<JoinHandle<()>>>,
    pull_progress: Mutex<Option<PullProgress>>,
    bus: Arc<EventBus>,
}

impl ReadinessController {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self {
            state: Mutex::new(RuntimeReadiness::Unknown),
            pull_task: Mutex::new(None),
            pull_progress: Mutex::new(None),
            bus,
        }
    }

    pub fn current(&self) -> RuntimeReadiness {
        self.state.lock().clone()
    }

    /// Latest sample from the in-flight pull, if one is running.
    pub fn pull_progress(&self) -> Option<PullProgress> {
        self.pull_progress.lock().clone()
    }

    fn transition(&self, next: RuntimeReadiness) {
        {
            let mut state = self.state.lock();
            if *state == next {
                return;
            }
            *state = next.clone();
        }
        self.bus
            .publish(Event::RuntimeReadinessChanged { readiness: next });
    }

    /// Re-evaluate readiness for the given runner/image, pulling if the
    /// image is absent. Called at startup and on runner change.
    pub async fn check(self: &Arc<Self>, runner: Arc<dyn ContainerRunner>, image: String) {
        self.transition(RuntimeReadiness::Checking);

        let availability = runner.availability().await;
        if !availability.running {
            self.transition(RuntimeReadiness::RuntimeUnavailable);
            return;
        }

        match runner.image_exists(&image).await {
            Ok(true) => self.transition(RuntimeReadiness::Ready),
            Ok(false) => self.begin_pull(runner, image),
            Err(e) => self.transition(RuntimeReadiness::Error {
                message: e.to_string(),
            }),
        }
    }

    /// Start a background pull. No-op when one is already in flight.
    pub fn begin_pull(self: &Arc<Self>, runner: Arc<dyn ContainerRunner>, image: String) {
        let mut slot = self.pull_task.lock();
        if slot.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }
        self.transition(RuntimeReadiness::PullingImage);

        let controller = self.clone();
        let handle = tokio::spawn(async move {
            let (tx, mut rx) = mpsc::channel::<PullProgress>(64);
            let sink = controller.clone();
            let track = tokio::spawn(async move {
                while let Some(update) = rx.recv().await {
                    *sink.pull_progress.lock() = Some(update);
                }
            });

            let result = runner.pull_image(&image, tx).await;
            track.abort();
            *controller.pull_progress.lock() = None;
            match result {
                Ok(()) => controller.transition(RuntimeReadiness::Ready),
                Err(e) => {
                    tracing::warn!(image = %image, error = %e, "image pull failed");
                    controller.transition(RuntimeReadiness::Error {
                        message: e.to_string(),
                    });
                }
            }
        });
        *slot = Some(handle);
    }

    /// Abort an in-flight pull. The state lands in `ERROR`, never a
    /// partial `READY`.
    pub fn cancel_pull(&self) {
        let mut slot = self.pull_task.lock();
        if let Some(task) = slot.take() {
            if !task.is_finished() {
                task.abort();
                *self.pull_progress.lock() = None;
                self.transition(RuntimeReadiness::Error {
                    message: "image pull cancelled".to_string(),
                });
            }
        }
    }

    /// User-requested reset after an error; the caller follows up with a
    /// fresh `check`.
    pub fn reset(&self) {
        *self.pull_progress.lock() = None;
        self.transition(RuntimeReadiness::Unknown);
    }

    pub async fn shutdown(&self) {
        if let Some(task) = self.pull_task.lock().take() {
            task.abort();
        }
    }
}
