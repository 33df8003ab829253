//! Runner availability probe cache.
//!
//! Probing a runtime spawns a child process, which is far too expensive
//! for the UI's polling cadence. Reads always come from this cache;
//! refreshes happen on startup, on explicit request, and after a
//! `start_daemon` — never on a timer. Mutating operations invalidate.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use waystation_core::types::RunnerKind;

use crate::runner::{Availability, ContainerRunner};

/// Cache of `(runner → availability)`.
pub struct AvailabilityCache {
    entries: Mutex<HashMap<RunnerKind, Availability>>,
}

impl AvailabilityCache {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Cached probe result; `None` means never probed (or invalidated).
    pub fn get(&self, kind: RunnerKind) -> Option<Availability> {
        self.entries.lock().get(&kind).copied()
    }

    /// All cached entries.
    pub fn snapshot(&self) -> HashMap<RunnerKind, Availability> {
        self.entries.lock().clone()
    }

    /// Probe the runner and store the result.
    pub async fn refresh(&self, runner: &Arc<dyn ContainerRunner>) -> Availability {
        let availability = runner.availability().await;
        self.entries.lock().insert(runner.kind(), availability);
        availability
    }

    /// Forget one runner's probe result.
    pub fn invalidate(&self, kind: RunnerKind) {
        self.entries.lock().remove(&kind);
    }

    /// Forget everything.
    pub fn invalidate_all(&self) {
        self.entries.lock().clear();
    }
}

impl Default for AvailabilityCache {
    fn default() -> Self {
        Self::new()
    }
}
