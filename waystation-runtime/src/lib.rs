//! # Waystation Runtime
//!
//! Everything that touches child processes: the container runtime
//! abstraction (Docker / Podman / the macOS-native `container` CLI), the
//! per-agent container manager with its status cache and monitors, the
//! image readiness state machine, and the host browser manager.
//!
//! The container manager is the only writer of container state; the HTTP
//! layer reads cheap snapshots from its status cache and the UI polls
//! those, while lifecycle transitions are pushed over the event bus.

pub mod availability;
pub mod browser;
pub mod cli_runner;
pub mod error;
pub mod manager;
pub mod ports;
pub mod readiness;
pub mod runner;

#[cfg(feature = "test-utils")]
pub mod test_utils;

pub use availability::AvailabilityCache;
pub use browser::{BrowserProfile, DetectResult, HostBrowserManager};
pub use cli_runner::CliRunner;
pub use error::{RuntimeError, RuntimeResult};
pub use manager::{ContainerManager, ManagerConfig};
pub use readiness::ReadinessController;
pub use runner::{
    container_name, Availability, ContainerRunner, ExecOutput, InspectResult, PullProgress,
    RunSpec, RunnerSet, RunningContainer, RuntimeEvent,
};
