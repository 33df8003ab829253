//! Error type for runtime operations.

use thiserror::Error;

/// Errors from the runtime abstraction and its managers.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The runtime CLI is missing or its daemon is not running.
    #[error("runtime unavailable: {0}")]
    Unavailable(String),

    /// A runtime CLI invocation failed.
    #[error("{command} failed: {stderr}")]
    CommandFailed { command: String, stderr: String },

    /// The agent image is missing or could not be pulled.
    #[error("image pull failed: {0}")]
    ImagePull(String),

    /// The container never became healthy within the start timeout.
    #[error("container start timed out: {0}")]
    StartTimeout(String),

    /// No container (or browser instance) for this agent.
    #[error("not found: {0}")]
    NotFound(String),

    /// Spawn, signal, or filesystem failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<RuntimeError> for waystation_core::Error {
    fn from(err: RuntimeError) -> Self {
        match err {
            RuntimeError::Unavailable(msg) => Self::RuntimeUnavailable(msg),
            RuntimeError::ImagePull(msg) => Self::ImagePullFailed(msg),
            RuntimeError::NotFound(msg) => Self::NotFound(msg),
            RuntimeError::StartTimeout(msg) => Self::Internal(format!("start timeout: {}", msg)),
            other => Self::Internal(other.to_string()),
        }
    }
}

/// Result type for runtime operations.
pub type RuntimeResult<T> = std::result::Result<T, RuntimeError>;
