//! Top-level error taxonomy for waystation
//!
//! Errors are categorized by kind rather than by source so that the HTTP
//! layer can map them to status codes and background workers can decide
//! what is retryable without inspecting strings.

use thiserror::Error;

/// Error kinds shared across the control plane.
///
/// - [`Error::NotFound`] - the named resource does not exist
/// - [`Error::Validation`] - the request payload is malformed
/// - [`Error::Conflict`] - a restricted change while agents are running
/// - [`Error::Unauthorized`] - missing or invalid bearer token
/// - [`Error::Forbidden`] - wrong agent binding or disallowed host
/// - [`Error::RuntimeUnavailable`] - no container runtime is reachable
/// - [`Error::ImagePullFailed`] - the agent image could not be pulled
/// - [`Error::UpstreamTimeout`] - an upstream call exceeded its deadline
/// - [`Error::Upstream`] - the upstream broker or endpoint failed
/// - [`Error::Internal`] - everything else (storage, io, serialization)
#[derive(Debug, Error)]
pub enum Error {
    /// Resource does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Request payload failed validation
    #[error("validation failed: {0}")]
    Validation(String),

    /// Mutation is restricted while agents are running
    #[error("conflict: {0}")]
    Conflict(String),

    /// Missing or invalid synthetic token
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Token bound to another agent, or host not in the allowlist
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// The selected container runtime is not installed or not running
    #[error("runtime unavailable: {0}")]
    RuntimeUnavailable(String),

    /// Image pull failed or was aborted
    #[error("image pull failed: {0}")]
    ImagePullFailed(String),

    /// Upstream call exceeded its deadline
    #[error("upstream timeout: {0}")]
    UpstreamTimeout(String),

    /// Upstream broker or endpoint failure
    #[error("upstream error: {0}")]
    Upstream(String),

    /// Storage, io, serialization, or other internal failure
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Returns true if the resource was not found
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Returns true if this is a validation error
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    /// Returns true if this is a conflict error
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }

    /// Returns true if the runtime is unavailable
    pub fn is_runtime_unavailable(&self) -> bool {
        matches!(self, Self::RuntimeUnavailable(_))
    }

    /// Returns true if this error is potentially retryable
    ///
    /// Retryable errors are upstream timeouts, upstream failures, and
    /// runtime unavailability. Validation, authorization, and not-found
    /// errors are not retryable without user intervention.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::UpstreamTimeout(_) | Self::Upstream(_) | Self::RuntimeUnavailable(_)
        )
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Self::Internal(format!("database: {}", err))
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Internal(format!("io: {}", err))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal(format!("json: {}", err))
    }
}

/// Result type for waystation operations
pub type Result<T> = std::result::Result<T, Error>;
