//! Error types for the waystation server.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

use waystation_core::Error;

/// HTTP-facing error wrapper around the core taxonomy.
#[derive(Debug, thiserror::Error)]
#[error(transparent)]
pub struct ApiError(#[from] pub Error);

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Validation(_) => StatusCode::BAD_REQUEST,
            Error::Conflict(_) => StatusCode::CONFLICT,
            Error::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Error::Forbidden(_) => StatusCode::FORBIDDEN,
            Error::RuntimeUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::ImagePullFailed(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::UpstreamTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Error::Upstream(_) => StatusCode::BAD_GATEWAY,
            Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self.0, "request failed");
        }
        let body = Json(serde_json::json!({
            "error": self.0.to_string(),
            "code": status.as_u16(),
        }));
        (status, body).into_response()
    }
}

/// Result type alias for handler functions.
pub type ApiResult<T> = Result<T, ApiError>;

/// Shorthand used all over the handlers.
pub fn not_found(what: impl std::fmt::Display) -> ApiError {
    ApiError(Error::NotFound(what.to_string()))
}

pub fn bad_request(message: impl std::fmt::Display) -> ApiError {
    ApiError(Error::Validation(message.to_string()))
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
