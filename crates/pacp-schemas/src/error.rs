use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

/// The error taxonomy surfaced to callers and used to route scheduler
/// outcomes (spec §7).
#[derive(Debug, thiserror::Error)]
pub enum PlaneError {
    #[error("validation: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("not cancellable: {0}")]
    NotCancellable(String),

    /// Upstream rejected credentials or the token expired. Routing
    /// (session refresh, at-most-once-per-attempt) lives in the handler
    /// that raises this; an `AuthUpstream` that escapes a handler is
    /// treated as `Permanent` by the scheduler.
    #[error("upstream auth failed: {0}")]
    AuthUpstream(String),

    /// Network, timeout, 5xx — retryable within `max_retries`.
    #[error("transient: {0}")]
    Transient(String),

    /// Upstream 4xx other than 401 — not retried.
    #[error("permanent: {0}")]
    Permanent(String),

    /// Store or infrastructure error — surfaced as 500, not retried by
    /// default.
    #[error("internal: {0}")]
    Internal(String),
}

impl PlaneError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            PlaneError::Validation(_) => StatusCode::BAD_REQUEST,
            PlaneError::NotFound(_) => StatusCode::NOT_FOUND,
            PlaneError::Conflict(_) => StatusCode::CONFLICT,
            PlaneError::NotCancellable(_) => StatusCode::BAD_REQUEST,
            PlaneError::AuthUpstream(_) => StatusCode::BAD_GATEWAY,
            PlaneError::Transient(_) => StatusCode::BAD_GATEWAY,
            PlaneError::Permanent(_) => StatusCode::BAD_GATEWAY,
            PlaneError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether the scheduler should feed this error into the retry path
    /// when a handler lets it escape (spec §7 propagation policy).
    pub fn is_retryable(&self) -> bool {
        matches!(self, PlaneError::Transient(_))
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for PlaneError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorBody {
            error: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

impl From<anyhow::Error> for PlaneError {
    fn from(e: anyhow::Error) -> Self {
        PlaneError::Internal(e.to_string())
    }
}

impl From<sqlx::Error> for PlaneError {
    fn from(e: sqlx::Error) -> Self {
        PlaneError::Internal(e.to_string())
    }
}
