//! Client-facing error classification.
//!
//! Every handler failure ends up as one `ApiError`. The variant decides the
//! status code and a stable `code` string. `detail` is always a client-safe
//! message: collaborator errors are logged here, never echoed back.

use crate::analyzer::AnalysisError;
use crate::db::StoreError;
use crate::queue::QueueError;
use crate::wire::ValidationError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    Unauthorized(&'static str),

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("{0}")]
    MalformedBody(String),

    #[error("{0}")]
    InvalidRequest(String),

    /// Nothing from the batch was persisted.
    #[error("sessions were not stored")]
    StorageFailed(#[source] StoreError),

    /// The batch was persisted but only `queued` of `total` analysis jobs
    /// were enqueued.
    #[error("{total} session(s) stored but only {queued} queued for analysis")]
    AnalysisNotQueued {
        queued: usize,
        total: usize,
        #[source]
        source: QueueError,
    },

    #[error("session store unavailable")]
    Store(#[source] StoreError),

    #[error("analysis failed")]
    Analysis(#[source] AnalysisError),

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::MalformedBody(_) => StatusCode::BAD_REQUEST,
            ApiError::InvalidRequest(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::StorageFailed(_) | ApiError::Store(_) | ApiError::Analysis(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            ApiError::AnalysisNotQueued { .. } => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ApiError::Unauthorized(_) => "unauthorized",
            ApiError::NotFound(_) => "not_found",
            ApiError::MalformedBody(_) => "malformed_body",
            ApiError::InvalidRequest(_) => "invalid_request",
            ApiError::StorageFailed(_) => "storage_failed",
            ApiError::AnalysisNotQueued { .. } => "analysis_not_queued",
            ApiError::Store(_) => "storage_error",
            ApiError::Analysis(_) => "analysis_failed",
            ApiError::Timeout(_) => "timeout",
        }
    }
}

impl From<ValidationError> for ApiError {
    fn from(e: ValidationError) -> Self {
        ApiError::InvalidRequest(e.to_string())
    }
}

impl From<AnalysisError> for ApiError {
    fn from(e: AnalysisError) -> Self {
        match e {
            AnalysisError::Store(source) => ApiError::Store(source),
            other => ApiError::Analysis(other),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            let cause = std::error::Error::source(&self)
                .map(|e| e.to_string())
                .unwrap_or_default();
            tracing::error!(code = self.code(), cause = %cause, "{self}");
        } else {
            tracing::debug!(code = self.code(), "{self}");
        }

        let body = serde_json::json!({
            "detail": self.to_string(),
            "code": self.code(),
        });
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_message() {
        let err = ApiError::NotFound("Session");
        assert_eq!(err.to_string(), "Session not found");
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn storage_failure_hides_cause() {
        let err = ApiError::StorageFailed(StoreError::Task("disk I/O error at /var/db".into()));
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.code(), "storage_failed");
        assert!(!err.to_string().contains("/var/db"));
    }

    #[test]
    fn partial_enqueue_reports_counts() {
        let err = ApiError::AnalysisNotQueued {
            queued: 1,
            total: 3,
            source: QueueError::Full { capacity: 8 },
        };
        assert_eq!(err.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            err.to_string(),
            "3 session(s) stored but only 1 queued for analysis"
        );
    }

    #[test]
    fn analyzer_store_failure_is_a_storage_error() {
        let err: ApiError = AnalysisError::Store(StoreError::Closed).into();
        assert_eq!(err.code(), "storage_error");
        let err: ApiError = AnalysisError::SessionNotFound("s1".into()).into();
        assert_eq!(err.code(), "analysis_failed");
    }

    #[test]
    fn timeout_is_gateway_timeout() {
        let err = ApiError::Timeout("session store");
        assert_eq!(err.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(err.to_string(), "timed out waiting for session store");
    }
}
