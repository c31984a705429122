use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

/// Structured handler error: status code, message, optional hint. Rendered
/// as `{"error": ..., "hint": ...}`.
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
    pub hint: Option<String>,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        ApiError {
            status,
            message: message.into(),
            hint: None,
        }
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, msg)
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, msg)
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, msg)
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, msg)
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = match &self.hint {
            Some(hint) => json!({ "error": self.message, "hint": hint }),
            None => json!({ "error": self.message }),
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<hive_store::StoreError> for ApiError {
    fn from(e: hive_store::StoreError) -> Self {
        use hive_store::StoreError::*;
        match &e {
            DroneNotFound(_) | PackageNotFound(_) | SessionNotFound(_) | PayloadNotFound(..)
            | ReleaseNotFound(_) => ApiError::not_found(e.to_string()),
            DuplicatePayload(..) | InvalidReleaseTransition { .. } => {
                ApiError::conflict(e.to_string())
            }
            RejectedQuery(_) => ApiError::bad_request(e.to_string())
                .with_hint("only a single SELECT statement is allowed"),
            Domain(d) => ApiError::bad_request(d.to_string()),
            _ => ApiError::internal(e.to_string()),
        }
    }
}

impl From<hive_domain::DomainError> for ApiError {
    fn from(e: hive_domain::DomainError) -> Self {
        ApiError::bad_request(e.to_string())
    }
}

impl From<hive_sched::SchedError> for ApiError {
    fn from(e: hive_sched::SchedError) -> Self {
        match e {
            hive_sched::SchedError::Store(e) => e.into(),
            other => ApiError::internal(other.to_string()),
        }
    }
}

impl From<hive_health::HealthError> for ApiError {
    fn from(e: hive_health::HealthError) -> Self {
        match e {
            hive_health::HealthError::Store(e) => e.into(),
            other => ApiError::internal(other.to_string()),
        }
    }
}

impl From<hive_payload::PayloadError> for ApiError {
    fn from(e: hive_payload::PayloadError) -> Self {
        use hive_payload::PayloadError::*;
        match e {
            Store(e) => e.into(),
            NotFound { .. } | DroneNotFound(_) | NothingDeployed { .. } => {
                ApiError::not_found(e.to_string())
            }
            other => ApiError::internal(other.to_string()),
        }
    }
}
