use axum::Json;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use crate::engine::SchedulingError;

#[derive(Debug)]
pub enum ApiError {
    /// A path or body identifier that is not a ULID.
    InvalidId(String),
    /// Malformed body or query string.
    BadRequest(String),
    /// Missing or invalid tenant context.
    Forbidden(String),
    NotFound(String),
    Scheduling(SchedulingError),
}

impl From<SchedulingError> for ApiError {
    fn from(e: SchedulingError) -> Self {
        ApiError::Scheduling(e)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(e: JsonRejection) -> Self {
        ApiError::BadRequest(e.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(e: QueryRejection) -> Self {
        ApiError::BadRequest(e.body_text())
    }
}

impl ApiError {
    /// Status, stable code and short title.
    fn parts(&self) -> (StatusCode, &'static str, &'static str) {
        match self {
            ApiError::InvalidId(_) => (StatusCode::BAD_REQUEST, "INVALID_ID", "Invalid id"),
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", "Validation error"),
            ApiError::Forbidden(_) => (StatusCode::FORBIDDEN, "FORBIDDEN", "Access denied"),
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND", "Not found"),
            ApiError::Scheduling(e) => match e {
                SchedulingError::Validation(_) => {
                    (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", "Validation error")
                }
                SchedulingError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND", "Not found"),
                SchedulingError::Forbidden(_) => (StatusCode::FORBIDDEN, "FORBIDDEN", "Access denied"),
                SchedulingError::SlotConflict { .. } => {
                    (StatusCode::CONFLICT, "SLOT_CONFLICT", "Slot unavailable")
                }
                SchedulingError::VersionConflict { .. } => {
                    (StatusCode::CONFLICT, "VERSION_CONFLICT", "Stale version")
                }
                SchedulingError::IdempotencyKeyReuse(_) => (
                    StatusCode::UNPROCESSABLE_ENTITY,
                    "IDEMPOTENCY_KEY_REUSE",
                    "Idempotency key reused",
                ),
                SchedulingError::InvalidTransition { .. } => {
                    (StatusCode::BAD_REQUEST, "INVALID_TRANSITION", "Invalid transition")
                }
                SchedulingError::LimitExceeded(_) => (
                    StatusCode::UNPROCESSABLE_ENTITY,
                    "LIMIT_EXCEEDED",
                    "Limit exceeded",
                ),
                SchedulingError::WalError(_) | SchedulingError::Internal(_) => (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_ERROR",
                    "Internal error",
                ),
            },
        }
    }

    fn message(&self) -> String {
        match self {
            ApiError::InvalidId(msg)
            | ApiError::BadRequest(msg)
            | ApiError::Forbidden(msg)
            | ApiError::NotFound(msg) => msg.clone(),
            ApiError::Scheduling(SchedulingError::WalError(_) | SchedulingError::Internal(_)) => {
                "an internal error occurred".into()
            }
            ApiError::Scheduling(e) => e.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, title) = self.parts();
        if status.is_server_error() {
            tracing::error!(code, error = ?self, "request failed");
        }

        let mut body = json!({
            "success": false,
            "error": title,
            "code": code,
            "message": self.message(),
        });
        match &self {
            ApiError::Scheduling(SchedulingError::SlotConflict {
                booking_id: Some(id),
                ..
            }) => body["conflicting_booking_id"] = json!(id.to_string()),
            ApiError::Scheduling(SchedulingError::VersionConflict { current, .. }) => {
                body["current_version"] = json!(current)
            }
            _ => {}
        }
        (status, Json(body)).into_response()
    }
}
