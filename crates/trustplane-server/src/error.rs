//! HTTP error envelope.
//!
//! Core engines return tagged variants; this module maps each to a stable
//! error code and status. Clients always see the generic envelope
//! `{error, code, request_id, details?}` — no internal messages, SQL or
//! identifiers beyond the request id cross the boundary. `details` carries
//! only the whitelisted keys (`field`, `retry_after`, `max_value`,
//! `min_value`).

use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use chrono::Utc;
use std::fmt;

use trustplane::{CoreError, StoreError};

/// Stable error codes exposed to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    AuthRequired,
    SessionInvalid,
    TeamRequired,
    TeamAccessDenied,
    RoleRequired,
    RateLimited,
    ValidationError,
    NotFound,
    Conflict,
    IdempotencyConflict,
    PaymentError,
    AccountLocked,
    InternalError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::AuthRequired => "AUTH_REQUIRED",
            ErrorCode::SessionInvalid => "SESSION_INVALID",
            ErrorCode::TeamRequired => "TEAM_REQUIRED",
            ErrorCode::TeamAccessDenied => "TEAM_ACCESS_DENIED",
            ErrorCode::RoleRequired => "ROLE_REQUIRED",
            ErrorCode::RateLimited => "RATE_LIMITED",
            ErrorCode::ValidationError => "VALIDATION_ERROR",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::Conflict => "CONFLICT",
            ErrorCode::IdempotencyConflict => "IDEMPOTENCY_CONFLICT",
            ErrorCode::PaymentError => "PAYMENT_ERROR",
            ErrorCode::AccountLocked => "ACCOUNT_LOCKED",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }

    /// Generic client-facing message for the code.
    pub fn message(&self) -> &'static str {
        match self {
            ErrorCode::AuthRequired => "Authentication is required",
            ErrorCode::SessionInvalid => "Session is invalid or expired",
            ErrorCode::TeamRequired => "Team context is required",
            ErrorCode::TeamAccessDenied => "Access to this team is denied",
            ErrorCode::RoleRequired => "Insufficient permissions for this action",
            ErrorCode::RateLimited => "Too many requests, please slow down",
            ErrorCode::ValidationError => "Invalid request data",
            ErrorCode::NotFound => "Resource not found",
            ErrorCode::Conflict => "Request conflicts with current state",
            ErrorCode::IdempotencyConflict => "Idempotency key reused with different payload",
            ErrorCode::PaymentError => "Payment processing error",
            ErrorCode::AccountLocked => "Account is temporarily locked",
            ErrorCode::InternalError => "An unexpected error occurred",
        }
    }

    fn default_status(&self) -> StatusCode {
        match self {
            ErrorCode::AuthRequired | ErrorCode::SessionInvalid => StatusCode::UNAUTHORIZED,
            ErrorCode::TeamRequired | ErrorCode::ValidationError => StatusCode::BAD_REQUEST,
            ErrorCode::TeamAccessDenied | ErrorCode::RoleRequired => StatusCode::FORBIDDEN,
            ErrorCode::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ErrorCode::NotFound => StatusCode::NOT_FOUND,
            ErrorCode::Conflict | ErrorCode::IdempotencyConflict => StatusCode::CONFLICT,
            ErrorCode::PaymentError => StatusCode::BAD_REQUEST,
            ErrorCode::AccountLocked => StatusCode::LOCKED,
            ErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// An error ready to render as the standard envelope.
#[derive(Debug)]
pub struct ApiError {
    code: ErrorCode,
    status: StatusCode,
    message: Option<String>,
    request_id: Option<String>,
    retry_after: Option<i64>,
    field: Option<String>,
}

impl ApiError {
    pub fn new(code: ErrorCode) -> Self {
        Self {
            code,
            status: code.default_status(),
            message: None,
            request_id: None,
            retry_after: None,
            field: None,
        }
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    /// Override the generic message. Callers must keep it free of internal
    /// detail.
    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn retry_after(mut self, secs: i64) -> Self {
        self.retry_after = Some(secs.max(1));
        self
    }

    pub fn field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }

    fn status(mut self, status: StatusCode) -> Self {
        self.status = status;
        self
    }

    /// Map a core engine result to its envelope. Internals are logged with
    /// the request id and replaced by the generic message.
    pub fn from_core(error: CoreError, request_id: &str) -> Self {
        let mapped = match error {
            CoreError::Validation(message) => {
                ApiError::new(ErrorCode::ValidationError).message(message)
            }
            CoreError::SessionUnknown | CoreError::SessionRevoked { .. } => {
                ApiError::new(ErrorCode::SessionInvalid)
            }
            CoreError::TeamBoundary { .. } => ApiError::new(ErrorCode::TeamAccessDenied),
            CoreError::RoleDenied { .. } => ApiError::new(ErrorCode::RoleRequired),
            CoreError::IdempotencyConflict => ApiError::new(ErrorCode::IdempotencyConflict),
            CoreError::IdempotencyLocked => ApiError::new(ErrorCode::Conflict)
                .message("Request with this idempotency key is being processed, retry later")
                .retry_after(1),
            CoreError::AccountLocked { locked_until } => ApiError::new(ErrorCode::AccountLocked)
                .retry_after(locked_until - Utc::now().timestamp()),
            CoreError::NotFound(_) => ApiError::new(ErrorCode::NotFound),
            CoreError::WebhookSignature(_) | CoreError::WebhookPayload(_) => {
                ApiError::new(ErrorCode::ValidationError)
            }
            CoreError::CircuitOpen { ref circuit } => {
                tracing::warn!(request_id, circuit = %circuit, "request rejected: circuit open");
                ApiError::new(ErrorCode::InternalError)
                    .message("A downstream dependency is unavailable")
                    .status(StatusCode::SERVICE_UNAVAILABLE)
            }
            CoreError::Store(StoreError::QueryTimeout) => {
                tracing::error!(request_id, "store query timeout");
                ApiError::new(ErrorCode::InternalError)
                    .message("The service is temporarily degraded")
                    .status(StatusCode::SERVICE_UNAVAILABLE)
            }
            CoreError::Store(StoreError::Constraint(_)) => ApiError::new(ErrorCode::Conflict),
            CoreError::MaxRetriesExceeded { .. } | CoreError::Store(_) => {
                tracing::error!(request_id, error = %error, "internal error");
                ApiError::new(ErrorCode::InternalError)
            }
        };
        mapped.request_id(request_id)
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code.as_str())
    }
}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        self.status
    }

    fn error_response(&self) -> HttpResponse {
        let mut details = serde_json::Map::new();
        if let Some(retry_after) = self.retry_after {
            details.insert("retry_after".to_string(), retry_after.into());
        }
        if let Some(ref field) = self.field {
            details.insert("field".to_string(), field.as_str().into());
        }

        let mut body = serde_json::json!({
            "error": self.message.as_deref().unwrap_or(self.code.message()),
            "code": self.code.as_str(),
            "request_id": self.request_id,
        });
        if !details.is_empty() {
            body["details"] = serde_json::Value::Object(details);
        }

        let mut builder = HttpResponse::build(self.status);
        if let Some(ref request_id) = self.request_id {
            builder.insert_header(("X-Request-ID", request_id.as_str()));
        }
        if let Some(retry_after) = self.retry_after {
            builder.insert_header(("Retry-After", retry_after.to_string()));
        }
        builder.json(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_core_error_mapping() {
        let e = ApiError::from_core(CoreError::SessionUnknown, "req-1");
        assert_eq!(e.code(), ErrorCode::SessionInvalid);
        assert_eq!(e.status_code(), StatusCode::UNAUTHORIZED);

        let e = ApiError::from_core(CoreError::IdempotencyConflict, "req-1");
        assert_eq!(e.status_code(), StatusCode::CONFLICT);

        let e = ApiError::from_core(
            CoreError::CircuitOpen {
                circuit: "identity".to_string(),
            },
            "req-1",
        );
        assert_eq!(e.status_code(), StatusCode::SERVICE_UNAVAILABLE);

        let e = ApiError::from_core(CoreError::Store(StoreError::QueryTimeout), "req-1");
        assert_eq!(e.status_code(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn test_store_internals_do_not_leak() {
        let e = ApiError::from_core(
            CoreError::Store(StoreError::Other(
                "UNIQUE constraint failed: payments.idempotency_key".to_string(),
            )),
            "req-1",
        );
        let resp = e.error_response();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        // The body is rendered from the generic code message only.
        assert!(e.message.is_none());
    }

    #[test]
    fn test_retry_after_is_positive() {
        let e = ApiError::new(ErrorCode::RateLimited).retry_after(-5);
        assert_eq!(e.retry_after, Some(1));
    }
}
