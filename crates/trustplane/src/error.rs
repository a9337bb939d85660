//! Error taxonomy for the core engines.
//!
//! [`StoreError`] mirrors what the persistent store can signal; serialization
//! conflicts stay distinguishable so [`crate::store::with_retry`] can act on
//! them. [`CoreError`] is the tagged result surface the HTTP layer maps to
//! response codes — authorization denials, idempotency outcomes and circuit
//! state are variants, not panics.

use thiserror::Error;

use crate::authz::Role;

/// Errors surfaced by the persistent store client.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The statement exceeded its timeout and was cancelled.
    #[error("query timeout")]
    QueryTimeout,

    /// Concurrency conflict under strict isolation. Retriable.
    #[error("serialization conflict")]
    Serialization,

    /// Pool exhaustion or failure to open/acquire a connection.
    #[error("connection error: {0}")]
    Connection(String),

    /// Unique-constraint violation.
    #[error("constraint violation: {0}")]
    Constraint(String),

    /// Anything else the store reports.
    #[error("store error: {0}")]
    Other(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        if let rusqlite::Error::SqliteFailure(ref err, ref msg) = e {
            match err.code {
                // Lock contention is the store's serialization signal; it
                // must propagate so the retry helper can re-run the body.
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked => {
                    return StoreError::Serialization;
                }
                rusqlite::ErrorCode::ConstraintViolation => {
                    return StoreError::Constraint(
                        msg.clone().unwrap_or_else(|| "constraint".to_string()),
                    );
                }
                rusqlite::ErrorCode::OperationInterrupted => return StoreError::QueryTimeout,
                rusqlite::ErrorCode::CannotOpen | rusqlite::ErrorCode::NotADatabase => {
                    return StoreError::Connection(e.to_string());
                }
                _ => {}
            }
        }
        StoreError::Other(e.to_string())
    }
}

impl StoreError {
    /// Whether a retry of the whole transaction may succeed.
    pub fn is_retriable(&self) -> bool {
        matches!(self, StoreError::Serialization)
    }
}

/// Tagged results from the core engines.
///
/// The HTTP layer maps each variant to an error-envelope code; only truly
/// unexpected conditions surface as [`CoreError::Store`] internals.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Request data failed validation before touching any engine.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Bearer token does not map to a tracked session.
    #[error("session not found")]
    SessionUnknown,

    /// Session exists but has been revoked.
    #[error("session revoked")]
    SessionRevoked { reason: Option<String> },

    /// Caller has no active membership in the target team.
    #[error("user {user_id} is not a member of team {team_id}")]
    TeamBoundary { user_id: String, team_id: String },

    /// Caller's role weight is below the operation's requirement.
    #[error("operation requires role {required:?}")]
    RoleDenied { required: Role },

    /// Idempotency key replayed with a different request hash.
    #[error("idempotency key reused with different payload")]
    IdempotencyConflict,

    /// Idempotency key is held by an in-flight request.
    #[error("idempotency key is being processed")]
    IdempotencyLocked,

    /// Serialization retries exhausted.
    #[error("transaction failed after {attempts} attempts")]
    MaxRetriesExceeded { attempts: u32 },

    /// A circuit breaker is rejecting calls to a dependency.
    #[error("circuit {circuit} is open")]
    CircuitOpen { circuit: String },

    /// Account temporarily locked after repeated auth failures.
    #[error("account locked")]
    AccountLocked { locked_until: i64 },

    /// Webhook signature header missing, malformed, stale or mismatched.
    #[error("webhook signature rejected: {0}")]
    WebhookSignature(String),

    /// Webhook body is not the JSON shape the processor requires.
    #[error("webhook payload rejected: {0}")]
    WebhookPayload(String),

    /// Requested record does not exist.
    #[error("{0} not found")]
    NotFound(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn busy_maps_to_serialization() {
        let e = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        );
        let mapped = StoreError::from(e);
        assert!(matches!(mapped, StoreError::Serialization));
        assert!(mapped.is_retriable());
    }

    #[test]
    fn constraint_maps_to_constraint() {
        let e = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CONSTRAINT),
            Some("UNIQUE constraint failed: payments.idempotency_key".to_string()),
        );
        assert!(matches!(StoreError::from(e), StoreError::Constraint(_)));
    }

    #[test]
    fn query_timeout_is_not_retriable() {
        assert!(!StoreError::QueryTimeout.is_retriable());
    }
}
