//! Exactly-once execution for state-changing requests.
//!
//! Driven by a client-supplied key, scoped per user. The three-step
//! protocol: **check** (classify an existing record), **acquire** (one
//! atomic insert-or-update that creates a PENDING row, revives a FAILED row
//! of matching hash, or rejects a conflicting hash), **finalize** (write
//! COMPLETED with the cached response in the same transaction as the
//! handler's state change, or FAILED in its own transaction after
//! rollback). A key replayed with a different request hash is a conflict,
//! never a silent re-execution.

use std::sync::Arc;

use chrono::Utc;
use rusqlite::{params, OptionalExtension, Transaction};
use serde_json::Value;

use crate::crypto::request_hash;
use crate::error::{CoreError, StoreError};
use crate::store::{with_retry, Store, TxOptions};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdempotencyStatus {
    /// Locked, processing in progress.
    Pending,
    /// Done; the cached response is returned to replays.
    Completed,
    /// Processing failed; a matching retry may re-acquire.
    Failed,
}

impl IdempotencyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IdempotencyStatus::Pending => "pending",
            IdempotencyStatus::Completed => "completed",
            IdempotencyStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(IdempotencyStatus::Pending),
            "completed" => Some(IdempotencyStatus::Completed),
            "failed" => Some(IdempotencyStatus::Failed),
            _ => None,
        }
    }
}

/// A stored idempotency record.
#[derive(Debug, Clone)]
pub struct IdempotencyRecord {
    pub id: String,
    pub key: String,
    pub user_id: String,
    pub request_hash: String,
    pub status: IdempotencyStatus,
    pub response: Option<Value>,
    pub created_at: i64,
    pub expires_at: i64,
    pub locked_at: Option<i64>,
}

/// Outcome of the pre-execution check.
#[derive(Debug, Clone)]
pub enum Precheck {
    /// No usable record; the caller should acquire and process.
    Proceed,
    /// Completed with a matching hash; do not re-execute.
    Cached(Value),
}

enum Acquire {
    Acquired,
    /// A concurrent request completed between check and acquire.
    AlreadyCompleted(Value),
}

enum RunOutcome {
    Fresh(Value),
    Cached(Value),
}

/// The idempotency engine.
pub struct IdempotencyEngine {
    store: Arc<Store>,
    ttl_hours: i64,
}

impl IdempotencyEngine {
    pub fn new(store: Arc<Store>, ttl_hours: i64) -> Self {
        Self { store, ttl_hours }
    }

    fn record_stmt(
        conn: &rusqlite::Connection,
        key: &str,
        user_id: &str,
        now: i64,
    ) -> Result<Option<IdempotencyRecord>, StoreError> {
        let row = conn
            .query_row(
                "SELECT id, key, user_id, request_hash, status, response, created_at, expires_at, locked_at
                 FROM idempotency_keys
                 WHERE key = ?1 AND user_id = ?2 AND expires_at > ?3",
                params![key, user_id, now],
                |row| {
                    let status: String = row.get(4)?;
                    let response: Option<String> = row.get(5)?;
                    Ok(IdempotencyRecord {
                        id: row.get(0)?,
                        key: row.get(1)?,
                        user_id: row.get(2)?,
                        request_hash: row.get(3)?,
                        status: IdempotencyStatus::parse(&status)
                            .unwrap_or(IdempotencyStatus::Pending),
                        response: response.and_then(|r| serde_json::from_str(&r).ok()),
                        created_at: row.get(6)?,
                        expires_at: row.get(7)?,
                        locked_at: row.get(8)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    /// Fetch the live record for `(user, key)`, if any.
    pub fn get(&self, key: &str, user_id: &str) -> Result<Option<IdempotencyRecord>, CoreError> {
        let now = Utc::now().timestamp();
        let record = self
            .store
            .with_conn(None, |conn| Self::record_stmt(conn, key, user_id, now))?;
        Ok(record)
    }

    /// Step 1: classify the existing record for this `(user, key, body)`.
    pub fn check(&self, key: &str, user_id: &str, body: &[u8]) -> Result<Precheck, CoreError> {
        let hash = request_hash(body);
        let Some(record) = self.get(key, user_id)? else {
            return Ok(Precheck::Proceed);
        };

        if record.request_hash != hash {
            // Same key, different payload: replay attack or buggy client.
            tracing::warn!(key, user_id, "idempotency conflict: hash mismatch");
            return Err(CoreError::IdempotencyConflict);
        }

        match record.status {
            IdempotencyStatus::Completed => {
                tracing::info!(key, "returning cached idempotent response");
                Ok(Precheck::Cached(record.response.unwrap_or(Value::Null)))
            }
            IdempotencyStatus::Pending => {
                tracing::warn!(key, "idempotency key locked");
                Err(CoreError::IdempotencyLocked)
            }
            IdempotencyStatus::Failed => Ok(Precheck::Proceed),
        }
    }

    /// Step 2: atomically create the PENDING row or revive a FAILED row of
    /// matching hash, inside the caller's transaction. Re-checks for
    /// conflicts that raced in since the check.
    fn acquire_in(
        &self,
        tx: &Transaction,
        key: &str,
        user_id: &str,
        hash: &str,
    ) -> Result<Acquire, CoreError> {
        let now = Utc::now().timestamp();
        let expires_at = now + self.ttl_hours * 3600;
        let id = uuid::Uuid::new_v4().to_string();

        // An expired row no longer owns the key.
        tx.execute(
            "DELETE FROM idempotency_keys WHERE key = ?1 AND user_id = ?2 AND expires_at <= ?3",
            params![key, user_id, now],
        )
        .map_err(StoreError::from)?;

        let changed = tx
            .execute(
                "INSERT INTO idempotency_keys (id, key, user_id, request_hash, status, created_at, expires_at, locked_at)
                 VALUES (?1, ?2, ?3, ?4, 'pending', ?5, ?6, ?5)
                 ON CONFLICT (user_id, key) DO UPDATE SET
                     status = 'pending',
                     locked_at = excluded.locked_at
                 WHERE idempotency_keys.request_hash = excluded.request_hash
                   AND idempotency_keys.status = 'failed'",
                params![id, key, user_id, hash, now, expires_at],
            )
            .map_err(StoreError::from)?;

        if changed > 0 {
            tracing::info!(key, "idempotency lock acquired");
            return Ok(Acquire::Acquired);
        }

        // The upsert matched a conflicting row; classify it.
        let Some(record) = Self::record_stmt(tx, key, user_id, now).map_err(CoreError::from)?
        else {
            return Err(CoreError::IdempotencyLocked);
        };
        if record.request_hash != hash {
            return Err(CoreError::IdempotencyConflict);
        }
        match record.status {
            IdempotencyStatus::Completed => Ok(Acquire::AlreadyCompleted(
                record.response.unwrap_or(Value::Null),
            )),
            _ => Err(CoreError::IdempotencyLocked),
        }
    }

    /// Step 3a: record success and the response to replay, inside the same
    /// transaction as the handler's state change.
    fn complete_in(
        &self,
        tx: &Transaction,
        key: &str,
        user_id: &str,
        response: &Value,
    ) -> Result<(), StoreError> {
        tx.execute(
            "UPDATE idempotency_keys
             SET status = 'completed', response = ?1, locked_at = NULL
             WHERE key = ?2 AND user_id = ?3",
            params![response.to_string(), key, user_id],
        )?;
        Ok(())
    }

    /// Step 3b: record failure so a matching retry may run again. The
    /// handler's transaction has already rolled back (taking the PENDING
    /// row with it), so this upserts in its own transaction. Best-effort —
    /// a failure to record a failure must not mask the original error.
    fn fail(&self, key: &str, user_id: &str, hash: &str, error: &str) {
        let now = Utc::now().timestamp();
        let expires_at = now + self.ttl_hours * 3600;
        let id = uuid::Uuid::new_v4().to_string();
        let response = serde_json::json!({ "error": error }).to_string();

        let result = self.store.with_conn(None, |conn| {
            conn.execute(
                "INSERT INTO idempotency_keys (id, key, user_id, request_hash, status, response, created_at, expires_at)
                 VALUES (?1, ?2, ?3, ?4, 'failed', ?5, ?6, ?7)
                 ON CONFLICT (user_id, key) DO UPDATE SET
                     status = 'failed',
                     response = excluded.response,
                     locked_at = NULL",
                params![id, key, user_id, hash, response, now, expires_at],
            )?;
            Ok(())
        });
        match result {
            Ok(()) => tracing::info!(key, "idempotency marked failed"),
            Err(e) => tracing::error!(key, error = %e, "failed to mark idempotency failed"),
        }
    }

    /// Run `handler` with exactly-once semantics for `(user, key)`.
    ///
    /// The acquire, the handler's writes and the COMPLETED finalization
    /// share one serializable transaction: either all persist or none do.
    /// Serialization conflicts retry the whole sequence.
    pub fn run_idempotent(
        &self,
        key: &str,
        user_id: &str,
        body: &[u8],
        handler: impl Fn(&Transaction) -> Result<Value, CoreError>,
    ) -> Result<Value, CoreError> {
        if key.is_empty() || key.len() > 64 {
            return Err(CoreError::Validation(
                "idempotency key must be 1-64 characters".to_string(),
            ));
        }

        match self.check(key, user_id, body)? {
            Precheck::Cached(response) => return Ok(response),
            Precheck::Proceed => {}
        }

        let hash = request_hash(body);
        let outcome = with_retry(|| {
            self.store
                .transaction(TxOptions::serializable(), |tx| {
                    match self.acquire_in(tx, key, user_id, &hash)? {
                        Acquire::AlreadyCompleted(response) => Ok(RunOutcome::Cached(response)),
                        Acquire::Acquired => {
                            let response = handler(tx)?;
                            self.complete_in(tx, key, user_id, &response)?;
                            Ok(RunOutcome::Fresh(response))
                        }
                    }
                })
        });

        match outcome {
            Ok(RunOutcome::Fresh(response)) | Ok(RunOutcome::Cached(response)) => Ok(response),
            Err(e) => {
                // Conflict and locked outcomes leave the owning record
                // untouched; real handler failures are recorded as FAILED.
                if !matches!(
                    e,
                    CoreError::IdempotencyConflict | CoreError::IdempotencyLocked
                ) {
                    self.fail(key, user_id, &hash, &e.to_string());
                }
                Err(e)
            }
        }
    }

    /// Periodic cleanup: delete expired records in bounded batches.
    pub fn cleanup_expired(&self, batch_size: u32) -> Result<usize, CoreError> {
        let now = Utc::now().timestamp();
        let count = self.store.with_conn(None, |conn| {
            let n = conn.execute(
                "DELETE FROM idempotency_keys WHERE id IN (
                     SELECT id FROM idempotency_keys WHERE expires_at < ?1 LIMIT ?2
                 )",
                params![now, batch_size],
            )?;
            Ok(n)
        })?;
        if count > 0 {
            tracing::info!(count, "expired idempotency keys cleaned up");
        }
        Ok(count)
    }
}
