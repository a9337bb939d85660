//! Account lockout after repeated authentication failures.
//!
//! Failures are tracked per user and per source IP. Crossing the threshold
//! locks the subject for a fixed window; a successful authentication resets
//! the counters. Lockout *checks* fail open on store errors so a store
//! outage cannot lock every legitimate user out.

use std::sync::Arc;

use chrono::Utc;
use rusqlite::{params, OptionalExtension, Transaction};

use crate::config::LockoutConfig;
use crate::error::{CoreError, StoreError};
use crate::store::{Store, TxOptions};

/// Lockout tracking and enforcement.
pub struct LockoutGuard {
    store: Arc<Store>,
    config: LockoutConfig,
}

impl LockoutGuard {
    pub fn new(store: Arc<Store>, config: LockoutConfig) -> Self {
        Self { store, config }
    }

    /// Whether the user or source IP is currently locked. Returns the
    /// unlock timestamp when locked; store failures fail open.
    pub fn check(&self, user_id: Option<&str>, ip_address: Option<&str>) -> Option<i64> {
        let now = Utc::now().timestamp();
        let result = self.store.with_conn(None, |conn| {
            conn.query_row(
                "SELECT locked_until FROM account_lockouts
                 WHERE ((user_id = ?1 AND ?1 IS NOT NULL) OR (ip_address = ?2 AND ?2 IS NOT NULL))
                   AND locked_until > ?3
                 LIMIT 1",
                params![user_id, ip_address, now],
                |row| row.get::<_, i64>(0),
            )
            .optional()
            .map_err(StoreError::from)
        });
        match result {
            Ok(locked_until) => locked_until,
            Err(e) => {
                tracing::error!(error = %e, "lockout check failed, failing open");
                None
            }
        }
    }

    /// Record one failed attempt for each provided subject. Returns the
    /// lock expiry if this attempt crossed the threshold.
    pub fn record_failure(
        &self,
        user_id: Option<&str>,
        ip_address: Option<&str>,
    ) -> Result<Option<i64>, CoreError> {
        let now = Utc::now().timestamp();
        let lock_until = now + self.config.lockout_duration_minutes * 60;
        let threshold = self.config.max_failed_attempts as i64;

        self.store
            .transaction(TxOptions::repeatable_read(), |tx| {
                let mut locked = None;
                if let Some(user) = user_id {
                    if Self::bump(tx, "user_id", user, now, threshold, lock_until)? {
                        locked = Some(lock_until);
                    }
                }
                if let Some(ip) = ip_address {
                    if Self::bump(tx, "ip_address", ip, now, threshold, lock_until)? {
                        locked = Some(lock_until);
                    }
                }
                if locked.is_some() {
                    tracing::warn!(user_id, ip = ip_address, "subject locked out");
                }
                Ok(locked)
            })
    }

    /// Increment the failure counter for one subject column. Returns true
    /// when the counter reached the threshold and the lock was set.
    fn bump(
        tx: &Transaction,
        column: &str,
        value: &str,
        now: i64,
        threshold: i64,
        lock_until: i64,
    ) -> Result<bool, CoreError> {
        // `column` is one of two compile-time names, never caller input.
        let other_clause = if column == "user_id" {
            "user_id = ?1"
        } else {
            "ip_address = ?1 AND user_id IS NULL"
        };

        let existing: Option<i64> = tx
            .query_row(
                &format!("SELECT failed_attempts FROM account_lockouts WHERE {other_clause}"),
                params![value],
                |row| row.get(0),
            )
            .optional()
            .map_err(StoreError::from)?;

        let attempts = existing.unwrap_or(0) + 1;
        let locked = attempts >= threshold;
        let locked_until = if locked { Some(lock_until) } else { None };

        if existing.is_some() {
            tx.execute(
                &format!(
                    "UPDATE account_lockouts
                     SET failed_attempts = ?2, last_attempt_at = ?3, locked_until = ?4
                     WHERE {other_clause}"
                ),
                params![value, attempts, now, locked_until],
            )
            .map_err(StoreError::from)?;
        } else {
            let (user, ip) = if column == "user_id" {
                (Some(value), None)
            } else {
                (None, Some(value))
            };
            tx.execute(
                "INSERT INTO account_lockouts (user_id, ip_address, failed_attempts, last_attempt_at, locked_until)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![user, ip, attempts, now, locked_until],
            )
            .map_err(StoreError::from)?;
        }
        Ok(locked)
    }

    /// Clear counters after a successful authentication.
    pub fn reset(&self, user_id: Option<&str>, ip_address: Option<&str>) -> Result<(), CoreError> {
        self.store.with_conn(None, |conn| {
            conn.execute(
                "UPDATE account_lockouts
                 SET failed_attempts = 0, locked_until = NULL
                 WHERE (user_id = ?1 AND ?1 IS NOT NULL) OR (ip_address = ?2 AND ?2 IS NOT NULL)",
                params![user_id, ip_address],
            )?;
            Ok(())
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guard() -> LockoutGuard {
        let store = Arc::new(Store::in_memory().unwrap());
        LockoutGuard::new(store, LockoutConfig::default())
    }

    #[test]
    fn test_locks_after_threshold() {
        let guard = guard();
        for _ in 0..4 {
            assert!(guard.record_failure(Some("u-1"), None).unwrap().is_none());
            assert!(guard.check(Some("u-1"), None).is_none());
        }
        let locked = guard.record_failure(Some("u-1"), None).unwrap();
        assert!(locked.is_some());
        assert_eq!(guard.check(Some("u-1"), None), locked);
    }

    #[test]
    fn test_ip_lockout_independent_of_user() {
        let guard = guard();
        for _ in 0..5 {
            guard.record_failure(None, Some("10.0.0.9")).unwrap();
        }
        assert!(guard.check(None, Some("10.0.0.9")).is_some());
        assert!(guard.check(Some("u-1"), None).is_none());
        // A request from the locked IP is blocked regardless of user.
        assert!(guard.check(Some("u-1"), Some("10.0.0.9")).is_some());
    }

    #[test]
    fn test_reset_clears_lock() {
        let guard = guard();
        for _ in 0..5 {
            guard.record_failure(Some("u-1"), None).unwrap();
        }
        assert!(guard.check(Some("u-1"), None).is_some());

        guard.reset(Some("u-1"), None).unwrap();
        assert!(guard.check(Some("u-1"), None).is_none());

        // Counter restarts from zero after reset.
        assert!(guard.record_failure(Some("u-1"), None).unwrap().is_none());
    }
}
