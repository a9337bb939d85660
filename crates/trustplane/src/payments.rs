//! Payment state machine with atomic, audited transitions.
//!
//! Pending → Completed/Failed/Cancelled, and Completed → Refunded. Every
//! transition is a conditional update on the expected source status; zero
//! rows updated means the precondition failed and the caller is told the
//! transition was not taken. Amount and currency are immutable after
//! creation and always stored in integer minor units. All payment work runs
//! under serializable isolation with the short payment timeout, and every
//! transition writes its audit event in the same transaction.

use std::sync::Arc;

use chrono::Utc;
use rusqlite::{params, OptionalExtension, Transaction};

use crate::audit::{ActorType, AuditLog, EventType, NewEvent};
use crate::crypto::generate_idempotency_key;
use crate::error::{CoreError, StoreError};
use crate::store::{with_retry, Store, TxOptions};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentStatus {
    Pending,
    Completed,
    Failed,
    Cancelled,
    Refunded,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Completed => "completed",
            PaymentStatus::Failed => "failed",
            PaymentStatus::Cancelled => "cancelled",
            PaymentStatus::Refunded => "refunded",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(PaymentStatus::Pending),
            "completed" => Some(PaymentStatus::Completed),
            "failed" => Some(PaymentStatus::Failed),
            "cancelled" => Some(PaymentStatus::Cancelled),
            "refunded" => Some(PaymentStatus::Refunded),
            _ => None,
        }
    }
}

impl serde::Serialize for PaymentStatus {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// A payment row.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Payment {
    pub id: String,
    pub team_id: String,
    pub user_id: String,
    pub amount_cents: i64,
    pub currency: String,
    pub status: PaymentStatus,
    pub external_intent_id: Option<String>,
    pub external_charge_id: Option<String>,
    pub idempotency_key: String,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub created_at: i64,
    pub completed_at: Option<i64>,
    pub failed_at: Option<i64>,
}

/// A payment to create.
#[derive(Debug, Clone)]
pub struct NewPayment {
    pub team_id: String,
    pub user_id: String,
    pub amount_cents: i64,
    pub currency: String,
    /// Generated when the client does not supply one.
    pub idempotency_key: Option<String>,
}

const PAYMENT_COLUMNS: &str = "id, team_id, user_id, amount_cents, currency, status, \
     external_intent_id, external_charge_id, idempotency_key, error_code, error_message, \
     created_at, completed_at, failed_at";

fn payment_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Payment> {
    let status: String = row.get(5)?;
    Ok(Payment {
        id: row.get(0)?,
        team_id: row.get(1)?,
        user_id: row.get(2)?,
        amount_cents: row.get(3)?,
        currency: row.get(4)?,
        status: PaymentStatus::parse(&status).unwrap_or(PaymentStatus::Pending),
        external_intent_id: row.get(6)?,
        external_charge_id: row.get(7)?,
        idempotency_key: row.get(8)?,
        error_code: row.get(9)?,
        error_message: row.get(10)?,
        created_at: row.get(11)?,
        completed_at: row.get(12)?,
        failed_at: row.get(13)?,
    })
}

/// The payment engine.
pub struct PaymentEngine {
    store: Arc<Store>,
    audit: Arc<AuditLog>,
}

impl PaymentEngine {
    pub fn new(store: Arc<Store>, audit: Arc<AuditLog>) -> Self {
        Self { store, audit }
    }

    fn validate(new: &NewPayment) -> Result<(), CoreError> {
        if new.amount_cents <= 0 {
            return Err(CoreError::Validation(
                "amount_cents must be positive".to_string(),
            ));
        }
        if new.currency.len() != 3 || !new.currency.chars().all(|c| c.is_ascii_uppercase()) {
            return Err(CoreError::Validation(
                "currency must be a 3-letter uppercase code".to_string(),
            ));
        }
        Ok(())
    }

    /// Insert a pending payment and its `payment.initiated` audit event
    /// inside the caller's transaction. Used directly when the caller is
    /// already running under the idempotency engine.
    pub fn create_in(
        &self,
        tx: &Transaction,
        new: &NewPayment,
        request_id: Option<&str>,
    ) -> Result<Payment, CoreError> {
        Self::validate(new)?;

        let id = uuid::Uuid::new_v4().to_string();
        let key = new
            .idempotency_key
            .clone()
            .unwrap_or_else(generate_idempotency_key);
        let now = Utc::now().timestamp();

        tx.execute(
            "INSERT INTO payments (id, team_id, user_id, amount_cents, currency, status, idempotency_key, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 'pending', ?6, ?7)",
            params![id, new.team_id, new.user_id, new.amount_cents, new.currency, key, now],
        )
        .map_err(StoreError::from)?;

        self.audit.append_with(
            tx,
            &NewEvent::new(EventType::PaymentInitiated, "Payment created")
                .actor(ActorType::User, Some(new.user_id.as_str()))
                .resource("payment", id.as_str())
                .details(serde_json::json!({
                    "amount_cents": new.amount_cents,
                    "currency": new.currency,
                }))
                .request(request_id),
        )?;

        Ok(Payment {
            id,
            team_id: new.team_id.clone(),
            user_id: new.user_id.clone(),
            amount_cents: new.amount_cents,
            currency: new.currency.clone(),
            status: PaymentStatus::Pending,
            external_intent_id: None,
            external_charge_id: None,
            idempotency_key: key,
            error_code: None,
            error_message: None,
            created_at: now,
            completed_at: None,
            failed_at: None,
        })
    }

    /// Create a pending payment under serializable isolation with retry.
    ///
    /// Replaying the same idempotency key with an equal body returns the
    /// existing payment; a differing body is a conflict.
    pub fn create(&self, new: &NewPayment, request_id: Option<&str>) -> Result<Payment, CoreError> {
        Self::validate(new)?;

        let result = with_retry(|| {
            self.store
                .transaction(TxOptions::payment(self.store.config()), |tx| {
                    self.create_in(tx, new, request_id)
                })
        });

        match result {
            Err(CoreError::Store(StoreError::Constraint(_))) => {
                let Some(key) = new.idempotency_key.as_deref() else {
                    return Err(CoreError::IdempotencyConflict);
                };
                let Some(existing) = self.get_by_idempotency_key(key)? else {
                    return Err(CoreError::IdempotencyConflict);
                };
                if existing.team_id == new.team_id
                    && existing.amount_cents == new.amount_cents
                    && existing.currency == new.currency
                {
                    Ok(existing)
                } else {
                    Err(CoreError::IdempotencyConflict)
                }
            }
            other => other,
        }
    }

    /// One conditional transition plus its audit event, in one serializable
    /// transaction. Returns whether the transition was taken.
    fn transition(
        &self,
        payment_id: &str,
        sql: &str,
        sql_params: &[&dyn rusqlite::ToSql],
        event: NewEvent,
    ) -> Result<bool, CoreError> {
        with_retry(|| {
            self.store
                .transaction(TxOptions::payment(self.store.config()), |tx| {
                    let n = tx.execute(sql, sql_params).map_err(StoreError::from)?;
                    if n == 0 {
                        tracing::warn!(payment_id, "payment transition precondition failed");
                        return Ok(false);
                    }
                    self.audit.append_with(tx, &event)?;
                    Ok(true)
                })
        })
    }

    /// Pending → Completed, recording the external references.
    pub fn complete(
        &self,
        payment_id: &str,
        external_intent_id: &str,
        external_charge_id: Option<&str>,
    ) -> Result<bool, CoreError> {
        let now = Utc::now().timestamp();
        self.transition(
            payment_id,
            "UPDATE payments
             SET status = 'completed', external_intent_id = ?1, external_charge_id = ?2, completed_at = ?3
             WHERE id = ?4 AND status = 'pending'",
            &[&external_intent_id, &external_charge_id, &now, &payment_id],
            NewEvent::new(EventType::PaymentCompleted, "Payment completed")
                .resource("payment", payment_id)
                .details(serde_json::json!({ "external_intent_id": external_intent_id })),
        )
    }

    /// Pending → Failed with the gateway's error classification.
    pub fn fail(
        &self,
        payment_id: &str,
        error_code: &str,
        error_message: &str,
    ) -> Result<bool, CoreError> {
        let now = Utc::now().timestamp();
        self.transition(
            payment_id,
            "UPDATE payments
             SET status = 'failed', error_code = ?1, error_message = ?2, failed_at = ?3
             WHERE id = ?4 AND status = 'pending'",
            &[&error_code, &error_message, &now, &payment_id],
            NewEvent::new(EventType::PaymentFailed, "Payment failed")
                .resource("payment", payment_id)
                .details(serde_json::json!({ "error_code": error_code })),
        )
    }

    /// Pending → Cancelled.
    pub fn cancel(&self, payment_id: &str, actor_id: &str) -> Result<bool, CoreError> {
        self.transition(
            payment_id,
            "UPDATE payments SET status = 'cancelled' WHERE id = ?1 AND status = 'pending'",
            &[&payment_id],
            NewEvent::new(EventType::PaymentCancelled, "Payment cancelled")
                .actor(ActorType::User, Some(actor_id))
                .resource("payment", payment_id),
        )
    }

    /// Completed → Refunded. The only transition out of a terminal success.
    pub fn refund(&self, payment_id: &str, actor_id: &str) -> Result<bool, CoreError> {
        self.transition(
            payment_id,
            "UPDATE payments SET status = 'refunded' WHERE id = ?1 AND status = 'completed'",
            &[&payment_id],
            NewEvent::new(EventType::PaymentRefunded, "Payment refunded")
                .actor(ActorType::User, Some(actor_id))
                .resource("payment", payment_id),
        )
    }

    pub fn get(&self, payment_id: &str) -> Result<Option<Payment>, CoreError> {
        let payment = self.store.with_conn(None, |conn| {
            conn.query_row(
                &format!("SELECT {PAYMENT_COLUMNS} FROM payments WHERE id = ?1"),
                params![payment_id],
                payment_from_row,
            )
            .optional()
            .map_err(StoreError::from)
        })?;
        Ok(payment)
    }

    pub fn get_by_idempotency_key(&self, key: &str) -> Result<Option<Payment>, CoreError> {
        let payment = self.store.with_conn(None, |conn| {
            conn.query_row(
                &format!("SELECT {PAYMENT_COLUMNS} FROM payments WHERE idempotency_key = ?1"),
                params![key],
                payment_from_row,
            )
            .optional()
            .map_err(StoreError::from)
        })?;
        Ok(payment)
    }

    /// A team's payments, newest first. `limit` is clamped to 1..=100.
    pub fn list_team(
        &self,
        team_id: &str,
        offset: u32,
        limit: u32,
    ) -> Result<Vec<Payment>, CoreError> {
        let limit = limit.clamp(1, 100);
        let payments = self.store.with_conn(None, |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {PAYMENT_COLUMNS} FROM payments
                 WHERE team_id = ?1
                 ORDER BY created_at DESC, id DESC
                 LIMIT ?2 OFFSET ?3"
            ))?;
            let rows = stmt
                .query_map(params![team_id, limit, offset], payment_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })?;
        Ok(payments)
    }

    /// Find a payment by the gateway's intent reference. Used by webhook
    /// handlers that only know the external id.
    pub fn get_by_external_intent(&self, intent_id: &str) -> Result<Option<Payment>, CoreError> {
        let payment = self.store.with_conn(None, |conn| {
            conn.query_row(
                &format!("SELECT {PAYMENT_COLUMNS} FROM payments WHERE external_intent_id = ?1"),
                params![intent_id],
                payment_from_row,
            )
            .optional()
            .map_err(StoreError::from)
        })?;
        Ok(payment)
    }
}
