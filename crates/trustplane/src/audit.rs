//! Append-only, HMAC-signed audit log.
//!
//! Every persisted state change produces an audit entry; a failure to
//! append aborts the state change, so the entry is written inside the same
//! transaction as the operation it describes ([`AuditLog::append_with`]).
//! Standalone appends run in their own read-committed transaction.
//!
//! Each row carries `HMAC-SHA256(canonical_json(fields), audit_secret)`;
//! verification re-canonicalizes and compares in constant time, so mutation
//! of any recorded field is detectable per row.

use std::sync::Arc;

use chrono::Utc;
use rusqlite::{params, OptionalExtension, Transaction};
use serde_json::Value;

use crate::crypto::SigningKey;
use crate::error::{CoreError, StoreError};
use crate::store::{Store, TxOptions};

/// Audit event types, dotted notation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    AuthLoginSuccess,
    AuthLoginFailure,
    AuthLogout,
    AuthPasswordChange,
    AuthAccountLocked,
    AuthzAccessDenied,
    AuthzRoleChange,
    StateCreate,
    StateUpdate,
    StateDelete,
    ConfigUpdate,
    SecuritySessionRevoked,
    SecurityRateLimitHit,
    SecuritySuspicious,
    PaymentInitiated,
    PaymentCompleted,
    PaymentFailed,
    PaymentCancelled,
    PaymentRefunded,
    WebhookReceived,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::AuthLoginSuccess => "auth.login.success",
            EventType::AuthLoginFailure => "auth.login.failure",
            EventType::AuthLogout => "auth.logout",
            EventType::AuthPasswordChange => "auth.password.change",
            EventType::AuthAccountLocked => "auth.account.locked",
            EventType::AuthzAccessDenied => "authz.access.denied",
            EventType::AuthzRoleChange => "authz.role.change",
            EventType::StateCreate => "state.create",
            EventType::StateUpdate => "state.update",
            EventType::StateDelete => "state.delete",
            EventType::ConfigUpdate => "config.update",
            EventType::SecuritySessionRevoked => "security.session.revoked",
            EventType::SecurityRateLimitHit => "security.rate_limit.hit",
            EventType::SecuritySuspicious => "security.suspicious",
            EventType::PaymentInitiated => "payment.initiated",
            EventType::PaymentCompleted => "payment.completed",
            EventType::PaymentFailed => "payment.failed",
            EventType::PaymentCancelled => "payment.cancelled",
            EventType::PaymentRefunded => "payment.refunded",
            EventType::WebhookReceived => "webhook.received",
        }
    }
}

/// Who performed the action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActorType {
    User,
    System,
    Webhook,
    Admin,
    Anonymous,
}

impl ActorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActorType::User => "user",
            ActorType::System => "system",
            ActorType::Webhook => "webhook",
            ActorType::Admin => "admin",
            ActorType::Anonymous => "anonymous",
        }
    }
}

/// A stored audit entry.
#[derive(Debug, Clone, serde::Serialize)]
pub struct AuditEntry {
    pub id: i64,
    pub event_type: String,
    pub actor_id: Option<String>,
    pub actor_type: String,
    pub resource_type: Option<String>,
    pub resource_id: Option<String>,
    pub action: String,
    pub details: Option<Value>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub request_id: Option<String>,
    pub created_at: i64,
    pub hmac_signature: String,
}

/// An event to append.
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub event_type: EventType,
    pub actor_id: Option<String>,
    pub actor_type: ActorType,
    pub resource_type: Option<String>,
    pub resource_id: Option<String>,
    pub action: String,
    pub details: Option<Value>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub request_id: Option<String>,
}

impl NewEvent {
    pub fn new(event_type: EventType, action: impl Into<String>) -> Self {
        Self {
            event_type,
            actor_id: None,
            actor_type: ActorType::System,
            resource_type: None,
            resource_id: None,
            action: action.into(),
            details: None,
            ip_address: None,
            user_agent: None,
            request_id: None,
        }
    }

    pub fn actor(mut self, actor_type: ActorType, actor_id: Option<impl Into<String>>) -> Self {
        self.actor_type = actor_type;
        self.actor_id = actor_id.map(Into::into);
        self
    }

    pub fn resource(mut self, resource_type: impl Into<String>, resource_id: impl Into<String>) -> Self {
        self.resource_type = Some(resource_type.into());
        self.resource_id = Some(resource_id.into());
        self
    }

    pub fn details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn client(mut self, ip: Option<impl Into<String>>, ua: Option<impl Into<String>>) -> Self {
        self.ip_address = ip.map(Into::into);
        self.user_agent = ua.map(Into::into);
        self
    }

    pub fn request(mut self, request_id: Option<impl Into<String>>) -> Self {
        self.request_id = request_id.map(Into::into);
        self
    }
}

/// The audit log writer and verifier.
pub struct AuditLog {
    store: Arc<Store>,
    key: SigningKey,
    hot_retention_days: i64,
}

impl AuditLog {
    pub fn new(store: Arc<Store>, secret: Vec<u8>, hot_retention_days: i64) -> Self {
        Self {
            store,
            key: SigningKey::new(secret),
            hot_retention_days,
        }
    }

    /// The signed fields of an entry as one JSON value: absent values as
    /// explicit nulls, timestamps as integers. Canonicalization happens in
    /// the signing key.
    #[allow(clippy::too_many_arguments)]
    fn signed_fields(
        event_type: &str,
        actor_id: Option<&str>,
        actor_type: &str,
        resource_type: Option<&str>,
        resource_id: Option<&str>,
        action: &str,
        details: Option<&Value>,
        created_at: i64,
    ) -> Value {
        serde_json::json!({
            "event_type": event_type,
            "actor_id": actor_id,
            "actor_type": actor_type,
            "resource_type": resource_type,
            "resource_id": resource_id,
            "action": action,
            "details": details,
            "created_at": created_at,
        })
    }

    /// Append an event inside the caller's transaction. An error here makes
    /// the caller's transaction roll back, taking the state change with it.
    pub fn append_with(&self, tx: &Transaction, event: &NewEvent) -> Result<i64, StoreError> {
        let created_at = Utc::now().timestamp();
        let fields = Self::signed_fields(
            event.event_type.as_str(),
            event.actor_id.as_deref(),
            event.actor_type.as_str(),
            event.resource_type.as_deref(),
            event.resource_id.as_deref(),
            &event.action,
            event.details.as_ref(),
            created_at,
        );
        let signature = self.key.sign_value(&fields);

        tx.execute(
            "INSERT INTO audit_logs (
                event_type, actor_id, actor_type, resource_type, resource_id,
                action, details, ip_address, user_agent, request_id, created_at, hmac_signature
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                event.event_type.as_str(),
                event.actor_id,
                event.actor_type.as_str(),
                event.resource_type,
                event.resource_id,
                event.action,
                event.details.as_ref().map(|d| d.to_string()),
                event.ip_address,
                event.user_agent,
                event.request_id,
                created_at,
                signature,
            ],
        )?;
        Ok(tx.last_insert_rowid())
    }

    /// Append an event in its own read-committed transaction.
    pub fn append(&self, event: &NewEvent) -> Result<i64, CoreError> {
        let result = self
            .store
            .transaction(TxOptions::read_committed(), |tx| {
                self.append_with(tx, event).map_err(CoreError::from)
            });
        if let Err(ref e) = result {
            tracing::error!(event_type = event.event_type.as_str(), error = %e, "audit append failed");
        }
        result
    }

    fn entry_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AuditEntry> {
        let details: Option<String> = row.get(7)?;
        Ok(AuditEntry {
            id: row.get(0)?,
            event_type: row.get(1)?,
            actor_id: row.get(2)?,
            actor_type: row.get(3)?,
            resource_type: row.get(4)?,
            resource_id: row.get(5)?,
            action: row.get(6)?,
            details: details.and_then(|d| serde_json::from_str(&d).ok()),
            ip_address: row.get(8)?,
            user_agent: row.get(9)?,
            request_id: row.get(10)?,
            created_at: row.get(11)?,
            hmac_signature: row.get(12)?,
        })
    }

    const SELECT_COLUMNS: &'static str = "id, event_type, actor_id, actor_type, resource_type, \
         resource_id, action, details, ip_address, user_agent, request_id, created_at, hmac_signature";

    pub fn get(&self, id: i64) -> Result<Option<AuditEntry>, StoreError> {
        self.store.with_conn(None, |conn| {
            conn.query_row(
                &format!(
                    "SELECT {} FROM audit_logs WHERE id = ?1",
                    Self::SELECT_COLUMNS
                ),
                params![id],
                Self::entry_from_row,
            )
            .optional()
            .map_err(StoreError::from)
        })
    }

    /// Entries matching an event type and optionally a resource id, newest
    /// first. Used by operators and the scenario tests.
    pub fn find(
        &self,
        event_type: EventType,
        resource_id: Option<&str>,
        limit: u32,
    ) -> Result<Vec<AuditEntry>, StoreError> {
        self.store.with_conn(None, |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM audit_logs
                 WHERE event_type = ?1 AND (?2 IS NULL OR resource_id = ?2)
                 ORDER BY id DESC LIMIT ?3",
                Self::SELECT_COLUMNS
            ))?;
            let entries = stmt
                .query_map(
                    params![event_type.as_str(), resource_id, limit],
                    Self::entry_from_row,
                )?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(entries)
        })
    }

    /// Verify a stored entry's HMAC. Returns `false` for a missing entry.
    pub fn verify(&self, id: i64) -> Result<bool, StoreError> {
        let Some(entry) = self.get(id)? else {
            return Ok(false);
        };
        Ok(self.verify_entry(&entry))
    }

    /// Re-canonicalize an entry and compare its signature in constant time.
    pub fn verify_entry(&self, entry: &AuditEntry) -> bool {
        let fields = Self::signed_fields(
            &entry.event_type,
            entry.actor_id.as_deref(),
            &entry.actor_type,
            entry.resource_type.as_deref(),
            entry.resource_id.as_deref(),
            &entry.action,
            entry.details.as_ref(),
            entry.created_at,
        );
        self.key.verify_value(&fields, &entry.hmac_signature)
    }

    /// Delete entries older than the hot retention window. The cold archive
    /// is an external collaborator; this only maintains the online table.
    pub fn purge_expired(&self) -> Result<usize, CoreError> {
        let cutoff = Utc::now().timestamp() - self.hot_retention_days * 24 * 3600;
        let deleted = self.store.transaction(TxOptions::read_committed(), |tx| {
            tx.execute("DELETE FROM audit_logs WHERE created_at < ?1", params![cutoff])
                .map_err(|e| CoreError::from(StoreError::from(e)))
        })?;
        if deleted > 0 {
            tracing::info!(deleted, "audit entries past hot retention purged");
        }
        Ok(deleted)
    }
}
