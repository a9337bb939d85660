//! Session store and per-request validator.
//!
//! Sessions are keyed by the SHA-256 of the bearer token, so the raw token
//! is never persisted. Validation runs on every authenticated request:
//! token validity does not imply session validity, and a revoked session
//! never authorizes anything. All revocations are idempotent — `revoked_at`
//! is set only while it is still null and is immutable afterwards.

use std::sync::Arc;

use chrono::Utc;
use rusqlite::{params, OptionalExtension, Transaction};

use crate::audit::{ActorType, AuditLog, EventType, NewEvent};
use crate::crypto::token_hash;
use crate::error::{CoreError, StoreError};
use crate::store::Store;

/// Why a session was invalidated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevocationReason {
    PasswordChange,
    RoleChange,
    TeamChange,
    ManualLogout,
    AccountLock,
    SecurityIncident,
    TokenRefresh,
    AdminAction,
    SessionExpired,
}

impl RevocationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RevocationReason::PasswordChange => "password_change",
            RevocationReason::RoleChange => "role_change",
            RevocationReason::TeamChange => "team_change",
            RevocationReason::ManualLogout => "manual_logout",
            RevocationReason::AccountLock => "account_lock",
            RevocationReason::SecurityIncident => "security_incident",
            RevocationReason::TokenRefresh => "token_refresh",
            RevocationReason::AdminAction => "admin_action",
            RevocationReason::SessionExpired => "session_expired",
        }
    }
}

/// A tracked session.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Session {
    pub id: String,
    pub user_id: String,
    #[serde(skip_serializing)]
    pub token_hash: String,
    pub team_id: Option<String>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub created_at: i64,
    pub last_used_at: i64,
    pub revoked_at: Option<i64>,
    pub revocation_reason: Option<String>,
}

impl Session {
    /// A session is valid while it has not been revoked.
    pub fn is_valid(&self) -> bool {
        self.revoked_at.is_none()
    }
}

const SESSION_COLUMNS: &str = "id, user_id, token_hash, team_id, ip_address, user_agent, \
     created_at, last_used_at, revoked_at, revocation_reason";

fn session_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Session> {
    Ok(Session {
        id: row.get(0)?,
        user_id: row.get(1)?,
        token_hash: row.get(2)?,
        team_id: row.get(3)?,
        ip_address: row.get(4)?,
        user_agent: row.get(5)?,
        created_at: row.get(6)?,
        last_used_at: row.get(7)?,
        revoked_at: row.get(8)?,
        revocation_reason: row.get(9)?,
    })
}

/// Session persistence and validation.
pub struct SessionStore {
    store: Arc<Store>,
    audit: Arc<AuditLog>,
}

impl SessionStore {
    pub fn new(store: Arc<Store>, audit: Arc<AuditLog>) -> Self {
        Self { store, audit }
    }

    /// Create a session record for a freshly issued bearer token.
    pub fn create(
        &self,
        user_id: &str,
        token: &str,
        team_id: Option<&str>,
        ip_address: Option<&str>,
        user_agent: Option<&str>,
    ) -> Result<Session, CoreError> {
        let id = uuid::Uuid::new_v4().to_string();
        let hash = token_hash(token);
        let now = Utc::now().timestamp();

        self.store.with_conn(None, |conn| {
            conn.execute(
                "INSERT INTO sessions (id, user_id, token_hash, team_id, ip_address, user_agent, created_at, last_used_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
                params![id, user_id, hash, team_id, ip_address, user_agent, now],
            )?;
            Ok(())
        })?;

        tracing::info!(user_id, session_id = %id, "session created");
        Ok(Session {
            id,
            user_id: user_id.to_string(),
            token_hash: hash,
            team_id: team_id.map(String::from),
            ip_address: ip_address.map(String::from),
            user_agent: user_agent.map(String::from),
            created_at: now,
            last_used_at: now,
            revoked_at: None,
            revocation_reason: None,
        })
    }

    /// Look up a session by its raw bearer token.
    pub fn get_by_token(&self, token: &str) -> Result<Option<Session>, CoreError> {
        let hash = token_hash(token);
        let session = self.store.with_conn(None, |conn| {
            conn.query_row(
                &format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE token_hash = ?1"),
                params![hash],
                session_from_row,
            )
            .optional()
            .map_err(StoreError::from)
        })?;
        Ok(session)
    }

    /// Validate a session for an authenticated request. Invoked on every
    /// request: missing sessions are rejected as possibly forged, revoked
    /// sessions are rejected with an audit trail, and `last_used_at` is
    /// updated best-effort on success.
    pub fn validate(
        &self,
        token: &str,
        ip_address: Option<&str>,
        request_id: Option<&str>,
    ) -> Result<Session, CoreError> {
        let Some(session) = self.get_by_token(token)? else {
            // A token absent from the session table is suspicious: forged,
            // or issued before tracking began. Reject either way.
            tracing::warn!("session not found for presented token");
            return Err(CoreError::SessionUnknown);
        };

        if !session.is_valid() {
            tracing::warn!(
                session_id = %session.id,
                user_id = %session.user_id,
                reason = session.revocation_reason.as_deref().unwrap_or("unknown"),
                "revoked session used"
            );
            let event = NewEvent::new(
                EventType::SecuritySessionRevoked,
                "Revoked session presented",
            )
            .actor(ActorType::User, Some(session.user_id.as_str()))
            .resource("session", session.id.as_str())
            .details(serde_json::json!({
                "reason": session.revocation_reason,
            }))
            .client(ip_address, None::<&str>)
            .request(request_id);
            if let Err(e) = self.audit.append(&event) {
                tracing::error!(error = %e, "failed to audit revoked session use");
            }
            return Err(CoreError::SessionRevoked {
                reason: session.revocation_reason.clone(),
            });
        }

        self.touch(&session.id);
        Ok(session)
    }

    /// Best-effort activity tracking; failure here never fails the request.
    fn touch(&self, session_id: &str) {
        let now = Utc::now().timestamp();
        let result = self.store.with_conn(None, |conn| {
            conn.execute(
                "UPDATE sessions SET last_used_at = ?1 WHERE id = ?2",
                params![now, session_id],
            )?;
            Ok(())
        });
        if let Err(e) = result {
            tracing::warn!(session_id, error = %e, "failed to update session activity");
        }
    }

    /// Revoke a single session. Returns whether a live session was revoked.
    pub fn revoke(
        &self,
        session_id: &str,
        reason: RevocationReason,
        actor_id: Option<&str>,
    ) -> Result<bool, CoreError> {
        let now = Utc::now().timestamp();
        let revoked = self.store.with_conn(None, |conn| {
            let n = conn.execute(
                "UPDATE sessions SET revoked_at = ?1, revocation_reason = ?2
                 WHERE id = ?3 AND revoked_at IS NULL",
                params![now, reason.as_str(), session_id],
            )?;
            Ok(n > 0)
        })?;

        if revoked {
            tracing::info!(session_id, reason = reason.as_str(), actor_id, "session revoked");
        }
        Ok(revoked)
    }

    /// Revoke all of a user's live sessions, optionally keeping one.
    pub fn revoke_all_user(
        &self,
        user_id: &str,
        reason: RevocationReason,
        exclude_session_id: Option<&str>,
        actor_id: Option<&str>,
    ) -> Result<usize, CoreError> {
        let count = self.store.with_conn(None, |conn| {
            revoke_all_user_stmt(conn, user_id, reason, exclude_session_id)
        })?;
        tracing::info!(
            user_id,
            count,
            reason = reason.as_str(),
            actor_id,
            "user sessions revoked"
        );
        Ok(count)
    }

    /// Same as [`revoke_all_user`](Self::revoke_all_user), but inside the
    /// caller's transaction — role and membership changes must commit their
    /// revocations atomically with the change itself.
    pub fn revoke_all_user_in(
        tx: &Transaction,
        user_id: &str,
        reason: RevocationReason,
    ) -> Result<usize, StoreError> {
        revoke_all_user_stmt(tx, user_id, reason, None)
    }

    /// Revoke every live session scoped to a team.
    pub fn revoke_team(
        &self,
        team_id: &str,
        reason: RevocationReason,
        actor_id: Option<&str>,
    ) -> Result<usize, CoreError> {
        let now = Utc::now().timestamp();
        let count = self.store.with_conn(None, |conn| {
            let n = conn.execute(
                "UPDATE sessions SET revoked_at = ?1, revocation_reason = ?2
                 WHERE team_id = ?3 AND revoked_at IS NULL",
                params![now, reason.as_str(), team_id],
            )?;
            Ok(n)
        })?;
        tracing::info!(
            team_id,
            count,
            reason = reason.as_str(),
            actor_id,
            "team sessions revoked"
        );
        Ok(count)
    }

    /// List a user's sessions, newest first.
    pub fn list_user(&self, user_id: &str) -> Result<Vec<Session>, CoreError> {
        let sessions = self.store.with_conn(None, |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SESSION_COLUMNS} FROM sessions WHERE user_id = ?1 ORDER BY created_at DESC"
            ))?;
            let rows = stmt
                .query_map(params![user_id], session_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })?;
        Ok(sessions)
    }

    /// Delete revoked sessions older than `days_old`. Revoked rows are kept
    /// for a while as an investigation trail, then cleaned up to bound
    /// table growth.
    pub fn purge_revoked(&self, days_old: i64) -> Result<usize, CoreError> {
        let cutoff = Utc::now().timestamp() - days_old * 24 * 3600;
        let count = self.store.with_conn(None, |conn| {
            let n = conn.execute(
                "DELETE FROM sessions WHERE revoked_at IS NOT NULL AND revoked_at < ?1",
                params![cutoff],
            )?;
            Ok(n)
        })?;
        if count > 0 {
            tracing::info!(count, "expired sessions cleaned up");
        }
        Ok(count)
    }
}

fn revoke_all_user_stmt(
    conn: &rusqlite::Connection,
    user_id: &str,
    reason: RevocationReason,
    exclude_session_id: Option<&str>,
) -> Result<usize, StoreError> {
    let now = Utc::now().timestamp();
    let n = match exclude_session_id {
        Some(exclude) => conn.execute(
            "UPDATE sessions SET revoked_at = ?1, revocation_reason = ?2
             WHERE user_id = ?3 AND revoked_at IS NULL AND id != ?4",
            params![now, reason.as_str(), user_id, exclude],
        )?,
        None => conn.execute(
            "UPDATE sessions SET revoked_at = ?1, revocation_reason = ?2
             WHERE user_id = ?3 AND revoked_at IS NULL",
            params![now, reason.as_str(), user_id],
        )?,
    };
    Ok(n)
}
