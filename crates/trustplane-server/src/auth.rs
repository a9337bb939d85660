//! Authentication service: lockout-guarded password login through the
//! identity provider, bearer token issuance, logout, password change and
//! token refresh. The identity provider sits behind its circuit breaker;
//! every outcome is audited.

use std::sync::Arc;

use serde::Serialize;

use trustplane::audit::{ActorType, AuditLog, EventType, NewEvent};
use trustplane::circuit::CircuitRegistry;
use trustplane::crypto::generate_token;
use trustplane::lockout::LockoutGuard;
use trustplane::session::{RevocationReason, Session, SessionStore};
use trustplane::CoreError;

use crate::error::{ApiError, ErrorCode};
use crate::identity::{IdentityError, IdentityProvider};

const IDENTITY_CIRCUIT: &str = "identity";

/// Successful login result returned to the client.
#[derive(Debug, Serialize)]
pub struct LoginOutcome {
    pub user_id: String,
    pub access_token: String,
}

pub struct AuthService {
    identity: Arc<IdentityProvider>,
    sessions: Arc<SessionStore>,
    audit: Arc<AuditLog>,
    lockouts: Arc<LockoutGuard>,
    circuits: Arc<CircuitRegistry>,
}

impl AuthService {
    pub fn new(
        identity: Arc<IdentityProvider>,
        sessions: Arc<SessionStore>,
        audit: Arc<AuditLog>,
        lockouts: Arc<LockoutGuard>,
        circuits: Arc<CircuitRegistry>,
    ) -> Self {
        Self {
            identity,
            sessions,
            audit,
            lockouts,
            circuits,
        }
    }

    fn audit_login_failure(
        &self,
        email: &str,
        reason: &str,
        ip: Option<&str>,
        ua: Option<&str>,
        request_id: &str,
    ) {
        let event = NewEvent::new(EventType::AuthLoginFailure, "Failed password auth")
            .actor(ActorType::Anonymous, None::<&str>)
            .details(serde_json::json!({
                "method": "password",
                "email": email,
                "failure_reason": reason,
            }))
            .client(ip, ua)
            .request(Some(request_id));
        if let Err(e) = self.audit.append(&event) {
            tracing::error!(error = %e, "failed to audit login failure");
        }
    }

    /// Password login. Lockout check, circuit-guarded verification, session
    /// creation, audit of both outcomes.
    pub async fn login(
        &self,
        email: &str,
        password: &str,
        ip: Option<&str>,
        ua: Option<&str>,
        request_id: &str,
    ) -> Result<LoginOutcome, ApiError> {
        if let Some(locked_until) = self.lockouts.check(None, ip) {
            self.audit_login_failure(email, "account_locked", ip, ua, request_id);
            return Err(ApiError::from_core(
                CoreError::AccountLocked { locked_until },
                request_id,
            ));
        }

        let circuit = self.circuits.get(IDENTITY_CIRCUIT);
        if !circuit.try_acquire() {
            return Err(ApiError::from_core(
                CoreError::CircuitOpen {
                    circuit: IDENTITY_CIRCUIT.to_string(),
                },
                request_id,
            ));
        }

        let verified = match self.identity.verify_password(email, password).await {
            Ok(verified) => {
                circuit.record_success();
                verified
            }
            Err(IdentityError::InvalidCredentials) => {
                // The provider answered; only the credentials are wrong.
                circuit.record_success();
                let locked = self
                    .lockouts
                    .record_failure(None, ip)
                    .map_err(|e| ApiError::from_core(e, request_id))?;
                self.audit_login_failure(email, "invalid_credentials", ip, ua, request_id);
                return Err(match locked {
                    Some(locked_until) => {
                        ApiError::from_core(CoreError::AccountLocked { locked_until }, request_id)
                    }
                    None => ApiError::new(ErrorCode::AuthRequired)
                        .message("Invalid credentials")
                        .request_id(request_id),
                });
            }
            Err(IdentityError::Unavailable(reason)) => {
                circuit.record_failure();
                tracing::error!(request_id, error = %reason, "identity provider unavailable");
                return Err(ApiError::from_core(
                    CoreError::CircuitOpen {
                        circuit: IDENTITY_CIRCUIT.to_string(),
                    },
                    request_id,
                ));
            }
        };

        if let Some(locked_until) = self.lockouts.check(Some(verified.user_id.as_str()), None) {
            self.audit_login_failure(email, "account_locked", ip, ua, request_id);
            return Err(ApiError::from_core(
                CoreError::AccountLocked { locked_until },
                request_id,
            ));
        }

        self.lockouts
            .reset(Some(verified.user_id.as_str()), ip)
            .map_err(|e| ApiError::from_core(e, request_id))?;

        let token = generate_token();
        self.sessions
            .create(&verified.user_id, &token, None, ip, ua)
            .map_err(|e| ApiError::from_core(e, request_id))?;

        self.audit
            .append(
                &NewEvent::new(EventType::AuthLoginSuccess, "Successful password auth")
                    .actor(ActorType::User, Some(verified.user_id.as_str()))
                    .details(serde_json::json!({ "method": "password" }))
                    .client(ip, ua)
                    .request(Some(request_id)),
            )
            .map_err(|e| ApiError::from_core(e, request_id))?;

        tracing::info!(user_id = %verified.user_id, "user authenticated");
        Ok(LoginOutcome {
            user_id: verified.user_id,
            access_token: token,
        })
    }

    /// Revoke the current session, or every session when `logout_all`.
    pub fn logout(
        &self,
        session: &Session,
        logout_all: bool,
        request_id: &str,
    ) -> Result<usize, ApiError> {
        let revoked = if logout_all {
            self.sessions
                .revoke_all_user(
                    &session.user_id,
                    RevocationReason::ManualLogout,
                    None,
                    Some(session.user_id.as_str()),
                )
                .map_err(|e| ApiError::from_core(e, request_id))?
        } else {
            let one = self
                .sessions
                .revoke(
                    &session.id,
                    RevocationReason::ManualLogout,
                    Some(session.user_id.as_str()),
                )
                .map_err(|e| ApiError::from_core(e, request_id))?;
            usize::from(one)
        };

        self.audit
            .append(
                &NewEvent::new(EventType::AuthLogout, "User logged out")
                    .actor(ActorType::User, Some(session.user_id.as_str()))
                    .details(serde_json::json!({
                        "logout_all": logout_all,
                        "sessions_revoked": revoked,
                    }))
                    .request(Some(request_id)),
            )
            .map_err(|e| ApiError::from_core(e, request_id))?;
        Ok(revoked)
    }

    /// Change the password at the identity provider, then force re-login
    /// everywhere.
    pub async fn change_password(
        &self,
        session: &Session,
        new_password: &str,
        request_id: &str,
    ) -> Result<(), ApiError> {
        if new_password.len() < 8 {
            return Err(ApiError::new(ErrorCode::ValidationError)
                .message("Password must be at least 8 characters")
                .field("new_password")
                .request_id(request_id));
        }

        let circuit = self.circuits.get(IDENTITY_CIRCUIT);
        if !circuit.try_acquire() {
            return Err(ApiError::from_core(
                CoreError::CircuitOpen {
                    circuit: IDENTITY_CIRCUIT.to_string(),
                },
                request_id,
            ));
        }
        match self
            .identity
            .update_password(&session.user_id, new_password)
            .await
        {
            Ok(()) => circuit.record_success(),
            Err(e) => {
                circuit.record_failure();
                tracing::error!(request_id, error = %e, "password update failed");
                return Err(ApiError::new(ErrorCode::InternalError).request_id(request_id));
            }
        }

        let revoked = self
            .sessions
            .revoke_all_user(
                &session.user_id,
                RevocationReason::PasswordChange,
                None,
                Some(session.user_id.as_str()),
            )
            .map_err(|e| ApiError::from_core(e, request_id))?;

        self.audit
            .append(
                &NewEvent::new(EventType::AuthPasswordChange, "Password changed")
                    .actor(ActorType::User, Some(session.user_id.as_str()))
                    .details(serde_json::json!({ "sessions_revoked": revoked }))
                    .request(Some(request_id)),
            )
            .map_err(|e| ApiError::from_core(e, request_id))?;

        tracing::info!(user_id = %session.user_id, "password changed, all sessions revoked");
        Ok(())
    }

    /// Rotate the bearer token: issue a new session and revoke the old one.
    pub fn refresh(
        &self,
        session: &Session,
        ip: Option<&str>,
        ua: Option<&str>,
        request_id: &str,
    ) -> Result<LoginOutcome, ApiError> {
        let token = generate_token();
        self.sessions
            .create(&session.user_id, &token, session.team_id.as_deref(), ip, ua)
            .map_err(|e| ApiError::from_core(e, request_id))?;
        self.sessions
            .revoke(
                &session.id,
                RevocationReason::TokenRefresh,
                Some(session.user_id.as_str()),
            )
            .map_err(|e| ApiError::from_core(e, request_id))?;

        tracing::info!(user_id = %session.user_id, "token refreshed");
        Ok(LoginOutcome {
            user_id: session.user_id.clone(),
            access_token: token,
        })
    }
}
