//! The request pipeline.
//!
//! Guards run in a fixed order at the top of each handler, reading and
//! writing a request-scoped [`RequestContext`]:
//!
//! rate limit → authentication → team scope → idempotency → handler →
//! audit → response envelope.
//!
//! Each guard returns the error envelope directly on rejection, so a
//! request stops at the first failed stage. Static security headers are
//! added by `DefaultHeaders` in the server setup; the per-request
//! `X-Request-ID` is attached here and by [`crate::error::ApiError`].

use actix_web::{HttpRequest, HttpResponse};
use serde::Serialize;

use trustplane::audit::{ActorType, EventType, NewEvent};
use trustplane::authz::{AuthzContext, Role};
use trustplane::crypto::generate_request_id;
use trustplane::ratelimit::{client_fingerprint, Decision};
use trustplane::session::Session;

use crate::error::{ApiError, ErrorCode};
use crate::metrics;
use crate::state::AppState;

/// Request-scoped context threaded through the pipeline.
pub struct RequestContext {
    pub request_id: String,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
    pub fingerprint: String,
}

impl RequestContext {
    pub fn new(req: &HttpRequest) -> Self {
        let ip = req.peer_addr().map(|addr| addr.ip().to_string());
        let user_agent = header(req, "User-Agent");
        let client_header = header(req, "X-Client-Fingerprint").unwrap_or_default();
        let fingerprint = client_fingerprint(
            ip.as_deref().unwrap_or("unknown"),
            user_agent.as_deref().unwrap_or("unknown"),
            &client_header,
        );
        Self {
            request_id: generate_request_id(),
            ip,
            user_agent,
            fingerprint,
        }
    }

    /// 200 response with the request id header, the envelope's happy path.
    pub fn ok_json(&self, body: impl Serialize) -> HttpResponse {
        HttpResponse::Ok()
            .insert_header(("X-Request-ID", self.request_id.as_str()))
            .json(body)
    }

    pub fn err(&self, code: ErrorCode) -> ApiError {
        ApiError::new(code).request_id(self.request_id.as_str())
    }

    pub fn core_err(&self, error: trustplane::CoreError) -> ApiError {
        ApiError::from_core(error, &self.request_id)
    }
}

fn header(req: &HttpRequest, name: &str) -> Option<String> {
    req.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
}

/// Extract the bearer token from `Authorization`.
pub fn extract_bearer(req: &HttpRequest) -> Option<String> {
    header(req, "Authorization")?
        .strip_prefix("Bearer ")
        .map(String::from)
}

fn limited(
    state: &AppState,
    ctx: &RequestContext,
    scope: &'static str,
    user_id: Option<&str>,
    decision: Decision,
) -> Result<(), ApiError> {
    let Decision::Limited { retry_after } = decision else {
        return Ok(());
    };

    metrics::RATE_LIMIT_HITS.with_label_values(&[scope]).inc();
    tracing::warn!(scope, fingerprint = %ctx.fingerprint, "rate limit hit");

    let event = NewEvent::new(EventType::SecurityRateLimitHit, "Rate limit exceeded")
        .actor(
            if user_id.is_some() {
                ActorType::User
            } else {
                ActorType::Anonymous
            },
            user_id,
        )
        .details(serde_json::json!({ "scope": scope }))
        .client(ctx.ip.as_deref(), ctx.user_agent.as_deref())
        .request(Some(ctx.request_id.as_str()));
    if let Err(e) = state.audit.append(&event) {
        tracing::error!(error = %e, "failed to audit rate limit hit");
    }

    Err(ctx
        .err(ErrorCode::RateLimited)
        .retry_after(retry_after))
}

/// Per-fingerprint limit applied to every request.
pub fn enforce_ip_limit(state: &AppState, ctx: &RequestContext) -> Result<(), ApiError> {
    let decision = state.limiter.check_ip(&ctx.fingerprint);
    limited(state, ctx, "ip", None, decision)
}

/// Stricter limit for the login endpoint.
pub fn enforce_login_limit(state: &AppState, ctx: &RequestContext) -> Result<(), ApiError> {
    let decision = state.limiter.check_login(&ctx.fingerprint);
    limited(state, ctx, "login", None, decision)
}

/// Per-user limit once the session is known.
pub fn enforce_user_limit(
    state: &AppState,
    ctx: &RequestContext,
    user_id: &str,
) -> Result<(), ApiError> {
    let decision = state.limiter.check_user(user_id);
    limited(state, ctx, "user", Some(user_id), decision)
}

/// Payment-endpoint limit.
pub fn enforce_payment_limit(
    state: &AppState,
    ctx: &RequestContext,
    user_id: &str,
) -> Result<(), ApiError> {
    let decision = state.limiter.check_payment(user_id);
    limited(state, ctx, "payment", Some(user_id), decision)
}

/// Authentication guard: bearer token present, session tracked and not
/// revoked. Runs on every authenticated request.
pub fn authenticate(
    state: &AppState,
    req: &HttpRequest,
    ctx: &RequestContext,
) -> Result<Session, ApiError> {
    let Some(token) = extract_bearer(req) else {
        return Err(ctx.err(ErrorCode::AuthRequired));
    };
    state
        .sessions
        .validate(&token, ctx.ip.as_deref(), Some(ctx.request_id.as_str()))
        .map_err(|e| ctx.core_err(e))
}

/// Team-scope guard: active membership and sufficient role, checked fresh
/// against the store. Denials are audited.
pub fn team_scope(
    state: &AppState,
    ctx: &RequestContext,
    user_id: &str,
    team_id: &str,
    required_role: Option<Role>,
) -> Result<AuthzContext, ApiError> {
    if team_id.is_empty() {
        return Err(ctx.err(ErrorCode::TeamRequired));
    }
    state
        .authz
        .require(user_id, team_id, required_role)
        .map_err(|e| {
            if matches!(
                e,
                trustplane::CoreError::TeamBoundary { .. }
                    | trustplane::CoreError::RoleDenied { .. }
            ) {
                let event = NewEvent::new(EventType::AuthzAccessDenied, "Team access denied")
                    .actor(ActorType::User, Some(user_id))
                    .resource("team", team_id)
                    .client(ctx.ip.as_deref(), ctx.user_agent.as_deref())
                    .request(Some(ctx.request_id.as_str()));
                if let Err(audit_err) = state.audit.append(&event) {
                    tracing::error!(error = %audit_err, "failed to audit access denial");
                }
            }
            ctx.core_err(e)
        })
}
