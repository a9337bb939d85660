//! Authentication endpoints.

use actix_web::{post, put, web, HttpRequest, HttpResponse};
use serde::Deserialize;

use crate::error::{ApiError, ErrorCode};
use crate::metrics;
use crate::middleware::{authenticate, enforce_login_limit, RequestContext};
use crate::state::AppState;

#[derive(Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[post("/auth/login")]
pub async fn login(
    req: HttpRequest,
    state: web::Data<AppState>,
    body: web::Json<LoginRequest>,
) -> Result<HttpResponse, ApiError> {
    let ctx = RequestContext::new(&req);
    enforce_login_limit(&state, &ctx)?;

    if body.email.is_empty() || body.password.is_empty() {
        return Err(ctx
            .err(ErrorCode::ValidationError)
            .message("Email and password required"));
    }

    let result = state
        .auth
        .login(
            &body.email,
            &body.password,
            ctx.ip.as_deref(),
            ctx.user_agent.as_deref(),
            &ctx.request_id,
        )
        .await;

    match result {
        Ok(outcome) => {
            metrics::AUTH_ATTEMPTS.with_label_values(&["success"]).inc();
            Ok(ctx.ok_json(serde_json::json!({
                "user_id": outcome.user_id,
                "access_token": outcome.access_token,
            })))
        }
        Err(e) => {
            metrics::AUTH_ATTEMPTS.with_label_values(&["failure"]).inc();
            Err(e)
        }
    }
}

#[derive(Deserialize, Default)]
pub struct LogoutRequest {
    #[serde(default)]
    pub logout_all: bool,
}

#[post("/auth/logout")]
pub async fn logout(
    req: HttpRequest,
    state: web::Data<AppState>,
    body: Option<web::Json<LogoutRequest>>,
) -> Result<HttpResponse, ApiError> {
    let ctx = RequestContext::new(&req);
    let session = authenticate(&state, &req, &ctx)?;

    let logout_all = body.map(|b| b.logout_all).unwrap_or(false);
    let revoked = state.auth.logout(&session, logout_all, &ctx.request_id)?;

    Ok(ctx.ok_json(serde_json::json!({
        "message": "Logged out successfully",
        "sessions_revoked": revoked,
    })))
}

#[post("/auth/refresh")]
pub async fn refresh(
    req: HttpRequest,
    state: web::Data<AppState>,
) -> Result<HttpResponse, ApiError> {
    let ctx = RequestContext::new(&req);
    let session = authenticate(&state, &req, &ctx)?;

    let outcome = state.auth.refresh(
        &session,
        ctx.ip.as_deref(),
        ctx.user_agent.as_deref(),
        &ctx.request_id,
    )?;
    Ok(ctx.ok_json(serde_json::json!({
        "user_id": outcome.user_id,
        "access_token": outcome.access_token,
    })))
}

#[derive(Deserialize)]
pub struct PasswordChangeRequest {
    pub new_password: String,
}

#[put("/auth/password")]
pub async fn change_password(
    req: HttpRequest,
    state: web::Data<AppState>,
    body: web::Json<PasswordChangeRequest>,
) -> Result<HttpResponse, ApiError> {
    let ctx = RequestContext::new(&req);
    let session = authenticate(&state, &req, &ctx)?;

    state
        .auth
        .change_password(&session, &body.new_password, &ctx.request_id)
        .await?;

    Ok(ctx.ok_json(serde_json::json!({
        "message": "Password changed. All sessions revoked."
    })))
}
