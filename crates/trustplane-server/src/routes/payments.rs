//! Payment endpoints.
//!
//! Creation runs the full pipeline: rate limits, session validation, team
//! scope, then the idempotency engine wrapping the payment insert so the
//! acquire, the insert, the audit event and the cached response commit
//! together.

use actix_web::{get, post, web, HttpRequest, HttpResponse};
use serde::Deserialize;

use trustplane::authz::Role;
use trustplane::crypto::{sign_cursor, verify_cursor};
use trustplane::payments::NewPayment;

use crate::error::ApiError;
use crate::metrics;
use crate::middleware::{
    authenticate, enforce_ip_limit, enforce_payment_limit, enforce_user_limit, team_scope,
    RequestContext,
};
use crate::state::AppState;

#[derive(Deserialize)]
pub struct CreatePaymentRequest {
    pub team_id: String,
    pub amount_cents: i64,
    pub currency: String,
}

#[post("/payments")]
pub async fn create_payment(
    req: HttpRequest,
    state: web::Data<AppState>,
    body: web::Bytes,
) -> Result<HttpResponse, ApiError> {
    let ctx = RequestContext::new(&req);
    enforce_ip_limit(&state, &ctx)?;
    let session = authenticate(&state, &req, &ctx)?;
    enforce_user_limit(&state, &ctx, &session.user_id)?;
    enforce_payment_limit(&state, &ctx, &session.user_id)?;

    let parsed: CreatePaymentRequest = serde_json::from_slice(&body)
        .map_err(|_| ctx.core_err(trustplane::CoreError::Validation("invalid request body".to_string())))?;
    team_scope(&state, &ctx, &session.user_id, &parsed.team_id, Some(Role::Member))?;

    let idempotency_key = req
        .headers()
        .get("Idempotency-Key")
        .and_then(|v| v.to_str().ok())
        .map(String::from);

    let start = std::time::Instant::now();
    let result = match idempotency_key {
        Some(key) => {
            // The raw body bytes are the hashed request: a replayed key
            // with any byte changed is a conflict, not a re-execution.
            let new_payment = NewPayment {
                team_id: parsed.team_id.clone(),
                user_id: session.user_id.clone(),
                amount_cents: parsed.amount_cents,
                currency: parsed.currency.clone(),
                idempotency_key: Some(key.clone()),
            };
            let payments = &state.payments;
            let request_id = ctx.request_id.clone();
            state.idempotency.run_idempotent(
                &key,
                &session.user_id,
                &body,
                move |tx| {
                    let payment = payments.create_in(tx, &new_payment, Some(request_id.as_str()))?;
                    serde_json::to_value(&payment).map_err(|e| {
                        trustplane::CoreError::Validation(format!("serialization failed: {e}"))
                    })
                },
            )
        }
        None => {
            let new_payment = NewPayment {
                team_id: parsed.team_id,
                user_id: session.user_id.clone(),
                amount_cents: parsed.amount_cents,
                currency: parsed.currency,
                idempotency_key: None,
            };
            state
                .payments
                .create(&new_payment, Some(ctx.request_id.as_str()))
                .and_then(|payment| {
                    serde_json::to_value(&payment).map_err(|e| {
                        trustplane::CoreError::Validation(format!("serialization failed: {e}"))
                    })
                })
        }
    };
    let elapsed = start.elapsed().as_secs_f64();

    match result {
        Ok(payment) => {
            metrics::PAYMENT_REQUESTS.with_label_values(&["success"]).inc();
            metrics::PAYMENT_LATENCY
                .with_label_values(&["success"])
                .observe(elapsed);
            Ok(ctx.ok_json(payment))
        }
        Err(e) => {
            metrics::PAYMENT_REQUESTS.with_label_values(&["rejected"]).inc();
            metrics::PAYMENT_LATENCY
                .with_label_values(&["rejected"])
                .observe(elapsed);
            Err(ctx.core_err(e))
        }
    }
}

const LIST_PAGE_SIZE: u32 = 50;

#[derive(Deserialize)]
pub struct ListPaymentsQuery {
    pub cursor: Option<String>,
}

#[get("/teams/{team_id}/payments")]
pub async fn list_team_payments(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<String>,
    query: web::Query<ListPaymentsQuery>,
) -> Result<HttpResponse, ApiError> {
    let ctx = RequestContext::new(&req);
    enforce_ip_limit(&state, &ctx)?;
    let session = authenticate(&state, &req, &ctx)?;
    enforce_user_limit(&state, &ctx, &session.user_id)?;

    let team_id = path.into_inner();
    team_scope(&state, &ctx, &session.user_id, &team_id, Some(Role::Viewer))?;

    // Cursors are opaque and signed; any tampering invalidates them.
    let cursor_secret = &state.config.core.cursor_secret;
    let offset = match &query.cursor {
        Some(cursor) => verify_cursor(cursor, cursor_secret)
            .and_then(|data| data.get("offset").and_then(|o| o.as_u64()))
            .ok_or_else(|| {
                ctx.err(crate::error::ErrorCode::ValidationError)
                    .message("Invalid pagination cursor")
                    .field("cursor")
            })? as u32,
        None => 0,
    };

    let payments = state
        .payments
        .list_team(&team_id, offset, LIST_PAGE_SIZE)
        .map_err(|e| ctx.core_err(e))?;

    let next_cursor = (payments.len() as u32 == LIST_PAGE_SIZE).then(|| {
        sign_cursor(
            &serde_json::json!({ "offset": offset + LIST_PAGE_SIZE }),
            cursor_secret,
        )
    });

    Ok(ctx.ok_json(serde_json::json!({
        "payments": payments,
        "next_cursor": next_cursor,
    })))
}

#[get("/payments/{payment_id}")]
pub async fn get_payment(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, ApiError> {
    let ctx = RequestContext::new(&req);
    enforce_ip_limit(&state, &ctx)?;
    let session = authenticate(&state, &req, &ctx)?;
    enforce_user_limit(&state, &ctx, &session.user_id)?;

    let payment_id = path.into_inner();
    let payment = state
        .payments
        .get(&payment_id)
        .map_err(|e| ctx.core_err(e))?
        .ok_or_else(|| ctx.core_err(trustplane::CoreError::NotFound("payment")))?;

    team_scope(&state, &ctx, &session.user_id, &payment.team_id, Some(Role::Viewer))?;
    Ok(ctx.ok_json(payment))
}

#[post("/payments/{payment_id}/cancel")]
pub async fn cancel_payment(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, ApiError> {
    let ctx = RequestContext::new(&req);
    enforce_ip_limit(&state, &ctx)?;
    let session = authenticate(&state, &req, &ctx)?;
    enforce_user_limit(&state, &ctx, &session.user_id)?;

    let payment_id = path.into_inner();
    let payment = state
        .payments
        .get(&payment_id)
        .map_err(|e| ctx.core_err(e))?
        .ok_or_else(|| ctx.core_err(trustplane::CoreError::NotFound("payment")))?;
    team_scope(&state, &ctx, &session.user_id, &payment.team_id, Some(Role::Member))?;

    let taken = state
        .payments
        .cancel(&payment_id, &session.user_id)
        .map_err(|e| ctx.core_err(e))?;
    Ok(ctx.ok_json(serde_json::json!({ "cancelled": taken })))
}

#[post("/payments/{payment_id}/refund")]
pub async fn refund_payment(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, ApiError> {
    let ctx = RequestContext::new(&req);
    enforce_ip_limit(&state, &ctx)?;
    let session = authenticate(&state, &req, &ctx)?;
    enforce_user_limit(&state, &ctx, &session.user_id)?;

    let payment_id = path.into_inner();
    let payment = state
        .payments
        .get(&payment_id)
        .map_err(|e| ctx.core_err(e))?
        .ok_or_else(|| ctx.core_err(trustplane::CoreError::NotFound("payment")))?;
    team_scope(&state, &ctx, &session.user_id, &payment.team_id, Some(Role::Admin))?;

    let taken = state
        .payments
        .refund(&payment_id, &session.user_id)
        .map_err(|e| ctx.core_err(e))?;
    Ok(ctx.ok_json(serde_json::json!({ "refunded": taken })))
}
