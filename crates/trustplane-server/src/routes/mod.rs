//! HTTP endpoints.

pub mod auth;
pub mod health;
pub mod payments;
pub mod teams;
pub mod webhooks;

use actix_web::{get, web, HttpRequest, HttpResponse};

use trustplane::crypto::constant_time_eq;

use crate::metrics;
use crate::state::AppState;

#[get("/metrics")]
pub async fn metrics_endpoint(req: HttpRequest, state: web::Data<AppState>) -> HttpResponse {
    match &state.config.metrics_token {
        Some(token) => {
            let authorized = req
                .headers()
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("Bearer "))
                .map(|t| constant_time_eq(t.as_bytes(), token.as_bytes()))
                .unwrap_or(false);
            if !authorized {
                return HttpResponse::Unauthorized().json(serde_json::json!({
                    "error": "unauthorized",
                    "message": "Valid Bearer token required for /metrics"
                }));
            }
        }
        None => {
            return HttpResponse::Forbidden().json(serde_json::json!({
                "error": "forbidden",
                "message": "Set METRICS_TOKEN to enable /metrics"
            }));
        }
    }

    metrics::RATE_LIMIT_STORE_FAILURES.set(state.limiter.store_failures() as i64);
    HttpResponse::Ok()
        .content_type("text/plain; version=0.0.4")
        .body(metrics::metrics_output())
}

/// Register every route. Shared between `main` and the integration tests.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(health::health)
        .service(health::ready)
        .service(health::live)
        .service(metrics_endpoint)
        .service(auth::login)
        .service(auth::logout)
        .service(auth::refresh)
        .service(auth::change_password)
        .service(teams::create_team)
        .service(teams::list_teams)
        .service(teams::add_member)
        .service(teams::change_role)
        .service(teams::remove_member)
        .service(payments::create_payment)
        .service(payments::list_team_payments)
        .service(payments::get_payment)
        .service(payments::cancel_payment)
        .service(payments::refund_payment)
        .service(webhooks::stripe_webhook);
}
