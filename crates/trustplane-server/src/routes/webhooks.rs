//! Payment-gateway webhook receiver.

use actix_web::{post, web, HttpRequest, HttpResponse};

use trustplane::webhook::WebhookOutcome;
use trustplane::CoreError;

use crate::error::ApiError;
use crate::metrics;
use crate::middleware::{enforce_ip_limit, RequestContext};
use crate::state::AppState;

#[post("/webhooks/stripe")]
pub async fn stripe_webhook(
    req: HttpRequest,
    state: web::Data<AppState>,
    body: web::Bytes,
) -> Result<HttpResponse, ApiError> {
    let ctx = RequestContext::new(&req);
    enforce_ip_limit(&state, &ctx)?;

    let signature = req
        .headers()
        .get("Stripe-Signature")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    match state.webhooks.process(&body, signature) {
        Ok(WebhookOutcome::Processed { webhook_id, event_type }) => {
            metrics::WEBHOOK_EVENTS.with_label_values(&["processed"]).inc();
            tracing::info!(webhook_id, event_type = %event_type, "webhook processed");
            Ok(ctx.ok_json(serde_json::json!({ "received": true })))
        }
        Ok(WebhookOutcome::Duplicate { webhook_id }) => {
            metrics::WEBHOOK_EVENTS.with_label_values(&["duplicate"]).inc();
            tracing::info!(webhook_id, "duplicate webhook acknowledged");
            Ok(ctx.ok_json(serde_json::json!({ "received": true, "duplicate": true })))
        }
        Err(e @ (CoreError::WebhookSignature(_) | CoreError::WebhookPayload(_))) => {
            metrics::WEBHOOK_EVENTS.with_label_values(&["rejected"]).inc();
            tracing::warn!(error = %e, "webhook rejected");
            Err(ctx.core_err(e))
        }
        Err(e) => {
            metrics::WEBHOOK_EVENTS.with_label_values(&["error"]).inc();
            Err(ctx.core_err(e))
        }
    }
}
