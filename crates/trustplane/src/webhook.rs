//! Inbound webhook verification, deduplication and dispatch.
//!
//! The signature header is the provider-standard `t=<unix>,v1=<hex>` form.
//! Timestamps outside the clock-skew tolerance are rejected before any MAC
//! work (replay defense); each `v1` candidate is compared in constant time.
//! Deduplication rides on the `(webhook_id, provider)` unique constraint:
//! zero rows inserted means the event was already accepted, and the second
//! delivery produces no state change and no dispatch.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use rusqlite::params;
use serde_json::Value;

use crate::audit::{ActorType, AuditLog, EventType, NewEvent};
use crate::crypto::SigningKey;
use crate::error::{CoreError, StoreError};
use crate::store::{Store, TxOptions};

/// The signed message is the timestamp joined to the raw payload.
fn signed_message(timestamp: i64, payload: &[u8]) -> Vec<u8> {
    let mut message = format!("{timestamp}.").into_bytes();
    message.extend_from_slice(payload);
    message
}

/// A verified, parsed webhook event.
#[derive(Debug, Clone)]
pub struct WebhookEvent {
    pub id: String,
    pub event_type: String,
    pub payload: Value,
}

/// Result of processing a delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookOutcome {
    /// First delivery: recorded and dispatched.
    Processed {
        webhook_id: String,
        event_type: String,
    },
    /// Replayed delivery: acknowledged, nothing re-executed.
    Duplicate { webhook_id: String },
}

/// Parse `t=<unix>,v1=<hex>[,v1=<hex>]*`. Unknown elements are ignored.
fn parse_signature_header(header: &str) -> Option<(i64, Vec<String>)> {
    let mut timestamp = None;
    let mut signatures = Vec::new();

    for element in header.split(',') {
        let (key, value) = element.trim().split_once('=')?;
        match key {
            "t" => timestamp = value.parse::<i64>().ok(),
            k if k.starts_with("v1") => signatures.push(value.to_string()),
            _ => {}
        }
    }

    match (timestamp, signatures.is_empty()) {
        (Some(t), false) => Some((t, signatures)),
        _ => None,
    }
}

/// Verify a signature header against the raw payload.
///
/// The signed message is `"<t>." + payload`; any matching `v1` candidate
/// accepts. Exposed separately so route handlers can verify before parsing.
pub fn verify_signature(
    secret: &[u8],
    payload: &[u8],
    signature_header: &str,
    tolerance_secs: i64,
    now: i64,
) -> Result<i64, CoreError> {
    let Some((timestamp, candidates)) = parse_signature_header(signature_header) else {
        return Err(CoreError::WebhookSignature(
            "malformed signature header".to_string(),
        ));
    };

    if (now - timestamp).abs() > tolerance_secs {
        return Err(CoreError::WebhookSignature(
            "timestamp outside tolerance".to_string(),
        ));
    }

    let key = SigningKey::new(secret);
    let message = signed_message(timestamp, payload);
    if candidates
        .iter()
        .any(|candidate| key.verify(&message, candidate))
    {
        return Ok(timestamp);
    }

    Err(CoreError::WebhookSignature("signature mismatch".to_string()))
}

/// Handler invoked for the first delivery of an event type.
pub type WebhookHandler = Arc<dyn Fn(&WebhookEvent) -> Result<(), CoreError> + Send + Sync>;

/// Webhook verification, dedup and dispatch for one provider.
pub struct WebhookProcessor {
    store: Arc<Store>,
    audit: Arc<AuditLog>,
    provider: String,
    secret: Vec<u8>,
    tolerance_secs: i64,
    handlers: HashMap<String, WebhookHandler>,
}

impl WebhookProcessor {
    pub fn new(
        store: Arc<Store>,
        audit: Arc<AuditLog>,
        provider: impl Into<String>,
        secret: Vec<u8>,
        tolerance_secs: i64,
    ) -> Self {
        Self {
            store,
            audit,
            provider: provider.into(),
            secret,
            tolerance_secs,
            handlers: HashMap::new(),
        }
    }

    /// Register the handler dispatched for `event_type`. Registration
    /// happens once at startup, before the processor is shared.
    pub fn register(&mut self, event_type: impl Into<String>, handler: WebhookHandler) {
        self.handlers.insert(event_type.into(), handler);
    }

    /// Verify, dedup and dispatch one delivery.
    pub fn process(
        &self,
        payload: &[u8],
        signature_header: &str,
    ) -> Result<WebhookOutcome, CoreError> {
        self.process_at(payload, signature_header, Utc::now().timestamp())
    }

    /// Clock-injected variant of [`process`](Self::process).
    pub fn process_at(
        &self,
        payload: &[u8],
        signature_header: &str,
        now: i64,
    ) -> Result<WebhookOutcome, CoreError> {
        verify_signature(
            &self.secret,
            payload,
            signature_header,
            self.tolerance_secs,
            now,
        )?;

        let body: Value = serde_json::from_slice(payload)
            .map_err(|e| CoreError::WebhookPayload(format!("invalid JSON: {e}")))?;
        let webhook_id = body
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| CoreError::WebhookPayload("missing id".to_string()))?
            .to_string();
        let event_type = body
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| CoreError::WebhookPayload("missing type".to_string()))?
            .to_string();

        // Dedup: the unique constraint decides, not a racy pre-check. The
        // acceptance record and its audit entry commit together.
        let inserted = self.store.transaction(TxOptions::read_committed(), |tx| {
            let n = tx
                .execute(
                    "INSERT OR IGNORE INTO processed_webhooks
                         (webhook_id, provider, event_type, payload, status, signature_valid, received_at)
                     VALUES (?1, ?2, ?3, ?4, 'processed', 1, ?5)",
                    params![webhook_id, self.provider, event_type, body.to_string(), now],
                )
                .map_err(StoreError::from)?;
            if n == 0 {
                return Ok(false);
            }
            self.audit.append_with(
                tx,
                &NewEvent::new(EventType::WebhookReceived, "Webhook accepted")
                    .actor(ActorType::Webhook, None::<&str>)
                    .resource("webhook", webhook_id.as_str())
                    .details(serde_json::json!({
                        "provider": self.provider,
                        "event_type": event_type,
                    })),
            )?;
            Ok(true)
        })?;

        if !inserted {
            tracing::info!(webhook_id, provider = %self.provider, "duplicate webhook ignored");
            return Ok(WebhookOutcome::Duplicate { webhook_id });
        }

        let event = WebhookEvent {
            id: webhook_id.clone(),
            event_type: event_type.clone(),
            payload: body,
        };
        if let Some(handler) = self.handlers.get(&event_type) {
            handler(&event)?;
        } else {
            tracing::debug!(event_type = %event_type, "no handler registered for webhook type");
        }

        tracing::info!(webhook_id, event_type = %event_type, "webhook processed");
        Ok(WebhookOutcome::Processed {
            webhook_id,
            event_type,
        })
    }

    /// Count of recorded deliveries, for health and tests.
    pub fn processed_count(&self) -> Result<i64, CoreError> {
        let count = self.store.with_conn(None, |conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM processed_webhooks WHERE provider = ?1",
                params![self.provider],
                |row| row.get(0),
            )
            .map_err(StoreError::from)
        })?;
        Ok(count)
    }
}

/// Build a signature header for a payload. Test and client-side helper.
pub fn sign_payload(secret: &[u8], payload: &[u8], timestamp: i64) -> String {
    let sig = SigningKey::new(secret).sign(&signed_message(timestamp, payload));
    format!("t={timestamp},v1={sig}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    const SECRET: &[u8] = b"whsec_test";

    fn processor() -> WebhookProcessor {
        let store = Arc::new(Store::in_memory().unwrap());
        let audit = Arc::new(AuditLog::new(Arc::clone(&store), b"secret".to_vec(), 90));
        WebhookProcessor::new(store, audit, "stripe", SECRET.to_vec(), 300)
    }

    fn event_body(id: &str) -> Vec<u8> {
        serde_json::json!({"id": id, "type": "payment_intent.succeeded", "data": {}})
            .to_string()
            .into_bytes()
    }

    #[test]
    fn test_valid_signature_accepted() {
        let now = 1_700_000_000;
        let payload = event_body("evt_1");
        let header = sign_payload(SECRET, &payload, now);
        assert!(verify_signature(SECRET, &payload, &header, 300, now).is_ok());
    }

    #[test]
    fn test_clock_skew_boundary() {
        let now = 1_700_000_000;
        let payload = event_body("evt_1");

        let header = sign_payload(SECRET, &payload, now - 299);
        assert!(verify_signature(SECRET, &payload, &header, 300, now).is_ok());

        let header = sign_payload(SECRET, &payload, now - 301);
        assert!(matches!(
            verify_signature(SECRET, &payload, &header, 300, now),
            Err(CoreError::WebhookSignature(_))
        ));
    }

    #[test]
    fn test_tampered_payload_rejected() {
        let now = 1_700_000_000;
        let payload = event_body("evt_1");
        let header = sign_payload(SECRET, &payload, now);
        assert!(matches!(
            verify_signature(SECRET, b"tampered", &header, 300, now),
            Err(CoreError::WebhookSignature(_))
        ));
    }

    #[test]
    fn test_any_v1_candidate_accepts() {
        let now = 1_700_000_000;
        let payload = event_body("evt_1");
        let good = sign_payload(SECRET, &payload, now);
        let sig = good.split("v1=").nth(1).unwrap();
        let header = format!("t={now},v1={bad},v1={sig}", bad = "00".repeat(32));
        assert!(verify_signature(SECRET, &payload, &header, 300, now).is_ok());
    }

    #[test]
    fn test_malformed_header_rejected() {
        let now = 1_700_000_000;
        for header in ["", "t=abc,v1=00", "v1=00", "t=123"] {
            assert!(matches!(
                verify_signature(SECRET, b"x", header, 300, now),
                Err(CoreError::WebhookSignature(_))
            ));
        }
    }

    #[test]
    fn test_process_then_duplicate() {
        let now = 1_700_000_000;
        let processor = processor();
        let payload = event_body("evt_1");
        let header = sign_payload(SECRET, &payload, now);

        let first = processor.process_at(&payload, &header, now).unwrap();
        assert!(matches!(first, WebhookOutcome::Processed { .. }));
        assert_eq!(processor.processed_count().unwrap(), 1);

        let second = processor.process_at(&payload, &header, now).unwrap();
        assert_eq!(
            second,
            WebhookOutcome::Duplicate {
                webhook_id: "evt_1".to_string()
            }
        );
        assert_eq!(processor.processed_count().unwrap(), 1);
    }

    #[test]
    fn test_duplicate_does_not_dispatch() {
        let now = 1_700_000_000;
        let mut processor = processor();
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        processor.register(
            "payment_intent.succeeded",
            Arc::new(move |_event| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );

        let payload = event_body("evt_1");
        let header = sign_payload(SECRET, &payload, now);
        processor.process_at(&payload, &header, now).unwrap();
        processor.process_at(&payload, &header, now).unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_missing_id_rejected() {
        let now = 1_700_000_000;
        let processor = processor();
        let payload = serde_json::json!({"type": "x"}).to_string().into_bytes();
        let header = sign_payload(SECRET, &payload, now);
        assert!(matches!(
            processor.process_at(&payload, &header, now),
            Err(CoreError::WebhookPayload(_))
        ));
    }

    #[test]
    fn test_same_id_different_provider_accepted() {
        let store = Arc::new(Store::in_memory().unwrap());
        let audit = Arc::new(AuditLog::new(Arc::clone(&store), b"secret".to_vec(), 90));
        let stripe = WebhookProcessor::new(
            Arc::clone(&store),
            Arc::clone(&audit),
            "stripe",
            SECRET.to_vec(),
            300,
        );
        let other = WebhookProcessor::new(store, audit, "adyen", SECRET.to_vec(), 300);

        let now = 1_700_000_000;
        let payload = event_body("evt_1");
        let header = sign_payload(SECRET, &payload, now);

        assert!(matches!(
            stripe.process_at(&payload, &header, now).unwrap(),
            WebhookOutcome::Processed { .. }
        ));
        assert!(matches!(
            other.process_at(&payload, &header, now).unwrap(),
            WebhookOutcome::Processed { .. }
        ));
    }
}
