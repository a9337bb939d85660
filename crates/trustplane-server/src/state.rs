//! Shared application state: the dependency container built once at
//! startup and threaded into handlers. No hidden globals — tests substitute
//! any piece by building their own state.

use std::sync::Arc;

use trustplane::audit::AuditLog;
use trustplane::authz::Authorizer;
use trustplane::circuit::CircuitRegistry;
use trustplane::idempotency::IdempotencyEngine;
use trustplane::lockout::LockoutGuard;
use trustplane::payments::PaymentEngine;
use trustplane::ratelimit::{MemoryCounterStore, RateLimiter};
use trustplane::session::SessionStore;
use trustplane::store::Store;
use trustplane::webhook::{WebhookEvent, WebhookProcessor};
use trustplane::CoreError;

use crate::auth::AuthService;
use crate::config::{IdentitySettings, ServerConfig};
use crate::identity::{HttpIdentityProvider, IdentityProvider, StaticIdentityProvider};

/// Everything a handler needs, wired once at startup.
pub struct AppState {
    pub config: ServerConfig,
    pub store: Arc<Store>,
    pub audit: Arc<AuditLog>,
    pub sessions: Arc<SessionStore>,
    pub authz: Arc<Authorizer>,
    pub idempotency: Arc<IdempotencyEngine>,
    pub payments: Arc<PaymentEngine>,
    pub webhooks: Arc<WebhookProcessor>,
    pub limiter: Arc<RateLimiter>,
    pub circuits: Arc<CircuitRegistry>,
    pub lockouts: Arc<LockoutGuard>,
    pub identity: Arc<IdentityProvider>,
    pub auth: AuthService,
}

impl AppState {
    pub fn build(config: ServerConfig) -> Result<Self, CoreError> {
        let store = Arc::new(if config.core.store.path == ":memory:" {
            Store::in_memory()?
        } else {
            Store::open(config.core.store.clone())?
        });

        let audit = Arc::new(AuditLog::new(
            Arc::clone(&store),
            config.core.audit.hmac_secret.clone(),
            config.core.audit.hot_retention_days,
        ));
        let sessions = Arc::new(SessionStore::new(Arc::clone(&store), Arc::clone(&audit)));
        let authz = Arc::new(Authorizer::new(Arc::clone(&store), Arc::clone(&audit)));
        let idempotency = Arc::new(IdempotencyEngine::new(
            Arc::clone(&store),
            config.core.idempotency_ttl_hours,
        ));
        let payments = Arc::new(PaymentEngine::new(Arc::clone(&store), Arc::clone(&audit)));
        let limiter = Arc::new(RateLimiter::new(
            Arc::new(MemoryCounterStore::new()),
            config.core.rate_limit,
        ));
        let circuits = Arc::new(CircuitRegistry::new(config.core.circuit));
        let lockouts = Arc::new(LockoutGuard::new(Arc::clone(&store), config.core.lockout));

        let identity = Arc::new(match config.identity {
            IdentitySettings::Http {
                ref base_url,
                ref api_key,
            } => IdentityProvider::Http(HttpIdentityProvider::new(
                base_url.clone(),
                api_key.clone(),
            )),
            IdentitySettings::StaticDev => {
                IdentityProvider::Static(StaticIdentityProvider::new())
            }
        });

        let mut webhooks = WebhookProcessor::new(
            Arc::clone(&store),
            Arc::clone(&audit),
            "stripe",
            config.core.webhook_secret.clone(),
            config.core.clock_skew_tolerance_secs,
        );
        register_payment_handlers(&mut webhooks, Arc::clone(&payments));
        let webhooks = Arc::new(webhooks);

        let auth = AuthService::new(
            Arc::clone(&identity),
            Arc::clone(&sessions),
            Arc::clone(&audit),
            Arc::clone(&lockouts),
            Arc::clone(&circuits),
        );

        Ok(Self {
            config,
            store,
            audit,
            sessions,
            authz,
            idempotency,
            payments,
            webhooks,
            limiter,
            circuits,
            lockouts,
            identity,
            auth,
        })
    }

    /// Start the periodic maintenance loop: expired idempotency keys, idle
    /// rate-limit counters, old revoked sessions and audit retention.
    pub fn start_maintenance(&self) {
        let idempotency = Arc::clone(&self.idempotency);
        let limiter = Arc::clone(&self.limiter);
        let sessions = Arc::clone(&self.sessions);
        let audit = Arc::clone(&self.audit);

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(300));
            loop {
                interval.tick().await;
                if let Err(e) = idempotency.cleanup_expired(1000) {
                    tracing::warn!(error = %e, "idempotency cleanup failed");
                }
                limiter.purge_idle();
                if let Err(e) = sessions.purge_revoked(30) {
                    tracing::warn!(error = %e, "session cleanup failed");
                }
                if let Err(e) = audit.purge_expired() {
                    tracing::warn!(error = %e, "audit retention purge failed");
                }
            }
        });
    }
}

/// Wire the payment-gateway webhook events onto the payment state machine.
/// The payload shape is the provider's: `data.object.id` is the external
/// intent, `data.object.metadata.payment_id` carries our payment id.
fn register_payment_handlers(webhooks: &mut WebhookProcessor, payments: Arc<PaymentEngine>) {
    fn payment_ref(event: &WebhookEvent) -> (Option<String>, Option<String>) {
        let object = event.payload.get("data").and_then(|d| d.get("object"));
        let intent_id = object
            .and_then(|o| o.get("id"))
            .and_then(|v| v.as_str())
            .map(String::from);
        let payment_id = object
            .and_then(|o| o.get("metadata"))
            .and_then(|m| m.get("payment_id"))
            .and_then(|v| v.as_str())
            .map(String::from);
        (payment_id, intent_id)
    }

    let on_succeeded = Arc::clone(&payments);
    webhooks.register(
        "payment_intent.succeeded",
        Arc::new(move |event| {
            let (payment_id, intent_id) = payment_ref(event);
            let Some(intent_id) = intent_id else {
                tracing::warn!(webhook_id = %event.id, "succeeded event without intent id");
                return Ok(());
            };
            let Some(payment_id) = payment_id else {
                tracing::warn!(webhook_id = %event.id, "succeeded event without payment reference");
                return Ok(());
            };
            let taken = on_succeeded.complete(&payment_id, &intent_id, None)?;
            if !taken {
                tracing::info!(payment_id, "completion webhook for non-pending payment ignored");
            }
            Ok(())
        }),
    );

    let on_failed = payments;
    webhooks.register(
        "payment_intent.payment_failed",
        Arc::new(move |event| {
            let (payment_id, _) = payment_ref(event);
            let Some(payment_id) = payment_id else {
                tracing::warn!(webhook_id = %event.id, "failed event without payment reference");
                return Ok(());
            };
            let error = event
                .payload
                .get("data")
                .and_then(|d| d.get("object"))
                .and_then(|o| o.get("last_payment_error"));
            let code = error
                .and_then(|e| e.get("code"))
                .and_then(|v| v.as_str())
                .unwrap_or("unknown");
            let message = error
                .and_then(|e| e.get("message"))
                .and_then(|v| v.as_str())
                .unwrap_or("payment failed");
            on_failed.fail(&payment_id, code, message)?;
            Ok(())
        }),
    );
}
