//! Security and consistency core for a multi-tenant backend platform.
//!
//! Enforces *who may act, exactly once, on which team's resources, with
//! auditable, tamper-evident history*. Five tightly coupled engines:
//!
//! - [`session`] — per-request session validity, decoupled from token expiry
//! - [`authz`] — team-boundary and role-hierarchy checks at query time
//! - [`idempotency`] — exactly-once execution of state-changing requests
//! - [`payments`] — serializable payment state machine with retry
//! - [`audit`] — append-only, HMAC-signed, integrity-verifiable event log
//!
//! Supporting infrastructure participates directly in the security contract:
//! [`ratelimit`] (sliding-window counters), [`circuit`] (per-dependency
//! failure isolation), [`webhook`] (signature verification and dedup) and
//! [`lockout`] (failed-login throttling).
//!
//! All persistent engines write through [`store`], which provides a bounded
//! connection pool, per-operation timeouts, isolation-level transactions and
//! serialization-failure signalling so callers can retry.

pub mod audit;
pub mod authz;
pub mod circuit;
pub mod config;
pub mod crypto;
pub mod error;
pub mod idempotency;
pub mod lockout;
pub mod payments;
pub mod ratelimit;
pub mod session;
pub mod store;
pub mod webhook;

pub use audit::{ActorType, AuditEntry, AuditLog, EventType, NewEvent};
pub use authz::{Authorizer, AuthzContext, Role, TeamMembership};
pub use circuit::{CircuitBreaker, CircuitRegistry, CircuitState};
pub use config::{ConfigError, CoreConfig};
pub use error::{CoreError, StoreError};
pub use idempotency::{IdempotencyEngine, IdempotencyStatus};
pub use lockout::LockoutGuard;
pub use payments::{NewPayment, Payment, PaymentEngine, PaymentStatus};
pub use ratelimit::{CounterStore, Decision, MemoryCounterStore, RateLimiter};
pub use session::{RevocationReason, Session, SessionStore};
pub use store::{IsolationLevel, Store, TxOptions};
pub use webhook::{WebhookEvent, WebhookOutcome, WebhookProcessor};
