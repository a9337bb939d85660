//! Core configuration from environment variables.
//!
//! Secrets are loaded once at startup and frozen. Required variables
//! hard-fail with [`ConfigError::MissingRequired`] — better to crash at
//! startup than run unsigned in production.

use std::env;
use std::time::Duration;

use crate::ratelimit::RateLimitConfig;
use crate::store::StoreConfig;

/// Audit log settings.
#[derive(Clone)]
pub struct AuditConfig {
    /// HMAC key for signing audit entries.
    pub hmac_secret: Vec<u8>,
    /// Online retention window; older entries are handed to cold storage.
    pub hot_retention_days: i64,
}

/// Circuit breaker defaults applied to every named dependency.
#[derive(Debug, Clone, Copy)]
pub struct CircuitConfig {
    pub failure_threshold: u32,
    pub reset_timeout: Duration,
    pub half_open_max_calls: u32,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
            half_open_max_calls: 1,
        }
    }
}

/// Account lockout thresholds.
#[derive(Debug, Clone, Copy)]
pub struct LockoutConfig {
    pub max_failed_attempts: u32,
    pub lockout_duration_minutes: i64,
}

impl Default for LockoutConfig {
    fn default() -> Self {
        Self {
            max_failed_attempts: 5,
            lockout_duration_minutes: 15,
        }
    }
}

/// Configuration for the core engines.
#[derive(Clone)]
pub struct CoreConfig {
    pub store: StoreConfig,
    pub rate_limit: RateLimitConfig,
    pub circuit: CircuitConfig,
    pub lockout: LockoutConfig,
    pub audit: AuditConfig,
    /// HMAC key for signed opaque cursors.
    pub cursor_secret: Vec<u8>,
    /// Shared secret for inbound webhook signatures.
    pub webhook_secret: Vec<u8>,
    /// Accepted clock skew for webhook timestamps, seconds.
    pub clock_skew_tolerance_secs: i64,
    /// Idempotency record lifetime, hours.
    pub idempotency_ttl_hours: i64,
}

impl std::fmt::Debug for CoreConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoreConfig")
            .field("store_path", &self.store.path)
            .field("rate_limit", &self.rate_limit)
            .field("circuit", &self.circuit)
            .field("lockout", &self.lockout)
            .field("audit_hmac_secret", &"[REDACTED]")
            .field("cursor_secret", &"[REDACTED]")
            .field("webhook_secret", &"[REDACTED]")
            .field("clock_skew_tolerance_secs", &self.clock_skew_tolerance_secs)
            .field("idempotency_ttl_hours", &self.idempotency_ttl_hours)
            .finish()
    }
}

impl CoreConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let store = StoreConfig::at(
            env::var("DATABASE_PATH").unwrap_or_else(|_| "./trustplane.db".to_string()),
        );

        let audit_secret = required_secret("AUDIT_HMAC_SECRET")?;
        let cursor_secret = required_secret("CURSOR_HMAC_SECRET")?;
        let webhook_secret = required_secret("WEBHOOK_SECRET")?;

        let clock_skew_tolerance_secs = env::var("CLOCK_SKEW_TOLERANCE_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(300);

        let idempotency_ttl_hours = env::var("IDEMPOTENCY_TTL_HOURS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(48);

        Ok(Self {
            store,
            rate_limit: RateLimitConfig::default(),
            circuit: CircuitConfig::default(),
            lockout: LockoutConfig::default(),
            audit: AuditConfig {
                hmac_secret: audit_secret,
                hot_retention_days: 90,
            },
            cursor_secret,
            webhook_secret,
            clock_skew_tolerance_secs,
            idempotency_ttl_hours,
        })
    }

    /// Fixed secrets and an in-memory store path, for tests.
    pub fn for_tests() -> Self {
        Self {
            store: StoreConfig::default(),
            rate_limit: RateLimitConfig::default(),
            circuit: CircuitConfig::default(),
            lockout: LockoutConfig::default(),
            audit: AuditConfig {
                hmac_secret: b"test-audit-secret-test-audit-secret".to_vec(),
                hot_retention_days: 90,
            },
            cursor_secret: b"test-cursor-secret-test-cursor-secret".to_vec(),
            webhook_secret: b"test-webhook-secret-test-webhook-secret".to_vec(),
            clock_skew_tolerance_secs: 300,
            idempotency_ttl_hours: 48,
        }
    }
}

fn required_secret(name: &'static str) -> Result<Vec<u8>, ConfigError> {
    let value = env::var(name).map_err(|_| ConfigError::MissingRequired(name))?;
    if value.is_empty() {
        return Err(ConfigError::MissingRequired(name));
    }
    if value.len() < 32 {
        tracing::warn!(
            "{name} is short ({} bytes, 32 recommended) — use `openssl rand -hex 32` to generate a secure secret",
            value.len()
        );
    }
    Ok(value.into_bytes())
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingRequired(&'static str),

    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, String),
}
