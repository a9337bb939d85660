//! Sliding-window rate limiting over a key/value counter store.
//!
//! A request consumes a slot in up to three counters: per-IP-fingerprint,
//! per-user and per-endpoint. The fingerprint mixes IP, user agent and an
//! optional client header so trivial header spoofing does not dodge the
//! limit; the raw IP is never used alone.
//!
//! The counter store is advisory: if it is unreachable the limiter fails
//! open (allow, warn, count the failure) — authorization stays
//! authoritative and at most one extra authorized request passes during an
//! outage.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;

use crate::crypto::sha256_hex;
use crate::error::StoreError;

/// Rate limit thresholds, requests per window.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitConfig {
    pub ip_per_window: u32,
    pub user_per_window: u32,
    pub login_per_window: u32,
    pub payment_per_window: u32,
    /// Sliding window size in seconds.
    pub window_secs: i64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            ip_per_window: 100,
            user_per_window: 50,
            login_per_window: 10,
            payment_per_window: 5,
            window_secs: 60,
        }
    }
}

/// Result of recording one hit against a key.
#[derive(Debug, Clone, Copy)]
pub struct WindowSample {
    /// Requests in the window, including this one.
    pub count: u64,
    /// Timestamp of the oldest request still in the window.
    pub oldest: Option<i64>,
}

/// Counter storage backend. Implementations must be thread-safe and apply
/// the prune-insert-count-expire sequence atomically per key.
pub trait CounterStore: Send + Sync {
    /// Record a hit at `now` and return the resulting window sample. The
    /// key's entries expire `window_secs + 10` seconds after the last hit.
    fn hit(&self, key: &str, window_secs: i64, now: i64) -> Result<WindowSample, StoreError>;

    /// Drop keys whose TTL has lapsed. Returns the number removed.
    fn purge_idle(&self, now: i64) -> usize;
}

struct WindowEntry {
    hits: Vec<i64>,
    expires_at: i64,
}

/// In-memory counter store backed by DashMap. Per-key atomicity comes from
/// the entry API holding the shard lock across the whole sequence.
pub struct MemoryCounterStore {
    keys: DashMap<String, WindowEntry>,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self {
            keys: DashMap::new(),
        }
    }
}

impl Default for MemoryCounterStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CounterStore for MemoryCounterStore {
    fn hit(&self, key: &str, window_secs: i64, now: i64) -> Result<WindowSample, StoreError> {
        let mut entry = self.keys.entry(key.to_string()).or_insert(WindowEntry {
            hits: Vec::new(),
            expires_at: now + window_secs + 10,
        });

        let cutoff = now - window_secs;
        entry.hits.retain(|&t| t > cutoff);
        entry.hits.push(now);
        entry.expires_at = now + window_secs + 10;

        Ok(WindowSample {
            count: entry.hits.len() as u64,
            oldest: entry.hits.first().copied(),
        })
    }

    fn purge_idle(&self, now: i64) -> usize {
        let before = self.keys.len();
        self.keys.retain(|_, entry| entry.expires_at > now);
        before - self.keys.len()
    }
}

/// Outcome of a rate limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allowed,
    /// Over the limit. `retry_after` is in `[1, window]` seconds.
    Limited { retry_after: i64 },
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed)
    }
}

/// Sliding-window rate limiter.
pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
    config: RateLimitConfig,
    store_failures: AtomicU64,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn CounterStore>, config: RateLimitConfig) -> Self {
        Self {
            store,
            config,
            store_failures: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Counter-store failures observed so far. Exposed so operators can
    /// page on sustained fail-open operation.
    pub fn store_failures(&self) -> u64 {
        self.store_failures.load(Ordering::Relaxed)
    }

    /// Check one counter, recording the hit.
    pub fn check(&self, scope: &str, identifier: &str, limit: u32) -> Decision {
        self.check_at(scope, identifier, limit, Utc::now().timestamp())
    }

    /// Clock-injected variant of [`check`](Self::check).
    pub fn check_at(&self, scope: &str, identifier: &str, limit: u32, now: i64) -> Decision {
        let key = format!("ratelimit:{scope}:{identifier}");
        let window = self.config.window_secs;

        let sample = match self.store.hit(&key, window, now) {
            Ok(sample) => sample,
            Err(e) => {
                // Fail open: availability over throttling.
                self.store_failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(scope, error = %e, "rate limit store unreachable, failing open");
                return Decision::Allowed;
            }
        };

        if sample.count > limit as u64 {
            let retry_after = match sample.oldest {
                Some(oldest) => (window - (now - oldest) + 1).clamp(1, window),
                None => window,
            };
            return Decision::Limited { retry_after };
        }
        Decision::Allowed
    }

    pub fn check_ip(&self, fingerprint: &str) -> Decision {
        self.check("ip", fingerprint, self.config.ip_per_window)
    }

    pub fn check_user(&self, user_id: &str) -> Decision {
        self.check("user", user_id, self.config.user_per_window)
    }

    pub fn check_login(&self, fingerprint: &str) -> Decision {
        self.check("login", fingerprint, self.config.login_per_window)
    }

    pub fn check_payment(&self, user_id: &str) -> Decision {
        self.check("payment", user_id, self.config.payment_per_window)
    }

    /// Drop counter keys whose TTL has lapsed. Run periodically.
    pub fn purge_idle(&self) -> usize {
        self.store.purge_idle(Utc::now().timestamp())
    }
}

/// 128-bit client fingerprint: `sha256(ip | ua | client_header)[..16]` hex.
pub fn client_fingerprint(ip: &str, user_agent: &str, client_header: &str) -> String {
    let data = format!("{ip}|{user_agent}|{client_header}");
    sha256_hex(data.as_bytes())[..16].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingStore;

    impl CounterStore for FailingStore {
        fn hit(&self, _: &str, _: i64, _: i64) -> Result<WindowSample, StoreError> {
            Err(StoreError::Connection("unreachable".to_string()))
        }

        fn purge_idle(&self, _: i64) -> usize {
            0
        }
    }

    fn limiter() -> RateLimiter {
        RateLimiter::new(
            Arc::new(MemoryCounterStore::new()),
            RateLimitConfig::default(),
        )
    }

    #[test]
    fn test_allows_up_to_limit_then_denies() {
        let limiter = limiter();
        let now = 1_700_000_000;

        for _ in 0..10 {
            assert!(limiter.check_at("login", "fp-1", 10, now).is_allowed());
        }
        match limiter.check_at("login", "fp-1", 10, now) {
            Decision::Limited { retry_after } => {
                assert!((1..=60).contains(&retry_after));
            }
            Decision::Allowed => panic!("request over the limit was allowed"),
        }
    }

    #[test]
    fn test_window_slides() {
        let limiter = limiter();
        let now = 1_700_000_000;

        for _ in 0..10 {
            assert!(limiter.check_at("login", "fp-1", 10, now).is_allowed());
        }
        assert!(!limiter.check_at("login", "fp-1", 10, now + 1).is_allowed());
        // All prior hits age out of the window.
        assert!(limiter.check_at("login", "fp-1", 10, now + 61).is_allowed());
    }

    #[test]
    fn test_retry_after_shrinks_as_window_advances() {
        let limiter = limiter();
        let now = 1_700_000_000;

        for _ in 0..10 {
            limiter.check_at("login", "fp-1", 10, now);
        }
        let Decision::Limited { retry_after: r1 } = limiter.check_at("login", "fp-1", 10, now + 5)
        else {
            panic!("expected limited");
        };
        let Decision::Limited { retry_after: r2 } = limiter.check_at("login", "fp-1", 10, now + 30)
        else {
            panic!("expected limited");
        };
        assert!(r2 < r1);
    }

    #[test]
    fn test_independent_keys() {
        let limiter = limiter();
        let now = 1_700_000_000;

        for _ in 0..10 {
            limiter.check_at("login", "fp-1", 10, now);
        }
        assert!(!limiter.check_at("login", "fp-1", 10, now).is_allowed());
        assert!(limiter.check_at("login", "fp-2", 10, now).is_allowed());
        assert!(limiter.check_at("user", "fp-1", 10, now).is_allowed());
    }

    #[test]
    fn test_fails_open_on_store_failure() {
        let limiter = RateLimiter::new(Arc::new(FailingStore), RateLimitConfig::default());
        for _ in 0..20 {
            assert!(limiter.check_at("ip", "fp-1", 1, 1_700_000_000).is_allowed());
        }
        assert_eq!(limiter.store_failures(), 20);
    }

    #[test]
    fn test_purge_idle() {
        let store = MemoryCounterStore::new();
        let now = 1_700_000_000;
        store.hit("ratelimit:ip:a", 60, now).unwrap();
        store.hit("ratelimit:ip:b", 60, now).unwrap();

        assert_eq!(store.purge_idle(now + 10), 0);
        assert_eq!(store.purge_idle(now + 71), 2);
    }

    #[test]
    fn test_fingerprint_mixes_all_signals() {
        let base = client_fingerprint("10.0.0.1", "curl/8", "abc");
        assert_eq!(base.len(), 16);
        assert_ne!(base, client_fingerprint("10.0.0.2", "curl/8", "abc"));
        assert_ne!(base, client_fingerprint("10.0.0.1", "firefox", "abc"));
        assert_ne!(base, client_fingerprint("10.0.0.1", "curl/8", "xyz"));
    }
}
