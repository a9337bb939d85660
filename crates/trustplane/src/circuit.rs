//! Circuit breakers for downstream dependencies.
//!
//! One breaker per named dependency, in-memory and mutex-guarded; each
//! replica learns about a failing dependency independently. Closed passes
//! calls through and counts failures; Open rejects immediately until the
//! reset window elapses; Half-Open permits a bounded number of probes and
//! reverts to Open on the first probe failure.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::config::CircuitConfig;
use crate::error::CoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

struct Inner {
    state: CircuitState,
    failure_count: u32,
    last_failure: Option<Instant>,
    half_open_calls: u32,
}

/// Failure isolator for one named dependency.
pub struct CircuitBreaker {
    name: String,
    config: CircuitConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failure_count: 0,
                last_failure: None,
                half_open_calls: 0,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A poisoned circuit lock means a panic while updating counters;
        // the counters are still usable.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Open -> HalfOpen transition once the reset window has elapsed.
    fn refresh(&self, inner: &mut Inner) {
        if inner.state == CircuitState::Open {
            if let Some(last) = inner.last_failure {
                if last.elapsed() >= self.config.reset_timeout {
                    inner.state = CircuitState::HalfOpen;
                    inner.half_open_calls = 0;
                    tracing::info!(circuit = %self.name, "circuit transitioning to half-open");
                }
            }
        }
    }

    pub fn state(&self) -> CircuitState {
        let mut inner = self.lock();
        self.refresh(&mut inner);
        inner.state
    }

    /// Whether a call may proceed. In Half-Open this consumes one probe slot.
    pub fn try_acquire(&self) -> bool {
        let mut inner = self.lock();
        self.refresh(&mut inner);
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen => {
                if inner.half_open_calls < self.config.half_open_max_calls {
                    inner.half_open_calls += 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.lock();
        if inner.state == CircuitState::HalfOpen {
            inner.state = CircuitState::Closed;
            tracing::info!(circuit = %self.name, "circuit closed after recovery");
        }
        inner.failure_count = 0;
    }

    pub fn record_failure(&self) {
        let mut inner = self.lock();
        inner.failure_count += 1;
        inner.last_failure = Some(Instant::now());

        if inner.state == CircuitState::HalfOpen {
            inner.state = CircuitState::Open;
            tracing::warn!(circuit = %self.name, "circuit re-opened after half-open failure");
        } else if inner.failure_count >= self.config.failure_threshold {
            if inner.state != CircuitState::Open {
                tracing::warn!(
                    circuit = %self.name,
                    failures = inner.failure_count,
                    "circuit opened"
                );
            }
            inner.state = CircuitState::Open;
        }
    }

    /// Run `f` under the breaker: reject with [`CoreError::CircuitOpen`]
    /// when the circuit is not accepting calls, otherwise record the
    /// outcome.
    pub fn call<T, E>(&self, f: impl FnOnce() -> Result<T, E>) -> Result<Result<T, E>, CoreError> {
        if !self.try_acquire() {
            return Err(CoreError::CircuitOpen {
                circuit: self.name.clone(),
            });
        }
        let result = f();
        match &result {
            Ok(_) => self.record_success(),
            Err(_) => self.record_failure(),
        }
        Ok(result)
    }
}

/// Registry of circuit breakers keyed by dependency name.
pub struct CircuitRegistry {
    config: CircuitConfig,
    circuits: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitRegistry {
    pub fn new(config: CircuitConfig) -> Self {
        Self {
            config,
            circuits: Mutex::new(HashMap::new()),
        }
    }

    /// Get or create the breaker for a named dependency.
    pub fn get(&self, name: &str) -> Arc<CircuitBreaker> {
        let mut circuits = self.circuits.lock().unwrap_or_else(|e| e.into_inner());
        circuits
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(name, self.config)))
            .clone()
    }

    /// Snapshot of every breaker's state, for health reporting.
    pub fn states(&self) -> Vec<(String, CircuitState)> {
        let circuits = self.circuits.lock().unwrap_or_else(|e| e.into_inner());
        circuits
            .iter()
            .map(|(name, breaker)| (name.clone(), breaker.state()))
            .collect()
    }
}
