//! Circuit breaker guarding a single named dependency.
//!
//! State transitions:
//! - `Closed` -> `Open` once `failure_threshold` consecutive failures are recorded.
//! - `Open` -> `HalfOpen` lazily, on the first state read after `recovery_timeout`.
//! - `HalfOpen` -> `Closed` after `success_threshold` successful trial calls.
//! - `HalfOpen` -> `Open` on any trial failure.
//!
//! There is no background timer; every public entry point re-evaluates the
//! open deadline before acting.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::{Error, Result};

/// State of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum CircuitState {
    /// Circuit is closed (normal operation).
    Closed,
    /// Circuit is open (failing, rejecting requests).
    Open,
    /// Circuit is half-open (testing if service recovered).
    HalfOpen,
}

/// Configuration for a circuit breaker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// Seconds to stay open before allowing trial calls.
    pub recovery_timeout_secs: u64,
    /// Successful trial calls required to close the circuit.
    pub success_threshold: u32,
    /// Concurrent trial calls allowed while half-open.
    pub half_open_max_calls: u32,
    /// Optional per-call timeout in milliseconds.
    pub call_timeout_ms: Option<u64>,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout_secs: 60,
            success_threshold: 2,
            half_open_max_calls: 1,
            call_timeout_ms: Some(30_000),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_secs(self.recovery_timeout_secs)
    }

    pub fn call_timeout(&self) -> Option<Duration> {
        self.call_timeout_ms.map(Duration::from_millis)
    }

    pub fn validate(&self) -> Result<()> {
        if self.failure_threshold == 0 {
            return Err(Error::config("circuit_breaker.failure_threshold must be > 0"));
        }
        if self.success_threshold == 0 {
            return Err(Error::config("circuit_breaker.success_threshold must be > 0"));
        }
        if self.half_open_max_calls == 0 {
            return Err(Error::config(
                "circuit_breaker.half_open_max_calls must be > 0",
            ));
        }
        if self.call_timeout_ms == Some(0) {
            return Err(Error::config("circuit_breaker.call_timeout_ms must be > 0"));
        }
        Ok(())
    }
}

/// Point-in-time view of a breaker, for operator tooling and health checks.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerStats {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub half_open_calls: u32,
    pub total_calls: u64,
    pub total_successes: u64,
    pub total_failures: u64,
    pub total_timeouts: u64,
    pub total_rejections: u64,
    pub state_changes: u64,
    /// `total_failures / total_calls * 100`.
    pub failure_rate: f64,
    pub opened_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
    /// Time left before an open circuit admits a trial call.
    pub retry_after_ms: Option<u64>,
}

/// Mutable breaker state, guarded by one mutex per breaker.
#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    half_open_calls: u32,
    /// Bumped on every entry into half-open so stale trial slots are ignored.
    half_open_generation: u64,
    next_attempt_at: Option<Instant>,
    opened_at: Option<DateTime<Utc>>,
    last_failure_at: Option<DateTime<Utc>>,
}

impl BreakerState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            half_open_calls: 0,
            half_open_generation: 0,
            next_attempt_at: None,
            opened_at: None,
            last_failure_at: None,
        }
    }
}

enum Admission {
    Closed,
    Trial { generation: u64 },
}

/// Releases a half-open trial slot when the call finishes or is dropped.
struct TrialSlot<'a> {
    breaker: &'a CircuitBreaker,
    generation: Option<u64>,
}

impl Drop for TrialSlot<'_> {
    fn drop(&mut self) {
        if let Some(generation) = self.generation {
            let mut inner = self.breaker.inner.lock();
            if inner.state == CircuitState::HalfOpen && inner.half_open_generation == generation {
                inner.half_open_calls = inner.half_open_calls.saturating_sub(1);
            }
        }
    }
}

/// Circuit breaker for protecting against cascading failures.
pub struct CircuitBreaker {
    name: String,
    config: RwLock<CircuitBreakerConfig>,
    inner: Mutex<BreakerState>,
    total_calls: AtomicU64,
    total_successes: AtomicU64,
    total_failures: AtomicU64,
    total_timeouts: AtomicU64,
    total_rejections: AtomicU64,
    state_changes: AtomicU64,
}

impl CircuitBreaker {
    /// Create a new circuit breaker.
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config: RwLock::new(config),
            inner: Mutex::new(BreakerState::new()),
            total_calls: AtomicU64::new(0),
            total_successes: AtomicU64::new(0),
            total_failures: AtomicU64::new(0),
            total_timeouts: AtomicU64::new(0),
            total_rejections: AtomicU64::new(0),
            state_changes: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> CircuitBreakerConfig {
        self.config.read().clone()
    }

    /// Replace thresholds; the current state and counters are kept.
    pub fn update_config(&self, config: CircuitBreakerConfig) {
        *self.config.write() = config;
        debug!(name = %self.name, "Circuit breaker config updated");
    }

    /// Get the current state, applying a due open -> half-open transition.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock();
        self.transition_if_due(&mut inner);
        inner.state
    }

    /// Check if the circuit would admit a call right now.
    pub fn is_allowed(&self) -> bool {
        let max_trials = self.config.read().half_open_max_calls;
        let mut inner = self.inner.lock();
        self.transition_if_due(&mut inner);
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => inner.half_open_calls < max_trials,
            CircuitState::Open => false,
        }
    }

    /// Run `f` through the breaker.
    ///
    /// Fails fast with [`Error::CircuitOpen`] without invoking `f` while the
    /// circuit is open or all half-open trial slots are taken. A configured
    /// call timeout is recorded as a failure and surfaces as [`Error::Timeout`].
    pub async fn call<T, F, Fut>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let admission = self.try_acquire()?;
        let _slot = TrialSlot {
            breaker: self,
            generation: match admission {
                Admission::Closed => None,
                Admission::Trial { generation } => Some(generation),
            },
        };

        self.total_calls.fetch_add(1, Ordering::Relaxed);
        let call_timeout = self.config.read().call_timeout();

        let result = match call_timeout {
            Some(limit) => match tokio::time::timeout(limit, f()).await {
                Ok(result) => result,
                Err(_) => {
                    self.total_timeouts.fetch_add(1, Ordering::Relaxed);
                    warn!(name = %self.name, timeout_ms = limit.as_millis() as u64, "Circuit breaker call timed out");
                    self.record_failure();
                    return Err(Error::Timeout {
                        name: self.name.clone(),
                        timeout: limit,
                    });
                }
            },
            None => f().await,
        };

        match &result {
            Ok(_) => self.record_success(),
            Err(e) => {
                debug!(name = %self.name, error = %e, "Call through circuit breaker failed");
                self.record_failure();
            }
        }
        result
    }

    /// Record a successful operation.
    pub fn record_success(&self) {
        self.total_successes.fetch_add(1, Ordering::Relaxed);
        let success_threshold = self.config.read().success_threshold;
        let mut inner = self.inner.lock();

        match inner.state {
            CircuitState::Closed => {
                inner.failure_count = 0;
            }
            CircuitState::HalfOpen => {
                inner.success_count += 1;
                if inner.success_count >= success_threshold {
                    self.transition(&mut inner, CircuitState::Closed);
                    info!(name = %self.name, "Circuit breaker closed after successful recovery");
                }
            }
            CircuitState::Open => {
                // A call admitted before the circuit opened finished late.
            }
        }
    }

    /// Record a failed operation.
    pub fn record_failure(&self) {
        self.total_failures.fetch_add(1, Ordering::Relaxed);
        let failure_threshold = self.config.read().failure_threshold;
        let mut inner = self.inner.lock();
        inner.last_failure_at = Some(Utc::now());

        match inner.state {
            CircuitState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= failure_threshold {
                    let failures = inner.failure_count;
                    self.transition(&mut inner, CircuitState::Open);
                    warn!(
                        name = %self.name,
                        failures,
                        "Circuit breaker opened after consecutive failures"
                    );
                }
            }
            CircuitState::HalfOpen => {
                self.transition(&mut inner, CircuitState::Open);
                warn!(name = %self.name, "Circuit breaker reopened after half-open trial failure");
            }
            CircuitState::Open => {}
        }
    }

    /// Reset the circuit breaker to closed state.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        self.transition(&mut inner, CircuitState::Closed);
        inner.last_failure_at = None;
        info!(name = %self.name, "Circuit breaker manually reset");
    }

    /// Force the circuit open, as if the failure threshold had been reached.
    pub fn force_open(&self) {
        let mut inner = self.inner.lock();
        self.transition(&mut inner, CircuitState::Open);
        warn!(name = %self.name, "Circuit breaker manually forced open");
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        let mut inner = self.inner.lock();
        self.transition_if_due(&mut inner);

        let total_calls = self.total_calls.load(Ordering::Relaxed);
        let total_failures = self.total_failures.load(Ordering::Relaxed);
        let failure_rate = if total_calls == 0 {
            0.0
        } else {
            total_failures as f64 / total_calls as f64 * 100.0
        };
        let retry_after_ms = match (inner.state, inner.next_attempt_at) {
            (CircuitState::Open, Some(at)) => {
                Some(at.saturating_duration_since(Instant::now()).as_millis() as u64)
            }
            _ => None,
        };

        CircuitBreakerStats {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            half_open_calls: inner.half_open_calls,
            total_calls,
            total_successes: self.total_successes.load(Ordering::Relaxed),
            total_failures,
            total_timeouts: self.total_timeouts.load(Ordering::Relaxed),
            total_rejections: self.total_rejections.load(Ordering::Relaxed),
            state_changes: self.state_changes.load(Ordering::Relaxed),
            failure_rate,
            opened_at: inner.opened_at,
            last_failure_at: inner.last_failure_at,
            retry_after_ms,
        }
    }

    fn try_acquire(&self) -> Result<Admission> {
        let max_trials = self.config.read().half_open_max_calls;
        let mut inner = self.inner.lock();
        self.transition_if_due(&mut inner);

        let state = inner.state;
        match state {
            CircuitState::Closed => Ok(Admission::Closed),
            CircuitState::HalfOpen if inner.half_open_calls < max_trials => {
                inner.half_open_calls += 1;
                Ok(Admission::Trial {
                    generation: inner.half_open_generation,
                })
            }
            _ => {
                drop(inner);
                self.total_rejections.fetch_add(1, Ordering::Relaxed);
                debug!(name = %self.name, %state, "Circuit breaker rejected call");
                Err(Error::CircuitOpen {
                    name: self.name.clone(),
                    state,
                })
            }
        }
    }

    /// Open -> half-open once the recovery deadline has passed.
    fn transition_if_due(&self, inner: &mut BreakerState) {
        if inner.state == CircuitState::Open
            && let Some(next_attempt_at) = inner.next_attempt_at
            && Instant::now() >= next_attempt_at
        {
            self.transition(inner, CircuitState::HalfOpen);
            debug!(name = %self.name, "Circuit breaker transitioned to half-open state");
        }
    }

    fn transition(&self, inner: &mut BreakerState, to: CircuitState) {
        let from = inner.state;
        inner.state = to;
        inner.success_count = 0;
        inner.half_open_calls = 0;

        match to {
            CircuitState::Open => {
                let recovery = self.config.read().recovery_timeout();
                inner.next_attempt_at = Some(Instant::now() + recovery);
                inner.opened_at = Some(Utc::now());
            }
            CircuitState::HalfOpen => {
                inner.half_open_generation += 1;
            }
            CircuitState::Closed => {
                inner.failure_count = 0;
                inner.next_attempt_at = None;
                inner.opened_at = None;
            }
        }

        if from != to {
            self.state_changes.fetch_add(1, Ordering::Relaxed);
        }
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.inner.lock().state)
            .finish()
    }
}
