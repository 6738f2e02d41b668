//! Retry policy and retry manager.
//!
//! The policy is an immutable value object describing backoff and error
//! classification. The manager owns one policy at a time, runs operations
//! against it and keeps cumulative statistics. Max-attempts gating lives in
//! the manager, not the policy.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{ErrorKind, RetryClass};
use crate::{Error, Result};

/// Backoff strategy between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum BackoffStrategy {
    Fixed,
    Linear,
    Exponential,
    #[default]
    ExponentialJitter,
}

/// Retry policy for transient errors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first call.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Base delay between attempts in milliseconds.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Maximum delay between attempts in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default)]
    pub strategy: BackoffStrategy,
    /// Multiplier for exponential backoff.
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    /// Fraction of the delay added as random jitter (0.0-1.0).
    #[serde(default = "default_jitter_factor")]
    pub jitter_factor: f64,
    /// Kinds retried when nothing more explicit applies.
    #[serde(default = "default_retryable_kinds")]
    pub retryable_kinds: Vec<ErrorKind>,
    /// Kinds never retried.
    #[serde(default = "default_non_retryable_kinds")]
    pub non_retryable_kinds: Vec<ErrorKind>,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    30000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_jitter_factor() -> f64 {
    0.1
}

fn default_retryable_kinds() -> Vec<ErrorKind> {
    vec![
        ErrorKind::Timeout,
        ErrorKind::Connection,
        ErrorKind::RateLimited,
        ErrorKind::ServerError,
        ErrorKind::Io,
    ]
}

fn default_non_retryable_kinds() -> Vec<ErrorKind> {
    vec![
        ErrorKind::ClientError,
        ErrorKind::MalformedResponse,
        ErrorKind::CircuitOpen,
        ErrorKind::Configuration,
        ErrorKind::Internal,
    ]
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            strategy: BackoffStrategy::default(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter_factor: default_jitter_factor(),
            retryable_kinds: default_retryable_kinds(),
            non_retryable_kinds: default_non_retryable_kinds(),
        }
    }
}

impl RetryPolicy {
    /// Create a retry policy that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Delay to wait after `attempt` (1-based) failed.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.compute_delay(attempt, rand::random::<f64>())
    }

    /// Delay formula with an explicit jitter sample in `[0, 1)`.
    fn compute_delay(&self, attempt: u32, jitter_sample: f64) -> Duration {
        let attempt = attempt.max(1);
        let base = self.base_delay_ms as f64;
        let exponential = || base * self.backoff_multiplier.powi(attempt as i32 - 1);

        let delay_ms = match self.strategy {
            BackoffStrategy::Fixed => base,
            BackoffStrategy::Linear => base * attempt as f64,
            BackoffStrategy::Exponential => exponential(),
            BackoffStrategy::ExponentialJitter => {
                let delay = exponential();
                delay + delay * self.jitter_factor * jitter_sample
            }
        };

        let clamped = delay_ms.clamp(0.0, self.max_delay_ms as f64);
        Duration::from_millis(clamped as u64)
    }

    /// Upper bound of the total time spent sleeping between attempts.
    pub fn max_total_delay(&self) -> Duration {
        (1..self.max_attempts)
            .map(|attempt| self.compute_delay(attempt, 1.0))
            .sum()
    }

    /// Classify an error.
    ///
    /// Precedence: explicit non-retryable error > explicit retryable error >
    /// configured non-retryable kinds > configured retryable kinds > default
    /// heuristic on the error kind.
    pub fn classify(&self, err: &Error) -> RetryClass {
        match err {
            Error::Permanent(_) => return RetryClass::NonRetryable,
            Error::Transient(_) => return RetryClass::Retryable,
            _ => {}
        }

        let kind = err.kind();
        if self.non_retryable_kinds.contains(&kind) {
            return RetryClass::NonRetryable;
        }
        if !self.retryable_kinds.is_empty() {
            return if self.retryable_kinds.contains(&kind) {
                RetryClass::Retryable
            } else {
                RetryClass::NonRetryable
            };
        }

        match kind {
            kind if kind.is_transient() => RetryClass::Retryable,
            ErrorKind::Unknown => RetryClass::Unknown,
            _ => RetryClass::NonRetryable,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(Error::config("retry.max_attempts must be >= 1"));
        }
        if self.base_delay_ms > self.max_delay_ms {
            return Err(Error::config("retry.base_delay_ms must not exceed max_delay_ms"));
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(Error::config("retry.backoff_multiplier must be >= 1.0"));
        }
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(Error::config("retry.jitter_factor must be within [0, 1]"));
        }
        if let Some(kind) = self
            .retryable_kinds
            .iter()
            .find(|k| self.non_retryable_kinds.contains(k))
        {
            return Err(Error::config(format!(
                "retry: error kind '{}' is both retryable and non-retryable",
                kind
            )));
        }
        Ok(())
    }
}

/// Cumulative retry statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RetryStats {
    pub name: String,
    pub total_calls: u64,
    pub successful_calls: u64,
    pub failed_calls: u64,
    /// Attempts beyond the first one, across all calls.
    pub total_retries: u64,
    /// Failures aborted immediately as non-retryable.
    pub non_retryable_failures: u64,
    /// Failures that used every attempt.
    pub exhausted_failures: u64,
    /// Number of calls keyed by the attempts they needed.
    pub attempt_histogram: BTreeMap<u32, u64>,
}

impl RetryStats {
    pub fn success_rate(&self) -> f64 {
        if self.total_calls == 0 {
            100.0
        } else {
            self.successful_calls as f64 / self.total_calls as f64 * 100.0
        }
    }
}

enum Outcome {
    Success,
    NonRetryable,
    Exhausted,
}

/// Runs operations under a retry policy.
pub struct RetryManager {
    name: String,
    policy: RwLock<Arc<RetryPolicy>>,
    stats: Mutex<RetryStats>,
}

impl RetryManager {
    pub fn new(name: impl Into<String>, policy: RetryPolicy) -> Self {
        let name = name.into();
        Self {
            stats: Mutex::new(RetryStats {
                name: name.clone(),
                ..Default::default()
            }),
            name,
            policy: RwLock::new(Arc::new(policy)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn policy(&self) -> Arc<RetryPolicy> {
        self.policy.read().clone()
    }

    /// Swap in a new policy. Calls already running keep the old one.
    pub fn set_policy(&self, policy: RetryPolicy) {
        *self.policy.write() = Arc::new(policy);
    }

    pub fn stats(&self) -> RetryStats {
        self.stats.lock().clone()
    }

    /// Run `op` until it succeeds, fails non-retryably, or attempts run out.
    ///
    /// Backoff sleeps are non-blocking.
    pub async fn execute<T, F, Fut>(&self, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let policy = self.policy();
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match op().await {
                Ok(value) => {
                    self.record(attempt, Outcome::Success);
                    return Ok(value);
                }
                Err(err) => match self.next_delay(&policy, attempt, err) {
                    Ok(delay) => tokio::time::sleep(delay).await,
                    Err((outcome, err)) => {
                        self.record(attempt, outcome);
                        return Err(err);
                    }
                },
            }
        }
    }

    /// Blocking variant of [`execute`](Self::execute) for synchronous callers.
    pub fn execute_blocking<T, F>(&self, mut op: F) -> Result<T>
    where
        F: FnMut() -> Result<T>,
    {
        let policy = self.policy();
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match op() {
                Ok(value) => {
                    self.record(attempt, Outcome::Success);
                    return Ok(value);
                }
                Err(err) => match self.next_delay(&policy, attempt, err) {
                    Ok(delay) => std::thread::sleep(delay),
                    Err((outcome, err)) => {
                        self.record(attempt, outcome);
                        return Err(err);
                    }
                },
            }
        }
    }

    /// Decide what happens after `attempt` failed with `err`.
    fn next_delay(
        &self,
        policy: &RetryPolicy,
        attempt: u32,
        err: Error,
    ) -> std::result::Result<Duration, (Outcome, Error)> {
        if policy.classify(&err) == RetryClass::NonRetryable {
            debug!(name = %self.name, attempt, error = %err, "Non-retryable error, giving up");
            return Err((Outcome::NonRetryable, err));
        }

        if attempt >= policy.max_attempts.max(1) {
            warn!(
                name = %self.name,
                attempts = attempt,
                error = %err,
                "Retry attempts exhausted"
            );
            return Err((
                Outcome::Exhausted,
                Error::MaxRetriesExceeded {
                    name: self.name.clone(),
                    attempts: attempt,
                    source: Box::new(err),
                },
            ));
        }

        let delay = policy.delay_for_attempt(attempt);
        debug!(
            name = %self.name,
            attempt,
            max_attempts = policy.max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "Attempt failed, retrying"
        );
        Ok(delay)
    }

    fn record(&self, attempts: u32, outcome: Outcome) {
        let mut stats = self.stats.lock();
        stats.total_calls += 1;
        stats.total_retries += u64::from(attempts.saturating_sub(1));
        *stats.attempt_histogram.entry(attempts).or_insert(0) += 1;
        match outcome {
            Outcome::Success => stats.successful_calls += 1,
            Outcome::NonRetryable => {
                stats.failed_calls += 1;
                stats.non_retryable_failures += 1;
            }
            Outcome::Exhausted => {
                stats.failed_calls += 1;
                stats.exhausted_failures += 1;
            }
        }
    }
}

impl std::fmt::Debug for RetryManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryManager")
            .field("name", &self.name)
            .field("policy", &self.policy.read())
            .finish()
    }
}
