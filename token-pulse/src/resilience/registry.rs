//! Registry of named circuit breakers and retry managers.
//!
//! One registry is built at startup and injected wherever a guarded call is
//! made. Instances are created on first use with the registry defaults and
//! live as long as the registry.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info};

use super::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats};
use super::retry::{RetryManager, RetryPolicy, RetryStats};
use crate::Result;

/// Owner of every named breaker and retry manager in the process.
pub struct ResilienceRegistry {
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    retries: RwLock<HashMap<String, Arc<RetryManager>>>,
    breaker_defaults: RwLock<CircuitBreakerConfig>,
    retry_defaults: RwLock<RetryPolicy>,
}

impl ResilienceRegistry {
    pub fn new(breaker_defaults: CircuitBreakerConfig, retry_defaults: RetryPolicy) -> Self {
        Self {
            breakers: RwLock::new(HashMap::new()),
            retries: RwLock::new(HashMap::new()),
            breaker_defaults: RwLock::new(breaker_defaults),
            retry_defaults: RwLock::new(retry_defaults),
        }
    }

    /// Get or create a circuit breaker.
    pub fn breaker(&self, name: &str) -> Arc<CircuitBreaker> {
        {
            let breakers = self.breakers.read();
            if let Some(breaker) = breakers.get(name) {
                return breaker.clone();
            }
        }

        let mut breakers = self.breakers.write();
        breakers
            .entry(name.to_string())
            .or_insert_with(|| {
                debug!(name, "Creating circuit breaker");
                Arc::new(CircuitBreaker::new(name, self.breaker_defaults.read().clone()))
            })
            .clone()
    }

    /// Get or create a retry manager.
    pub fn retry(&self, name: &str) -> Arc<RetryManager> {
        {
            let retries = self.retries.read();
            if let Some(manager) = retries.get(name) {
                return manager.clone();
            }
        }

        let mut retries = self.retries.write();
        retries
            .entry(name.to_string())
            .or_insert_with(|| {
                debug!(name, "Creating retry manager");
                Arc::new(RetryManager::new(name, self.retry_defaults.read().clone()))
            })
            .clone()
    }

    /// Look up an existing breaker without creating one.
    pub fn existing_breaker(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.read().get(name).cloned()
    }

    /// Run `op` with retries nested inside the circuit breaker of the same name.
    ///
    /// The breaker sees one call per retry sequence, so it only records a
    /// failure once the retries are exhausted or the error is non-retryable.
    pub async fn call_guarded<T, F, Fut>(&self, name: &str, op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let breaker = self.breaker(name);
        let retry = self.retry(name);
        breaker.call(|| retry.execute(op)).await
    }

    pub fn breaker_stats(&self) -> Vec<CircuitBreakerStats> {
        let mut stats: Vec<_> = self.breakers.read().values().map(|b| b.stats()).collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }

    pub fn retry_stats(&self) -> Vec<RetryStats> {
        let mut stats: Vec<_> = self.retries.read().values().map(|r| r.stats()).collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }

    /// Force every breaker closed.
    pub fn reset_all(&self) {
        for breaker in self.breakers.read().values() {
            breaker.reset();
        }
    }

    /// Apply reloaded defaults to new and existing instances.
    pub fn apply_config(&self, breaker_config: CircuitBreakerConfig, retry_policy: RetryPolicy) {
        for breaker in self.breakers.read().values() {
            breaker.update_config(breaker_config.clone());
        }
        for manager in self.retries.read().values() {
            manager.set_policy(retry_policy.clone());
        }
        *self.breaker_defaults.write() = breaker_config;
        *self.retry_defaults.write() = retry_policy;
        info!("Resilience settings reloaded");
    }
}

impl Default for ResilienceRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default(), RetryPolicy::default())
    }
}
