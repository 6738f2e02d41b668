//! Resilience primitives for calls to flaky dependencies.
//!
//! - [`CircuitBreaker`]: stops calling a failing dependency for a cool-down period
//! - [`RetryManager`]: retries transient failures with backoff
//! - [`ResilienceRegistry`]: named instances, composed retry-inside-breaker
//!
//! # Example
//!
//! ```ignore
//! let registry = ResilienceRegistry::default();
//! let pairs = registry
//!     .call_guarded("price_api", || fetcher.fetch(token))
//!     .await?;
//! ```

mod circuit_breaker;
mod registry;
mod retry;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats, CircuitState};
pub use registry::ResilienceRegistry;
pub use retry::{BackoffStrategy, RetryManager, RetryPolicy, RetryStats};
