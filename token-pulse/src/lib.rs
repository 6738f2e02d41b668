//! Resilience layer for a rate-limited token metrics polling pipeline.
//!
//! Hot and cold token groups are polled against an external price API
//! through per-dependency circuit breakers and retry policies. Load
//! shedding, trend-based degradation detection, health reporting and
//! deduplicated alerting sit around the polling loop.

pub mod alerting;
pub mod config;
pub mod degradation;
pub mod error;
pub mod health;
pub mod load;
pub mod logging;
pub mod resilience;
pub mod scheduler;
pub mod services;

pub use error::{Error, Result};
