//! Service layer module.
//!
//! This module provides the service container that wires every component
//! together and owns the background task lifecycle.

pub mod container;

pub use container::{ServiceContainer, ServiceStats};
