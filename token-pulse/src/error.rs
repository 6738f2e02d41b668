//! Application-wide error types.
//!
//! Every failure that crosses a component boundary is an [`Error`]. The retry
//! layer never inspects concrete variants directly; it works on the closed
//! [`ErrorKind`] tag returned by [`Error::kind`].

use std::time::Duration;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use thiserror::Error;

use crate::resilience::CircuitState;

/// Application-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Application-wide error type.
#[derive(Error, Debug)]
pub enum Error {
    /// The call was not attempted because the circuit is open.
    #[error("Circuit breaker '{name}' is {state}, call rejected")]
    CircuitOpen { name: String, state: CircuitState },

    #[error("Call through '{name}' timed out after {timeout:?}")]
    Timeout { name: String, timeout: Duration },

    #[error("Max retries exceeded for '{name}' after {attempts} attempts: {source}")]
    MaxRetriesExceeded {
        name: String,
        attempts: u32,
        #[source]
        source: Box<Error>,
    },

    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    /// Explicitly retryable failure, regardless of retry policy lists.
    #[error("Transient error: {0}")]
    Transient(String),

    /// Explicitly non-retryable failure, regardless of retry policy lists.
    #[error("Permanent error: {0}")]
    Permanent(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::Permanent(msg.into())
    }

    /// Closed classification tag used for retry decisions and log fields.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            Error::Timeout { .. } => ErrorKind::Timeout,
            Error::MaxRetriesExceeded { source, .. } => source.kind(),
            Error::Fetch(e) => e.kind,
            Error::Transient(_) | Error::Permanent(_) | Error::Other(_) => ErrorKind::Unknown,
            Error::Configuration(_) | Error::ConfigParse(_) => ErrorKind::Configuration,
            Error::Validation(_) | Error::Serialization(_) => ErrorKind::MalformedResponse,
            Error::Io(e) => match e.kind() {
                std::io::ErrorKind::TimedOut => ErrorKind::Timeout,
                std::io::ErrorKind::ConnectionRefused
                | std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::ConnectionAborted
                | std::io::ErrorKind::NotConnected
                | std::io::ErrorKind::BrokenPipe => ErrorKind::Connection,
                _ => ErrorKind::Io,
            },
        }
    }

    /// True when the call was never attempted because a breaker rejected it.
    ///
    /// Callers use this to fall back to cached data instead of treating the
    /// result as a real dependency failure.
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Error::CircuitOpen { .. })
    }
}

/// Closed set of error kinds understood by the retry classifier.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ErrorKind {
    Timeout,
    Connection,
    /// HTTP 429.
    RateLimited,
    /// HTTP 5xx.
    ServerError,
    /// HTTP 4xx other than 404 and 429.
    ClientError,
    MalformedResponse,
    CircuitOpen,
    Configuration,
    /// Programming errors and invariant violations.
    Internal,
    Io,
    Unknown,
}

impl ErrorKind {
    /// Default heuristic: connection, timeout and OS-level failures are transient.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            ErrorKind::Timeout
                | ErrorKind::Connection
                | ErrorKind::RateLimited
                | ErrorKind::ServerError
                | ErrorKind::Io
        )
    }
}

/// Result of classifying an error for retry purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryClass {
    Retryable,
    NonRetryable,
    /// Nothing matched; the retry manager treats this as retryable.
    Unknown,
}

/// Typed failure surfaced by the external price API client.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{kind} fetching '{key}': {message}")]
pub struct FetchError {
    pub kind: ErrorKind,
    pub key: String,
    pub message: String,
    /// HTTP status, when the failure came from a response.
    pub status: Option<u16>,
}

impl FetchError {
    pub fn new(kind: ErrorKind, key: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            key: key.into(),
            message: message.into(),
            status: None,
        }
    }

    /// Build an error from a non-success HTTP status.
    ///
    /// Returns `None` for statuses that are not errors: 2xx and 404, the
    /// latter being a valid empty result for the price API.
    pub fn from_status(key: &str, status: u16, body: &str) -> Option<Self> {
        let kind = match status {
            200..=299 | 404 => return None,
            429 => ErrorKind::RateLimited,
            500..=599 => ErrorKind::ServerError,
            400..=499 => ErrorKind::ClientError,
            _ => ErrorKind::Unknown,
        };
        let mut message = format!("HTTP {}", status);
        if !body.is_empty() {
            let snippet: String = body.chars().take(200).collect();
            message.push_str(": ");
            message.push_str(&snippet);
        }
        Some(Self {
            kind,
            key: key.to_string(),
            message,
            status: Some(status),
        })
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_transient()
    }
}
