//! Alert value object.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use strum::{Display, EnumString};
use uuid::Uuid;

/// Severity of an alert, ordered from least to most severe.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    Serialize,
    Deserialize,
    Display,
    EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum AlertLevel {
    #[default]
    Info,
    Warning,
    Error,
    Critical,
}

/// An alert raised by a component.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub level: AlertLevel,
    pub message: String,
    /// Dotted component path, e.g. `circuit_breaker.price_api`.
    pub component: String,
    pub timestamp: DateTime<Utc>,
    pub correlation_id: String,
    #[serde(default)]
    pub context: BTreeMap<String, Value>,
}

impl Alert {
    pub fn new(level: AlertLevel, component: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
            component: component.into(),
            timestamp: Utc::now(),
            correlation_id: Uuid::new_v4().to_string(),
            context: BTreeMap::new(),
        }
    }

    pub fn info(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(AlertLevel::Info, component, message)
    }

    pub fn warning(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(AlertLevel::Warning, component, message)
    }

    pub fn error(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(AlertLevel::Error, component, message)
    }

    pub fn critical(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(AlertLevel::Critical, component, message)
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = id.into();
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Deduplication key of this alert.
    pub fn dedup_key(&self) -> String {
        alert_key(&self.component, self.level, &self.message)
    }
}

/// Stable hash of (component, level, message).
pub fn alert_key(component: &str, level: AlertLevel, message: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(component.as_bytes());
    hasher.update([0u8]);
    hasher.update(level.to_string().as_bytes());
    hasher.update([0u8]);
    hasher.update(message.as_bytes());
    hex::encode(&hasher.finalize()[..16])
}
