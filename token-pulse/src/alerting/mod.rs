//! Alerting: rule-based routing of operator alerts.
//!
//! Producers build an [`Alert`] and hand it to the shared [`AlertManager`],
//! which picks a rule, deduplicates, and delivers to the rule's channels.

pub mod alert;
pub mod channels;
mod manager;
pub mod rules;

pub use alert::{Alert, AlertLevel, alert_key};
pub use channels::{
    AlertChannel, ChannelKind, ConsoleChannel, LogChannel, WebhookChannel,
    WebhookConfig,
};
pub use manager::{AlertHistory, AlertManager, AlertManagerConfig, AlertStatistics, Suppression};
pub use rules::{AlertRule, EscalationRule, ThresholdDirection, ThresholdRule};

#[cfg(test)]
pub(crate) use manager::testing;
