//! Configuration reload events.
//!
//! The watcher publishes one event per observed file change; the service
//! container subscribes and pushes the new settings into running components.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::debug;

use super::settings::AppConfig;

/// Top-level configuration sections, in file order.
pub const SECTIONS: [&str; 10] = [
    "logging",
    "circuit_breaker",
    "retry",
    "load",
    "degradation",
    "alerts",
    "scheduler",
    "health",
    "api",
    "tokens",
];

/// Names of the sections that differ between two configurations.
pub fn changed_sections(old: &AppConfig, new: &AppConfig) -> Vec<&'static str> {
    let differs = [
        old.logging != new.logging,
        old.circuit_breaker != new.circuit_breaker,
        old.retry != new.retry,
        old.load != new.load,
        old.degradation != new.degradation,
        old.alerts != new.alerts,
        old.scheduler != new.scheduler,
        old.health != new.health,
        old.api != new.api,
        old.tokens != new.tokens,
    ];
    SECTIONS
        .iter()
        .zip(differs)
        .filter_map(|(name, changed)| changed.then_some(*name))
        .collect()
}

#[derive(Debug, Clone)]
pub enum ConfigUpdateEvent {
    /// A file change passed validation.
    Reloaded {
        config: Arc<AppConfig>,
        changed: Vec<&'static str>,
    },
    /// The file changed but was rejected; the previous configuration stays.
    ReloadFailed { error: String },
}

impl ConfigUpdateEvent {
    pub fn description(&self) -> String {
        match self {
            Self::Reloaded { changed, .. } if changed.is_empty() => {
                "Configuration reloaded (no section changed)".to_string()
            }
            Self::Reloaded { changed, .. } => {
                format!("Configuration reloaded: {}", changed.join(", "))
            }
            Self::ReloadFailed { error } => format!("Configuration rejected: {error}"),
        }
    }

    /// Whether applying this event requires restarting the process.
    ///
    /// The API endpoint and the seeded token lists are read once at startup.
    pub fn requires_restart(&self) -> bool {
        matches!(self, Self::Reloaded { changed, .. }
            if changed.iter().any(|s| matches!(*s, "api" | "tokens")))
    }
}

const DEFAULT_CHANNEL_CAPACITY: usize = 16;

/// Fan-out of [`ConfigUpdateEvent`]s over a tokio broadcast channel.
///
/// Slow subscribers lag rather than block the watcher.
#[derive(Clone)]
pub struct ConfigEventBroadcaster {
    sender: broadcast::Sender<ConfigUpdateEvent>,
}

impl ConfigEventBroadcaster {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            sender: broadcast::channel(capacity.max(1)).0,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConfigUpdateEvent> {
        self.sender.subscribe()
    }

    /// Returns how many subscribers will see the event.
    pub fn publish(&self, event: ConfigUpdateEvent) -> usize {
        debug!(event = %event.description(), "Publishing config event");
        // No subscribers is not an error.
        self.sender.send(event).unwrap_or(0)
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for ConfigEventBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reloaded(config: AppConfig) -> ConfigUpdateEvent {
        let changed = changed_sections(&AppConfig::default(), &config);
        ConfigUpdateEvent::Reloaded {
            config: Arc::new(config),
            changed,
        }
    }

    #[test]
    fn test_changed_sections() {
        let base = AppConfig::default();
        assert!(changed_sections(&base, &base.clone()).is_empty());

        let mut next = base.clone();
        next.retry.max_attempts = 9;
        next.api.timeout_secs = 3;
        assert_eq!(changed_sections(&base, &next), vec!["retry", "api"]);
    }

    #[test]
    fn test_requires_restart() {
        let mut config = AppConfig::default();
        config.circuit_breaker.failure_threshold = 2;
        assert!(!reloaded(config.clone()).requires_restart());

        config.tokens.hot.push("tok-a".to_string());
        let event = reloaded(config);
        assert!(event.requires_restart());
        assert_eq!(
            event.description(),
            "Configuration reloaded: circuit_breaker, tokens"
        );
    }

    #[tokio::test]
    async fn test_publish_fan_out() {
        let broadcaster = ConfigEventBroadcaster::new();
        assert_eq!(
            broadcaster.publish(ConfigUpdateEvent::ReloadFailed {
                error: "bad".to_string()
            }),
            0
        );

        let mut rx1 = broadcaster.subscribe();
        let mut rx2 = broadcaster.clone().subscribe();
        assert_eq!(broadcaster.subscriber_count(), 2);
        assert_eq!(broadcaster.publish(reloaded(AppConfig::default())), 2);

        assert!(matches!(
            rx1.recv().await.unwrap(),
            ConfigUpdateEvent::Reloaded { .. }
        ));
        assert!(matches!(
            rx2.recv().await.unwrap(),
            ConfigUpdateEvent::Reloaded { .. }
        ));
    }
}
