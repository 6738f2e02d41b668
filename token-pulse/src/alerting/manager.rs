//! Alert routing, deduplication, suppression and escalation.
//!
//! Every alert flows through [`AlertManager::send`]:
//!
//! 1. pick the most specific [`AlertRule`] for the component and level
//! 2. check manual suppression
//! 3. count the occurrence against escalation rules
//! 4. pick the rule's channels that accept the alert
//! 5. claim the history slot for the alert key, enforcing cooldown and the
//!    hourly frequency cap
//! 6. deliver to those channels
//!
//! An escalation synthesizes a second, more severe alert that goes through
//! the same pipeline. Unmatched and manually suppressed alerts never count
//! toward escalation; alerts held back by cooldown do.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::alert::{Alert, AlertLevel, alert_key};
use super::channels::{AlertChannel, ChannelKind};
use super::rules::{
    AlertRule, EscalationRule, ThresholdRule, default_escalation_rules, default_rules,
    default_threshold_rules, select_rule, wildcard_match,
};
use crate::Result;

/// Rule sets driving the manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertManagerConfig {
    pub rules: Vec<AlertRule>,
    pub escalation_rules: Vec<EscalationRule>,
    pub threshold_rules: Vec<ThresholdRule>,
}

impl Default for AlertManagerConfig {
    fn default() -> Self {
        Self {
            rules: default_rules(),
            escalation_rules: default_escalation_rules(),
            threshold_rules: default_threshold_rules(),
        }
    }
}

impl AlertManagerConfig {
    pub fn validate(&self) -> Result<()> {
        for rule in &self.rules {
            rule.validate()?;
        }
        for rule in &self.escalation_rules {
            rule.validate()?;
        }
        for rule in &self.threshold_rules {
            rule.validate()?;
        }
        Ok(())
    }
}

/// Delivery history of one deduplicated alert key.
#[derive(Debug, Clone, Serialize)]
pub struct AlertHistory {
    pub key: String,
    pub component: String,
    pub level: AlertLevel,
    pub message: String,
    pub first_occurrence: DateTime<Utc>,
    pub last_occurrence: DateTime<Utc>,
    pub last_sent: Option<DateTime<Utc>>,
    pub count_last_hour: u32,
    /// Number of deliveries.
    pub total_count: u64,
    /// Number of sends, including suppressed ones.
    pub occurrences: u64,
}

impl AlertHistory {
    fn new(key: String, alert: &Alert, now: DateTime<Utc>) -> Self {
        Self {
            key,
            component: alert.component.clone(),
            level: alert.level,
            message: alert.message.clone(),
            first_occurrence: now,
            last_occurrence: now,
            last_sent: None,
            count_last_hour: 0,
            total_count: 0,
            occurrences: 0,
        }
    }
}

/// Manual suppression entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Suppression {
    pub component: String,
    pub level: AlertLevel,
    pub message_pattern: String,
}

impl Suppression {
    fn matches(&self, alert: &Alert) -> bool {
        self.level == alert.level
            && wildcard_match(&self.component, &alert.component)
            && wildcard_match(&self.message_pattern, &alert.message)
    }
}

#[derive(Debug, Default)]
struct EscalationState {
    occurrences: VecDeque<DateTime<Utc>>,
    last_escalation: Option<DateTime<Utc>>,
}

/// Why an alert was not delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    Deliver,
    Cooldown,
    Frequency,
    /// No registered channel takes the alert; the cooldown slot stays free.
    NoChannel,
}

/// Snapshot of alert manager counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AlertStatistics {
    pub total_received: u64,
    pub total_delivered: u64,
    pub suppressed_cooldown: u64,
    pub suppressed_frequency: u64,
    pub suppressed_manual: u64,
    pub dropped_no_rule: u64,
    /// Matched a rule but no enabled channel accepted the alert.
    pub dropped_no_channel: u64,
    pub escalations: u64,
    pub channel_failures: u64,
    pub by_level: BTreeMap<AlertLevel, u64>,
    pub history_size: usize,
    pub active_suppressions: usize,
}

#[derive(Default)]
struct Counters {
    received: AtomicU64,
    delivered: AtomicU64,
    suppressed_cooldown: AtomicU64,
    suppressed_frequency: AtomicU64,
    suppressed_manual: AtomicU64,
    dropped_no_rule: AtomicU64,
    dropped_no_channel: AtomicU64,
    escalations: AtomicU64,
    channel_failures: AtomicU64,
}

/// Routes alerts to channels with deduplication and escalation.
pub struct AlertManager {
    rules: RwLock<Vec<AlertRule>>,
    escalation_rules: RwLock<Vec<EscalationRule>>,
    threshold_rules: RwLock<Vec<ThresholdRule>>,
    channels: RwLock<HashMap<ChannelKind, Arc<dyn AlertChannel>>>,
    history: Mutex<HashMap<String, AlertHistory>>,
    suppressions: RwLock<HashMap<String, Suppression>>,
    escalations: Mutex<HashMap<(String, AlertLevel), EscalationState>>,
    counters: Counters,
    by_level: DashMap<AlertLevel, AtomicU64>,
}

impl AlertManager {
    pub fn new(config: AlertManagerConfig) -> Self {
        Self {
            rules: RwLock::new(config.rules),
            escalation_rules: RwLock::new(config.escalation_rules),
            threshold_rules: RwLock::new(config.threshold_rules),
            channels: RwLock::new(HashMap::new()),
            history: Mutex::new(HashMap::new()),
            suppressions: RwLock::new(HashMap::new()),
            escalations: Mutex::new(HashMap::new()),
            counters: Counters::default(),
            by_level: DashMap::new(),
        }
    }

    /// Register a delivery channel, replacing any channel of the same kind.
    pub fn register_channel(&self, channel: Arc<dyn AlertChannel>) {
        let kind = channel.kind();
        self.channels.write().insert(kind, channel);
        debug!(channel = %kind, "Registered alert channel");
    }

    pub fn with_channel(self, channel: Arc<dyn AlertChannel>) -> Self {
        self.register_channel(channel);
        self
    }

    /// Replace all rule sets, keeping history and suppressions.
    pub fn apply_config(&self, config: AlertManagerConfig) {
        *self.rules.write() = config.rules;
        *self.escalation_rules.write() = config.escalation_rules;
        *self.threshold_rules.write() = config.threshold_rules;
        info!("Alert rules reloaded");
    }

    pub fn rules(&self) -> Vec<AlertRule> {
        self.rules.read().clone()
    }

    /// Send an alert. Returns true iff at least one channel delivered it.
    pub async fn send(&self, alert: Alert) -> bool {
        self.send_at(alert, Utc::now()).await
    }

    /// Same as [`send`](Self::send) with an explicit current time.
    pub async fn send_at(&self, alert: Alert, now: DateTime<Utc>) -> bool {
        let Some(rule) = self.admit(&alert) else {
            return false;
        };
        let escalated = self.check_escalation(&alert, now);
        let mut delivered = self.dispatch(alert, &rule, now).await;
        if let Some(escalated) = escalated
            && let Some(rule) = self.admit(&escalated)
        {
            delivered |= self.dispatch(escalated, &rule, now).await;
        }
        delivered
    }

    /// Count the alert and resolve its rule. `None` when no rule matches or
    /// the alert is manually suppressed.
    fn admit(&self, alert: &Alert) -> Option<AlertRule> {
        self.counters.received.fetch_add(1, Ordering::Relaxed);
        self.by_level
            .entry(alert.level)
            .or_default()
            .fetch_add(1, Ordering::Relaxed);

        let Some(rule) = select_rule(&self.rules.read(), alert).cloned() else {
            self.counters.dropped_no_rule.fetch_add(1, Ordering::Relaxed);
            debug!(component = %alert.component, level = %alert.level, "No alert rule matched, dropping");
            return None;
        };

        if self.is_suppressed(&alert.dedup_key(), alert) {
            self.counters.suppressed_manual.fetch_add(1, Ordering::Relaxed);
            debug!(component = %alert.component, "Alert manually suppressed");
            return None;
        }
        Some(rule)
    }

    async fn dispatch(&self, alert: Alert, rule: &AlertRule, now: DateTime<Utc>) -> bool {
        let targets: Vec<Arc<dyn AlertChannel>> = {
            let channels = self.channels.read();
            rule.channels
                .iter()
                .filter_map(|kind| channels.get(kind).cloned())
                .filter(|channel| channel.is_enabled() && channel.accepts(&alert))
                .collect()
        };

        let key = alert.dedup_key();
        match self.claim(&key, &alert, rule, now, !targets.is_empty()) {
            Verdict::Deliver => {}
            Verdict::Cooldown => {
                self.counters.suppressed_cooldown.fetch_add(1, Ordering::Relaxed);
                debug!(component = %alert.component, "Alert suppressed by cooldown");
                return false;
            }
            Verdict::Frequency => {
                self.counters.suppressed_frequency.fetch_add(1, Ordering::Relaxed);
                debug!(component = %alert.component, "Alert suppressed by hourly frequency cap");
                return false;
            }
            Verdict::NoChannel => {
                self.counters.dropped_no_channel.fetch_add(1, Ordering::Relaxed);
                debug!(component = %alert.component, level = %alert.level, "No channel accepts alert");
                return false;
            }
        }

        let mut delivered = 0usize;
        for channel in targets {
            match channel.deliver(&alert).await {
                Ok(()) => delivered += 1,
                Err(e) => {
                    self.counters.channel_failures.fetch_add(1, Ordering::Relaxed);
                    warn!(channel = %channel.kind(), error = %e, "Alert delivery failed");
                }
            }
        }

        if delivered > 0 {
            self.counters.delivered.fetch_add(1, Ordering::Relaxed);
        }
        delivered > 0
    }

    /// Decide and record delivery under the history lock.
    fn claim(
        &self,
        key: &str,
        alert: &Alert,
        rule: &AlertRule,
        now: DateTime<Utc>,
        deliverable: bool,
    ) -> Verdict {
        let mut history = self.history.lock();
        let entry = history
            .entry(key.to_string())
            .or_insert_with(|| AlertHistory::new(key.to_string(), alert, now));
        entry.occurrences += 1;
        entry.last_occurrence = now;
        if !deliverable {
            return Verdict::NoChannel;
        }

        if let Some(last_sent) = entry.last_sent {
            let since = now - last_sent;
            if since > Duration::hours(1) {
                entry.count_last_hour = 0;
            }
            if since < Duration::minutes(rule.cooldown_minutes as i64) {
                return Verdict::Cooldown;
            }
        }
        if entry.count_last_hour >= rule.max_frequency_per_hour {
            return Verdict::Frequency;
        }

        entry.last_sent = Some(now);
        entry.count_last_hour += 1;
        entry.total_count += 1;
        Verdict::Deliver
    }

    fn check_escalation(&self, alert: &Alert, now: DateTime<Utc>) -> Option<Alert> {
        let rule = self
            .escalation_rules
            .read()
            .iter()
            .find(|rule| rule.applies_to(alert))
            .cloned()?;

        let window = Duration::minutes(rule.time_window_minutes as i64);
        let mut escalations = self.escalations.lock();
        let state = escalations
            .entry((alert.component.clone(), alert.level))
            .or_default();

        state.occurrences.push_back(now);
        while state
            .occurrences
            .front()
            .is_some_and(|ts| now - *ts > window)
        {
            state.occurrences.pop_front();
        }

        let count = state.occurrences.len();
        if count < rule.failure_count_threshold as usize {
            return None;
        }
        let cooled_down = state.last_escalation.is_none_or(|last| {
            now - last >= Duration::minutes(rule.escalation_cooldown_minutes as i64)
        });
        if !cooled_down {
            return None;
        }

        state.last_escalation = Some(now);
        state.occurrences.clear();
        drop(escalations);

        self.counters.escalations.fetch_add(1, Ordering::Relaxed);
        info!(
            component = %alert.component,
            from = %alert.level,
            to = %rule.escalated_level,
            count,
            "Escalating repeated alert"
        );

        Some(
            Alert::new(
                rule.escalated_level,
                alert.component.clone(),
                format!(
                    "{} (repeated {} times in {} minutes)",
                    alert.message, count, rule.time_window_minutes
                ),
            )
            .with_timestamp(now)
            .with_correlation_id(alert.correlation_id.clone())
            .with_context("escalated_from", alert.level.to_string())
            .with_context("repeat_count", count as u64),
        )
    }

    /// The alert the threshold rules raise for a metric value, if any.
    ///
    /// When several rules apply, the most severe crossing wins.
    pub fn evaluate_threshold(&self, component: &str, metric: &str, value: f64) -> Option<Alert> {
        let (level, threshold) = self
            .threshold_rules
            .read()
            .iter()
            .filter(|rule| rule.applies_to(component, metric))
            .filter_map(|rule| rule.evaluate(value).map(|level| (level, rule.threshold_for(level))))
            .max_by_key(|(level, _)| *level)?;

        Some(
            Alert::new(
                level,
                component,
                format!("{metric} crossed {level} threshold"),
            )
            .with_context("metric", metric)
            .with_context("value", value)
            .with_context("threshold", threshold),
        )
    }

    /// Evaluate threshold rules for a metric value and send any resulting alert.
    ///
    /// Returns true iff an alert was delivered.
    pub async fn check_threshold(&self, component: &str, metric: &str, value: f64) -> bool {
        match self.evaluate_threshold(component, metric, value) {
            Some(alert) => self.send(alert).await,
            None => false,
        }
    }

    /// Suppress alerts matching (component, level, message pattern).
    ///
    /// Component and message may contain `*` wildcards.
    pub fn suppress(&self, component: &str, level: AlertLevel, message_pattern: &str) {
        let key = alert_key(component, level, message_pattern);
        self.suppressions.write().insert(
            key,
            Suppression {
                component: component.to_string(),
                level,
                message_pattern: message_pattern.to_string(),
            },
        );
        info!(component, %level, message_pattern, "Alert suppressed");
    }

    /// Remove a suppression. Returns true if it existed.
    pub fn unsuppress(&self, component: &str, level: AlertLevel, message_pattern: &str) -> bool {
        let key = alert_key(component, level, message_pattern);
        let removed = self.suppressions.write().remove(&key).is_some();
        if removed {
            info!(component, %level, message_pattern, "Alert suppression lifted");
        }
        removed
    }

    pub fn suppressions(&self) -> Vec<Suppression> {
        self.suppressions.read().values().cloned().collect()
    }

    fn is_suppressed(&self, key: &str, alert: &Alert) -> bool {
        let suppressions = self.suppressions.read();
        suppressions.contains_key(key) || suppressions.values().any(|s| s.matches(alert))
    }

    /// Drop history entries not seen for `max_age`. Returns the number removed.
    pub fn cleanup_history(&self, max_age: Duration) -> usize {
        self.cleanup_history_at(max_age, Utc::now())
    }

    pub fn cleanup_history_at(&self, max_age: Duration, now: DateTime<Utc>) -> usize {
        let cutoff = now - max_age;

        let removed = {
            let mut history = self.history.lock();
            let before = history.len();
            history.retain(|_, entry| entry.last_occurrence >= cutoff);
            before - history.len()
        };

        self.escalations.lock().retain(|_, state| {
            state.occurrences.back().is_some_and(|ts| *ts >= cutoff)
                || state.last_escalation.is_some_and(|ts| ts >= cutoff)
        });

        if removed > 0 {
            debug!(removed, "Cleaned up alert history");
        }
        removed
    }

    pub fn history_entry(&self, key: &str) -> Option<AlertHistory> {
        self.history.lock().get(key).cloned()
    }

    pub fn get_statistics(&self) -> AlertStatistics {
        let by_level = self
            .by_level
            .iter()
            .map(|entry| (*entry.key(), entry.value().load(Ordering::Relaxed)))
            .collect();

        AlertStatistics {
            total_received: self.counters.received.load(Ordering::Relaxed),
            total_delivered: self.counters.delivered.load(Ordering::Relaxed),
            suppressed_cooldown: self.counters.suppressed_cooldown.load(Ordering::Relaxed),
            suppressed_frequency: self.counters.suppressed_frequency.load(Ordering::Relaxed),
            suppressed_manual: self.counters.suppressed_manual.load(Ordering::Relaxed),
            dropped_no_rule: self.counters.dropped_no_rule.load(Ordering::Relaxed),
            dropped_no_channel: self.counters.dropped_no_channel.load(Ordering::Relaxed),
            escalations: self.counters.escalations.load(Ordering::Relaxed),
            channel_failures: self.counters.channel_failures.load(Ordering::Relaxed),
            by_level,
            history_size: self.history.lock().len(),
            active_suppressions: self.suppressions.read().len(),
        }
    }
}

impl Default for AlertManager {
    fn default() -> Self {
        Self::new(AlertManagerConfig::default())
    }
}


#[cfg(test)]
mod tests {
    use super::testing::RecordingChannel;
    use super::*;
    use crate::alerting::channels::{WebhookChannel, WebhookConfig};
    use crate::alerting::rules::ThresholdDirection;

    fn manager(rules: Vec<AlertRule>) -> (AlertManager, Arc<RecordingChannel>) {
        let channel = RecordingChannel::new(ChannelKind::Log);
        let manager = AlertManager::new(AlertManagerConfig {
            rules,
            escalation_rules: Vec::new(),
            threshold_rules: vec![ThresholdRule {
                component_pattern: "api.*".to_string(),
                metric: "error_rate".to_string(),
                warning: 10.0,
                critical: 50.0,
                direction: ThresholdDirection::Above,
            }],
        })
        .with_channel(channel.clone());
        (manager, channel)
    }

    fn catch_all(cooldown: u64, max_per_hour: u32) -> Vec<AlertRule> {
        vec![
            AlertRule::new("*", AlertLevel::Info)
                .with_cooldown_minutes(cooldown)
                .with_max_frequency_per_hour(max_per_hour),
        ]
    }

    #[tokio::test]
    async fn test_identical_alert_within_cooldown_delivered_once() {
        let (manager, channel) = manager(catch_all(5, 10));
        let now = Utc::now();

        assert!(manager.send_at(Alert::error("scheduler.hot", "boom"), now).await);
        assert!(
            !manager
                .send_at(Alert::error("scheduler.hot", "boom"), now + Duration::minutes(1))
                .await
        );
        assert_eq!(channel.count(), 1);

        // Cooldown over.
        assert!(
            manager
                .send_at(Alert::error("scheduler.hot", "boom"), now + Duration::minutes(6))
                .await
        );
        assert_eq!(channel.count(), 2);

        let stats = manager.get_statistics();
        assert_eq!(stats.total_received, 3);
        assert_eq!(stats.total_delivered, 2);
        assert_eq!(stats.suppressed_cooldown, 1);
    }

    #[tokio::test]
    async fn test_frequency_cap() {
        let (manager, channel) = manager(catch_all(0, 3));
        let now = Utc::now();

        for i in 0..4 {
            manager
                .send_at(Alert::warning("load", "high"), now + Duration::minutes(i))
                .await;
        }
        assert_eq!(channel.count(), 3);
        assert_eq!(manager.get_statistics().suppressed_frequency, 1);

        let entry = manager
            .history_entry(&alert_key("load", AlertLevel::Warning, "high"))
            .unwrap();
        assert_eq!(entry.count_last_hour, 3);
        assert_eq!(entry.total_count, 3);
        assert_eq!(entry.occurrences, 4);
    }

    #[tokio::test]
    async fn test_hourly_counter_resets() {
        let (manager, channel) = manager(catch_all(0, 1));
        let now = Utc::now();

        assert!(manager.send_at(Alert::warning("load", "high"), now).await);
        assert!(
            !manager
                .send_at(Alert::warning("load", "high"), now + Duration::minutes(30))
                .await
        );
        assert!(
            manager
                .send_at(Alert::warning("load", "high"), now + Duration::minutes(61))
                .await
        );
        assert_eq!(channel.count(), 2);
    }

    #[tokio::test]
    async fn test_distinct_messages_are_independent() {
        let (manager, channel) = manager(catch_all(60, 10));
        let now = Utc::now();
        manager.send_at(Alert::error("api.price", "timeout"), now).await;
        manager.send_at(Alert::error("api.price", "HTTP 500"), now).await;
        manager.send_at(Alert::warning("api.price", "timeout"), now).await;
        assert_eq!(channel.count(), 3);
    }

    #[tokio::test]
    async fn test_no_matching_rule_drops() {
        let (manager, channel) = manager(vec![AlertRule::new("scheduler.*", AlertLevel::Error)]);
        assert!(!manager.send(Alert::critical("load", "x")).await);
        assert!(!manager.send(Alert::warning("scheduler.hot", "x")).await);
        assert_eq!(channel.count(), 0);
        assert_eq!(manager.get_statistics().dropped_no_rule, 2);
    }

    #[tokio::test]
    async fn test_rule_without_registered_channel_is_not_delivered() {
        let (manager, channel) = manager(vec![
            AlertRule::new("*", AlertLevel::Info).with_channels(vec![ChannelKind::Webhook]),
        ]);
        assert!(!manager.send(Alert::error("x", "y")).await);
        assert_eq!(channel.count(), 0);
        assert_eq!(manager.get_statistics().dropped_no_channel, 1);
    }

    #[tokio::test]
    async fn test_alert_below_channel_min_level_keeps_cooldown_free() {
        let webhook = WebhookChannel::new(WebhookConfig {
            enabled: true,
            url: "http://127.0.0.1:9/hook".to_string(),
            min_level: AlertLevel::Critical,
            ..Default::default()
        });
        let manager = AlertManager::new(AlertManagerConfig {
            rules: vec![
                AlertRule::new("*", AlertLevel::Info)
                    .with_channels(vec![ChannelKind::Webhook])
                    .with_cooldown_minutes(30),
            ],
            escalation_rules: Vec::new(),
            threshold_rules: Vec::new(),
        })
        .with_channel(Arc::new(webhook));
        let now = Utc::now();

        assert!(!manager.send_at(Alert::warning("load", "high"), now).await);
        assert!(
            !manager
                .send_at(Alert::warning("load", "high"), now + Duration::minutes(1))
                .await
        );

        let stats = manager.get_statistics();
        assert_eq!(stats.total_delivered, 0);
        assert_eq!(stats.dropped_no_channel, 2);
        assert_eq!(stats.suppressed_cooldown, 0);

        let entry = manager
            .history_entry(&alert_key("load", AlertLevel::Warning, "high"))
            .unwrap();
        assert_eq!(entry.occurrences, 2);
        assert_eq!(entry.total_count, 0);
        assert!(entry.last_sent.is_none());
    }

    #[tokio::test]
    async fn test_failing_channel_does_not_block_others() {
        let ok = RecordingChannel::new(ChannelKind::Log);
        let manager = AlertManager::new(AlertManagerConfig {
            rules: vec![
                AlertRule::new("*", AlertLevel::Info)
                    .with_channels(vec![ChannelKind::Console, ChannelKind::Log]),
            ],
            escalation_rules: Vec::new(),
            threshold_rules: Vec::new(),
        })
        .with_channel(RecordingChannel::failing(ChannelKind::Console))
        .with_channel(ok.clone());

        assert!(manager.send(Alert::error("x", "y")).await);
        assert_eq!(ok.count(), 1);
        assert_eq!(manager.get_statistics().channel_failures, 1);
    }

    #[tokio::test]
    async fn test_manual_suppression() {
        let (manager, channel) = manager(catch_all(0, 100));

        manager.suppress("scheduler.hot", AlertLevel::Error, "boom");
        assert!(!manager.send(Alert::error("scheduler.hot", "boom")).await);

        manager.suppress("api.*", AlertLevel::Warning, "*latency*");
        assert!(!manager.send(Alert::warning("api.price", "p95 latency high")).await);
        assert!(manager.send(Alert::warning("api.price", "error rate high")).await);

        assert!(manager.unsuppress("scheduler.hot", AlertLevel::Error, "boom"));
        assert!(!manager.unsuppress("scheduler.hot", AlertLevel::Error, "boom"));
        assert!(manager.send(Alert::error("scheduler.hot", "boom")).await);

        assert_eq!(channel.count(), 2);
        let stats = manager.get_statistics();
        assert_eq!(stats.suppressed_manual, 2);
        assert_eq!(stats.active_suppressions, 1);
    }

    #[tokio::test]
    async fn test_escalation() {
        let channel = RecordingChannel::new(ChannelKind::Log);
        let manager = AlertManager::new(AlertManagerConfig {
            rules: catch_all(60, 100),
            escalation_rules: vec![EscalationRule {
                component_pattern: "scheduler.*".to_string(),
                initial_level: AlertLevel::Error,
                escalated_level: AlertLevel::Critical,
                failure_count_threshold: 3,
                time_window_minutes: 10,
                escalation_cooldown_minutes: 30,
            }],
            threshold_rules: Vec::new(),
        })
        .with_channel(channel.clone());

        let now = Utc::now();
        for i in 0..3 {
            manager
                .send_at(Alert::error("scheduler.hot", "fetch failed"), now + Duration::minutes(i))
                .await;
        }

        let alerts = channel.alerts.lock().clone();
        // First original, then the escalation; the repeats were in cooldown.
        assert_eq!(alerts.len(), 2);
        assert_eq!(alerts[1].level, AlertLevel::Critical);
        assert!(alerts[1].message.contains("repeated 3 times in 10 minutes"));
        assert_eq!(manager.get_statistics().escalations, 1);

        // Within escalation cooldown: no second escalation.
        for i in 3..6 {
            manager
                .send_at(Alert::error("scheduler.hot", "fetch failed"), now + Duration::minutes(i))
                .await;
        }
        assert_eq!(manager.get_statistics().escalations, 1);
    }

    #[tokio::test]
    async fn test_suppressed_alerts_do_not_escalate() {
        let channel = RecordingChannel::new(ChannelKind::Log);
        let manager = AlertManager::new(AlertManagerConfig {
            rules: catch_all(0, 100),
            escalation_rules: vec![EscalationRule {
                component_pattern: "scheduler.*".to_string(),
                initial_level: AlertLevel::Error,
                escalated_level: AlertLevel::Critical,
                failure_count_threshold: 3,
                time_window_minutes: 10,
                escalation_cooldown_minutes: 0,
            }],
            threshold_rules: Vec::new(),
        })
        .with_channel(channel.clone());
        manager.suppress("scheduler.hot", AlertLevel::Error, "*");

        let now = Utc::now();
        for i in 0..5 {
            assert!(
                !manager
                    .send_at(Alert::error("scheduler.hot", "fetch failed"), now + Duration::minutes(i))
                    .await
            );
        }

        let stats = manager.get_statistics();
        assert_eq!(stats.escalations, 0);
        assert_eq!(stats.suppressed_manual, 5);
        assert_eq!(channel.count(), 0);
    }

    #[tokio::test]
    async fn test_escalation_window_expires() {
        let manager = AlertManager::new(AlertManagerConfig {
            rules: catch_all(0, 100),
            escalation_rules: vec![EscalationRule {
                component_pattern: "*".to_string(),
                initial_level: AlertLevel::Warning,
                escalated_level: AlertLevel::Error,
                failure_count_threshold: 3,
                time_window_minutes: 5,
                escalation_cooldown_minutes: 0,
            }],
            threshold_rules: Vec::new(),
        });
        let now = Utc::now();
        for i in [0, 4, 8, 12] {
            manager
                .send_at(Alert::warning("load", "high"), now + Duration::minutes(i))
                .await;
        }
        assert_eq!(manager.get_statistics().escalations, 0);
    }

    #[tokio::test]
    async fn test_check_threshold() {
        let (manager, channel) = manager(catch_all(0, 100));

        assert!(!manager.check_threshold("api.price", "error_rate", 2.0).await);
        assert!(manager.check_threshold("api.price", "error_rate", 12.0).await);
        assert!(manager.check_threshold("api.price", "error_rate", 80.0).await);
        assert!(!manager.check_threshold("scheduler", "error_rate", 80.0).await);

        let alerts = channel.alerts.lock().clone();
        assert_eq!(alerts.len(), 2);
        assert_eq!(alerts[0].level, AlertLevel::Warning);
        assert_eq!(alerts[1].level, AlertLevel::Critical);
        assert_eq!(alerts[1].context["value"], 80.0);
    }

    #[test]
    fn test_evaluate_threshold_does_not_send() {
        let (manager, channel) = manager(catch_all(0, 100));

        assert!(manager.evaluate_threshold("api.price", "error_rate", 2.0).is_none());
        let alert = manager
            .evaluate_threshold("api.price", "error_rate", 60.0)
            .unwrap();
        assert_eq!(alert.level, AlertLevel::Critical);
        assert_eq!(alert.context["threshold"], 50.0);
        assert_eq!(channel.count(), 0);
        assert_eq!(manager.get_statistics().total_received, 0);
    }

    #[tokio::test]
    async fn test_cleanup_history() {
        let (manager, _channel) = manager(catch_all(0, 100));
        let now = Utc::now();
        manager.send_at(Alert::info("a", "old"), now - Duration::hours(30)).await;
        manager.send_at(Alert::info("a", "new"), now).await;

        assert_eq!(manager.cleanup_history_at(Duration::hours(24), now), 1);
        assert_eq!(manager.get_statistics().history_size, 1);
    }

    #[tokio::test]
    async fn test_apply_config_replaces_rules() {
        let (manager, channel) = manager(catch_all(0, 100));
        manager.apply_config(AlertManagerConfig {
            rules: vec![AlertRule::new("*", AlertLevel::Critical)],
            escalation_rules: Vec::new(),
            threshold_rules: Vec::new(),
        });
        assert!(!manager.send(Alert::error("x", "y")).await);
        assert!(manager.send(Alert::critical("x", "y")).await);
        assert_eq!(channel.count(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_identical_alerts_deliver_once() {
        let (manager, channel) = manager(catch_all(5, 10));
        let manager = Arc::new(manager);
        let now = Utc::now();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let manager = manager.clone();
            handles.push(tokio::spawn(async move {
                manager.send_at(Alert::critical("circuit_breaker.x", "open"), now).await
            }));
        }
        let mut delivered = 0;
        for handle in handles {
            if handle.await.unwrap() {
                delivered += 1;
            }
        }
        assert_eq!(delivered, 1);
        assert_eq!(channel.count(), 1);
    }
}
