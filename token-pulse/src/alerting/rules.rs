//! Routing, escalation and threshold rules.

use serde::{Deserialize, Serialize};

use super::alert::{Alert, AlertLevel};
use super::channels::ChannelKind;
use crate::{Error, Result};

/// Match `text` against a pattern where `*` matches any run of characters.
///
/// Supports exact, `*`, `prefix*`, `*suffix`, `pre*post` and any mix of
/// several wildcards.
pub fn wildcard_match(pattern: &str, text: &str) -> bool {
    if !pattern.contains('*') {
        return pattern == text;
    }

    // At least two parts since the pattern contains a wildcard.
    let parts: Vec<&str> = pattern.split('*').collect();
    let first = parts[0];
    let last = parts[parts.len() - 1];
    let Some(mut remaining) = text.strip_prefix(first) else {
        return false;
    };

    for part in &parts[1..parts.len() - 1] {
        match remaining.find(part) {
            Some(idx) => remaining = &remaining[idx + part.len()..],
            None => return false,
        }
    }
    remaining.len() >= last.len() && remaining.ends_with(last)
}

/// Number of wildcards in a pattern; fewer means more specific.
pub fn wildcard_count(pattern: &str) -> usize {
    pattern.matches('*').count()
}

/// Routing rule for alerts of matching components.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRule {
    pub component_pattern: String,
    #[serde(default)]
    pub min_level: AlertLevel,
    #[serde(default = "default_cooldown_minutes")]
    pub cooldown_minutes: u64,
    #[serde(default = "default_max_frequency_per_hour")]
    pub max_frequency_per_hour: u32,
    #[serde(default = "default_channels")]
    pub channels: Vec<ChannelKind>,
}

fn default_cooldown_minutes() -> u64 {
    15
}

fn default_max_frequency_per_hour() -> u32 {
    10
}

fn default_channels() -> Vec<ChannelKind> {
    vec![ChannelKind::Log]
}

impl AlertRule {
    pub fn new(component_pattern: impl Into<String>, min_level: AlertLevel) -> Self {
        Self {
            component_pattern: component_pattern.into(),
            min_level,
            cooldown_minutes: default_cooldown_minutes(),
            max_frequency_per_hour: default_max_frequency_per_hour(),
            channels: default_channels(),
        }
    }

    pub fn with_cooldown_minutes(mut self, minutes: u64) -> Self {
        self.cooldown_minutes = minutes;
        self
    }

    pub fn with_max_frequency_per_hour(mut self, max: u32) -> Self {
        self.max_frequency_per_hour = max;
        self
    }

    pub fn with_channels(mut self, channels: Vec<ChannelKind>) -> Self {
        self.channels = channels;
        self
    }

    pub fn matches(&self, alert: &Alert) -> bool {
        alert.level >= self.min_level && wildcard_match(&self.component_pattern, &alert.component)
    }

    pub fn specificity(&self) -> usize {
        wildcard_count(&self.component_pattern)
    }

    pub fn validate(&self) -> Result<()> {
        if self.component_pattern.is_empty() {
            return Err(Error::config("alert rule component_pattern must not be empty"));
        }
        if self.max_frequency_per_hour == 0 {
            return Err(Error::config(format!(
                "alert rule '{}': max_frequency_per_hour must be > 0",
                self.component_pattern
            )));
        }
        if self.channels.is_empty() {
            return Err(Error::config(format!(
                "alert rule '{}': at least one channel is required",
                self.component_pattern
            )));
        }
        Ok(())
    }
}

/// Pick the most specific matching rule; ties go to the earlier rule.
pub fn select_rule<'a>(rules: &'a [AlertRule], alert: &Alert) -> Option<&'a AlertRule> {
    rules
        .iter()
        .filter(|rule| rule.matches(alert))
        .min_by_key(|rule| rule.specificity())
}

/// Default routing: everything at warning and above goes to the log, and
/// breaker and scheduler failures also go to the console and webhook.
pub fn default_rules() -> Vec<AlertRule> {
    vec![
        AlertRule::new("*", AlertLevel::Warning)
            .with_channels(vec![ChannelKind::Log, ChannelKind::Console]),
        AlertRule::new("circuit_breaker.*", AlertLevel::Warning)
            .with_cooldown_minutes(5)
            .with_max_frequency_per_hour(12)
            .with_channels(vec![
                ChannelKind::Log,
                ChannelKind::Console,
                ChannelKind::Webhook,
            ]),
        AlertRule::new("scheduler.*", AlertLevel::Error)
            .with_cooldown_minutes(10)
            .with_channels(vec![
                ChannelKind::Log,
                ChannelKind::Console,
                ChannelKind::Webhook,
            ]),
        AlertRule::new("performance.*", AlertLevel::Warning)
            .with_cooldown_minutes(5)
            .with_max_frequency_per_hour(6),
    ]
}

/// Escalates repeated alerts of one component and level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationRule {
    pub component_pattern: String,
    pub initial_level: AlertLevel,
    pub escalated_level: AlertLevel,
    pub failure_count_threshold: u32,
    pub time_window_minutes: u64,
    #[serde(default = "default_escalation_cooldown_minutes")]
    pub escalation_cooldown_minutes: u64,
}

fn default_escalation_cooldown_minutes() -> u64 {
    30
}

impl EscalationRule {
    pub fn applies_to(&self, alert: &Alert) -> bool {
        alert.level == self.initial_level && wildcard_match(&self.component_pattern, &alert.component)
    }

    pub fn validate(&self) -> Result<()> {
        if self.escalated_level <= self.initial_level {
            return Err(Error::config(format!(
                "escalation rule '{}': escalated_level must be above initial_level",
                self.component_pattern
            )));
        }
        if self.failure_count_threshold == 0 || self.time_window_minutes == 0 {
            return Err(Error::config(format!(
                "escalation rule '{}': threshold and window must be > 0",
                self.component_pattern
            )));
        }
        Ok(())
    }
}

pub fn default_escalation_rules() -> Vec<EscalationRule> {
    vec![EscalationRule {
        component_pattern: "scheduler.*".to_string(),
        initial_level: AlertLevel::Error,
        escalated_level: AlertLevel::Critical,
        failure_count_threshold: 5,
        time_window_minutes: 15,
        escalation_cooldown_minutes: default_escalation_cooldown_minutes(),
    }]
}

/// Direction in which a threshold is crossed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThresholdDirection {
    #[default]
    Above,
    Below,
}

/// Static threshold on a named metric of a component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdRule {
    pub component_pattern: String,
    pub metric: String,
    pub warning: f64,
    pub critical: f64,
    #[serde(default)]
    pub direction: ThresholdDirection,
}

impl ThresholdRule {
    pub fn applies_to(&self, component: &str, metric: &str) -> bool {
        self.metric == metric && wildcard_match(&self.component_pattern, component)
    }

    /// Level reached by `value`, if any.
    pub fn evaluate(&self, value: f64) -> Option<AlertLevel> {
        let crossed = |threshold: f64| match self.direction {
            ThresholdDirection::Above => value >= threshold,
            ThresholdDirection::Below => value <= threshold,
        };
        if crossed(self.critical) {
            Some(AlertLevel::Critical)
        } else if crossed(self.warning) {
            Some(AlertLevel::Warning)
        } else {
            None
        }
    }

    /// Threshold value for a level produced by [`evaluate`](Self::evaluate).
    pub fn threshold_for(&self, level: AlertLevel) -> f64 {
        if level == AlertLevel::Critical {
            self.critical
        } else {
            self.warning
        }
    }

    pub fn validate(&self) -> Result<()> {
        let ordered = match self.direction {
            ThresholdDirection::Above => self.warning < self.critical,
            ThresholdDirection::Below => self.warning > self.critical,
        };
        if !ordered {
            return Err(Error::config(format!(
                "threshold rule '{}/{}': warning must be crossed before critical",
                self.component_pattern, self.metric
            )));
        }
        Ok(())
    }
}

pub fn default_threshold_rules() -> Vec<ThresholdRule> {
    let rule = |metric: &str, warning: f64, critical: f64| ThresholdRule {
        component_pattern: "resources".to_string(),
        metric: metric.to_string(),
        warning,
        critical,
        direction: ThresholdDirection::Above,
    };
    vec![
        rule("open_fds", 4096.0, 8192.0),
        rule("connection_count", 5000.0, 10000.0),
        rule("load_score", 70.0, 85.0),
    ]
}
