//! Performance degradation detection over per-service metric windows.
//!
//! Each `(service, metric)` pair keeps a bounded window of samples. On every
//! insert the trailing `trend_window_minutes` of that window is analyzed; a
//! sustained, well-correlated worsening beyond the metric's threshold raises
//! an alert through the [`AlertManager`], at most once per cooldown.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString, IntoEnumIterator};
use tracing::{debug, info};

use super::stats::{TrendStats, analyze};
use crate::alerting::{Alert, AlertLevel, AlertManager};
use crate::health::HealthStatus;
use crate::{Error, Result};

/// Metric tracked per service.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum MetricKind {
    ResponseTime,
    Throughput,
    /// Percent of failed calls.
    ErrorRate,
    CpuUsage,
    MemoryUsage,
}

impl MetricKind {
    /// Throughput degrades by falling, everything else by rising.
    pub fn degrades_downward(self) -> bool {
        matches!(self, Self::Throughput)
    }
}

/// Severity of a detected degradation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DegradationSeverity {
    Warning,
    Error,
}

impl DegradationSeverity {
    pub fn alert_level(self) -> AlertLevel {
        match self {
            Self::Warning => AlertLevel::Warning,
            Self::Error => AlertLevel::Error,
        }
    }
}

/// Change needed for a warning and for an error.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChangeThreshold {
    pub warning: f64,
    pub error: f64,
}

impl ChangeThreshold {
    const fn new(warning: f64, error: f64) -> Self {
        Self { warning, error }
    }
}

/// Per-metric change thresholds.
///
/// Response time, throughput, CPU and memory are relative changes in percent;
/// throughput values are decreases. Error rate is an absolute change in
/// percentage points.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DegradationThresholds {
    pub response_time: ChangeThreshold,
    pub throughput: ChangeThreshold,
    pub error_rate: ChangeThreshold,
    pub cpu_usage: ChangeThreshold,
    pub memory_usage: ChangeThreshold,
    /// Minimum |correlation| for a trend to count.
    pub correlation: f64,
}

impl Default for DegradationThresholds {
    fn default() -> Self {
        Self {
            response_time: ChangeThreshold::new(30.0, 60.0),
            throughput: ChangeThreshold::new(20.0, 40.0),
            error_rate: ChangeThreshold::new(10.0, 20.0),
            cpu_usage: ChangeThreshold::new(25.0, 50.0),
            memory_usage: ChangeThreshold::new(20.0, 40.0),
            correlation: 0.5,
        }
    }
}

impl DegradationThresholds {
    pub fn for_metric(&self, metric: MetricKind) -> ChangeThreshold {
        match metric {
            MetricKind::ResponseTime => self.response_time,
            MetricKind::Throughput => self.throughput,
            MetricKind::ErrorRate => self.error_rate,
            MetricKind::CpuUsage => self.cpu_usage,
            MetricKind::MemoryUsage => self.memory_usage,
        }
    }

    /// Severity of a trend, if it counts as a degradation.
    pub fn evaluate(&self, metric: MetricKind, stats: &TrendStats) -> Option<DegradationSeverity> {
        let threshold = self.for_metric(metric);
        let (correlated, change) = if metric.degrades_downward() {
            (stats.correlation < -self.correlation, -stats.change_percent)
        } else if metric == MetricKind::ErrorRate {
            (stats.correlation > self.correlation, stats.change_absolute)
        } else {
            (stats.correlation > self.correlation, stats.change_percent)
        };

        if !correlated {
            return None;
        }
        if change >= threshold.error {
            Some(DegradationSeverity::Error)
        } else if change >= threshold.warning {
            Some(DegradationSeverity::Warning)
        } else {
            None
        }
    }
}

/// Projection limits for predictive alerts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PredictionConfig {
    pub cpu_danger: f64,
    pub error_rate_danger: f64,
    pub memory_danger: f64,
    /// Minimum |correlation| for a projection to be trusted.
    pub min_correlation: f64,
}

impl Default for PredictionConfig {
    fn default() -> Self {
        Self {
            cpu_danger: 90.0,
            error_rate_danger: 10.0,
            memory_danger: 95.0,
            min_correlation: 0.6,
        }
    }
}

impl PredictionConfig {
    fn danger_threshold(&self, metric: MetricKind) -> Option<f64> {
        match metric {
            MetricKind::CpuUsage => Some(self.cpu_danger),
            MetricKind::ErrorRate => Some(self.error_rate_danger),
            MetricKind::MemoryUsage => Some(self.memory_danger),
            MetricKind::ResponseTime | MetricKind::Throughput => None,
        }
    }
}

/// Detector configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DegradationConfig {
    pub trend_window_minutes: u64,
    pub min_data_points: usize,
    /// Hard cap on samples kept per (service, metric).
    pub max_window_size: usize,
    pub alert_cooldown_minutes: u64,
    pub thresholds: DegradationThresholds,
    pub prediction: PredictionConfig,
}

impl Default for DegradationConfig {
    fn default() -> Self {
        Self {
            trend_window_minutes: 15,
            min_data_points: 5,
            max_window_size: 500,
            alert_cooldown_minutes: 5,
            thresholds: DegradationThresholds::default(),
            prediction: PredictionConfig::default(),
        }
    }
}

impl DegradationConfig {
    pub fn validate(&self) -> Result<()> {
        if self.trend_window_minutes == 0 {
            return Err(Error::config("degradation.trend_window_minutes must be > 0"));
        }
        if self.min_data_points < 3 {
            return Err(Error::config("degradation.min_data_points must be at least 3"));
        }
        if self.max_window_size < self.min_data_points {
            return Err(Error::config(
                "degradation.max_window_size must be >= min_data_points",
            ));
        }
        let t = &self.thresholds;
        if !(0.0..=1.0).contains(&t.correlation)
            || !(0.0..=1.0).contains(&self.prediction.min_correlation)
        {
            return Err(Error::config("correlation thresholds must be within 0..=1"));
        }
        for metric in MetricKind::iter() {
            let c = t.for_metric(metric);
            if c.warning <= 0.0 || c.warning >= c.error {
                return Err(Error::config(format!(
                    "degradation threshold for {metric}: warning must be > 0 and below error"
                )));
            }
        }
        Ok(())
    }
}

/// Analysis of one metric window.
#[derive(Debug, Clone, Serialize)]
pub struct TrendAnalysis {
    pub service: String,
    pub metric: MetricKind,
    pub stats: TrendStats,
    pub degradation: Option<DegradationSeverity>,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
}

/// Performance summary of one service.
#[derive(Debug, Clone, Serialize)]
pub struct ServicePerformance {
    pub service: String,
    pub status: HealthStatus,
    pub metrics: BTreeMap<MetricKind, TrendAnalysis>,
    pub degraded_metrics: Vec<MetricKind>,
}

/// Projection of a metric crossing its danger threshold.
#[derive(Debug, Clone, Serialize)]
pub struct PredictiveAlert {
    pub service: String,
    pub metric: MetricKind,
    pub current_value: f64,
    pub projected_value: f64,
    pub threshold: f64,
    pub forecast_minutes: u64,
    pub correlation: f64,
}

impl PredictiveAlert {
    pub fn to_alert(&self) -> Alert {
        Alert::warning(
            format!("performance.{}.{}", self.service, self.metric),
            format!(
                "{} projected to exceed {} within {} minutes",
                self.metric, self.threshold, self.forecast_minutes
            ),
        )
        .with_context("current_value", self.current_value)
        .with_context("projected_value", self.projected_value)
        .with_context("correlation", self.correlation)
        .with_context("predictive", true)
    }
}

type WindowKey = (String, MetricKind);

/// Performance degradation detector.
pub struct DegradationDetector {
    config: RwLock<DegradationConfig>,
    windows: Mutex<HashMap<WindowKey, VecDeque<(f64, DateTime<Utc>)>>>,
    last_alerts: Mutex<HashMap<WindowKey, DateTime<Utc>>>,
    alerts: Arc<AlertManager>,
}

impl DegradationDetector {
    pub fn new(config: DegradationConfig, alerts: Arc<AlertManager>) -> Self {
        Self {
            config: RwLock::new(config),
            windows: Mutex::new(HashMap::new()),
            last_alerts: Mutex::new(HashMap::new()),
            alerts,
        }
    }

    pub fn config(&self) -> DegradationConfig {
        self.config.read().clone()
    }

    pub fn apply_config(&self, config: DegradationConfig) {
        let cap = config.max_window_size;
        for window in self.windows.lock().values_mut() {
            while window.len() > cap {
                window.pop_front();
            }
        }
        *self.config.write() = config;
        info!("Degradation detector settings reloaded");
    }

    /// Record a sample and, if it completes a degradation trend, send an alert.
    ///
    /// Returns the alert handed to the alert manager, if any.
    pub async fn record_metric(
        &self,
        service: &str,
        metric: MetricKind,
        value: f64,
        timestamp: DateTime<Utc>,
    ) -> Option<Alert> {
        let alert = self.ingest(service, metric, value, timestamp)?;
        self.alerts.send(alert.clone()).await;
        Some(alert)
    }

    fn ingest(
        &self,
        service: &str,
        metric: MetricKind,
        value: f64,
        timestamp: DateTime<Utc>,
    ) -> Option<Alert> {
        if !value.is_finite() {
            debug!(service, %metric, "Ignoring non-finite metric sample");
            return None;
        }
        let config = self.config.read().clone();
        let key = (service.to_string(), metric);

        let samples = {
            let mut windows = self.windows.lock();
            let window = windows.entry(key.clone()).or_default();
            // Keep the window ordered even if a sample arrives late.
            let pos = window.partition_point(|(_, ts)| *ts <= timestamp);
            window.insert(pos, (value, timestamp));
            while window.len() > config.max_window_size {
                window.pop_front();
            }
            trailing(window, timestamp, config.trend_window_minutes)
        };

        if samples.len() < config.min_data_points {
            return None;
        }
        let stats = analyze(&samples)?;
        let severity = config.thresholds.evaluate(metric, &stats)?;

        {
            let mut last_alerts = self.last_alerts.lock();
            let cooldown = Duration::minutes(config.alert_cooldown_minutes as i64);
            if let Some(last) = last_alerts.get(&key)
                && timestamp - *last < cooldown
            {
                debug!(service, %metric, "Degradation alert in cooldown");
                return None;
            }
            last_alerts.insert(key, timestamp);
        }

        info!(
            service,
            %metric,
            %severity,
            change_percent = stats.change_percent,
            correlation = stats.correlation,
            "Performance degradation detected"
        );

        Some(
            Alert::new(
                severity.alert_level(),
                format!("performance.{service}.{metric}"),
                format!("{metric} degradation detected for {service}"),
            )
            .with_timestamp(timestamp)
            .with_context("baseline_avg", stats.baseline_avg)
            .with_context("recent_avg", stats.recent_avg)
            .with_context("change_percent", stats.change_percent)
            .with_context("correlation", stats.correlation)
            .with_context("data_points", stats.data_points as u64),
        )
    }

    /// Most recent sample recorded for a metric.
    pub fn latest_value(&self, service: &str, metric: MetricKind) -> Option<f64> {
        let windows = self.windows.lock();
        windows
            .get(&(service.to_string(), metric))?
            .back()
            .map(|(value, _)| *value)
    }

    /// Analyze the trailing window of one metric without alerting.
    pub fn analyze_trend(&self, service: &str, metric: MetricKind) -> Option<TrendAnalysis> {
        let config = self.config.read().clone();
        let samples = {
            let windows = self.windows.lock();
            let window = windows.get(&(service.to_string(), metric))?;
            let (_, latest) = *window.back()?;
            trailing(window, latest, config.trend_window_minutes)
        };
        if samples.len() < config.min_data_points {
            return None;
        }
        let stats = analyze(&samples)?;
        let degradation = config.thresholds.evaluate(metric, &stats);
        Some(TrendAnalysis {
            service: service.to_string(),
            metric,
            degradation,
            window_start: samples[0].1,
            window_end: samples[samples.len() - 1].1,
            stats,
        })
    }

    /// Status of a service: worst degradation across its metrics.
    ///
    /// A warning-level degradation maps to `Degraded`, an error-level one to
    /// `Critical`, and a service without enough data is `Unknown`.
    pub fn get_health_status(&self, service: &str) -> ServicePerformance {
        let metrics: BTreeMap<MetricKind, TrendAnalysis> = MetricKind::iter()
            .filter_map(|metric| self.analyze_trend(service, metric).map(|a| (metric, a)))
            .collect();

        let degraded_metrics: Vec<MetricKind> = metrics
            .values()
            .filter(|a| a.degradation.is_some())
            .map(|a| a.metric)
            .collect();

        let worst = metrics.values().filter_map(|a| a.degradation).max();
        let status = match worst {
            Some(DegradationSeverity::Error) => HealthStatus::Critical,
            Some(DegradationSeverity::Warning) => HealthStatus::Degraded,
            None if metrics.is_empty() => HealthStatus::Unknown,
            None => HealthStatus::Healthy,
        };

        ServicePerformance {
            service: service.to_string(),
            status,
            metrics,
            degraded_metrics,
        }
    }

    /// Project each metric `forecast_minutes` ahead and report those that
    /// would cross their danger threshold. Nothing is sent.
    pub fn get_predictive_alerts(&self, service: &str, forecast_minutes: u64) -> Vec<PredictiveAlert> {
        let prediction = self.config.read().prediction.clone();
        MetricKind::iter()
            .filter_map(|metric| {
                let threshold = prediction.danger_threshold(metric)?;
                let analysis = self.analyze_trend(service, metric)?;
                let stats = &analysis.stats;
                if stats.correlation.abs() < prediction.min_correlation {
                    return None;
                }
                let projected = stats.recent_avg + stats.slope_per_minute * forecast_minutes as f64;
                (projected > threshold).then(|| PredictiveAlert {
                    service: service.to_string(),
                    metric,
                    current_value: stats.recent_avg,
                    projected_value: projected,
                    threshold,
                    forecast_minutes,
                    correlation: stats.correlation,
                })
            })
            .collect()
    }

    pub fn tracked_services(&self) -> Vec<String> {
        let mut services: Vec<String> = self
            .windows
            .lock()
            .keys()
            .map(|(service, _)| service.clone())
            .collect();
        services.sort();
        services.dedup();
        services
    }

    /// Drop samples older than `cutoff`. Returns the number of samples removed.
    pub fn prune_older_than(&self, cutoff: DateTime<Utc>) -> usize {
        let mut removed = 0;
        let mut windows = self.windows.lock();
        for window in windows.values_mut() {
            while window.front().is_some_and(|(_, ts)| *ts < cutoff) {
                window.pop_front();
                removed += 1;
            }
        }
        windows.retain(|_, window| !window.is_empty());
        drop(windows);

        self.last_alerts.lock().retain(|_, ts| *ts >= cutoff);
        removed
    }
}

fn trailing(
    window: &VecDeque<(f64, DateTime<Utc>)>,
    end: DateTime<Utc>,
    minutes: u64,
) -> Vec<(f64, DateTime<Utc>)> {
    let start = end - Duration::minutes(minutes as i64);
    window
        .iter()
        .filter(|(_, ts)| *ts >= start && *ts <= end)
        .copied()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerting::testing::RecordingChannel;
    use crate::alerting::{AlertManagerConfig, AlertRule, ChannelKind};

    fn detector() -> (DegradationDetector, Arc<RecordingChannel>) {
        let channel = RecordingChannel::new(ChannelKind::Log);
        let alerts = Arc::new(
            AlertManager::new(AlertManagerConfig {
                rules: vec![AlertRule::new("*", AlertLevel::Info).with_cooldown_minutes(0)],
                escalation_rules: Vec::new(),
                threshold_rules: Vec::new(),
            })
            .with_channel(channel.clone()),
        );
        (DegradationDetector::new(DegradationConfig::default(), alerts), channel)
    }

    #[tokio::test]
    async fn test_increasing_response_time_alerts_once() {
        let (detector, channel) = detector();
        let start = Utc::now();
        let mut emitted = 0;
        for i in 0..10 {
            let value = 100.0 + 10.0 * i as f64;
            let ts = start + Duration::seconds(30 * i as i64);
            if detector
                .record_metric("price_api", MetricKind::ResponseTime, value, ts)
                .await
                .is_some()
            {
                emitted += 1;
            }
        }
        assert_eq!(emitted, 1);
        assert_eq!(channel.count(), 1);
        let alert = channel.alerts.lock()[0].clone();
        assert_eq!(alert.component, "performance.price_api.response_time");
        assert_eq!(alert.level, AlertLevel::Warning);
    }

    #[tokio::test]
    async fn test_flat_series_no_alert() {
        let (detector, channel) = detector();
        let start = Utc::now();
        for i in 0..20 {
            let ts = start + Duration::seconds(30 * i);
            assert!(
                detector
                    .record_metric("price_api", MetricKind::ResponseTime, 150.0, ts)
                    .await
                    .is_none()
            );
        }
        assert_eq!(channel.count(), 0);
        assert_eq!(
            detector.get_health_status("price_api").status,
            HealthStatus::Healthy
        );
    }

    #[tokio::test]
    async fn test_throughput_drop_and_severity() {
        let (detector, _channel) = detector();
        let start = Utc::now();
        let values = [100.0, 95.0, 85.0, 70.0, 55.0, 50.0];
        let mut last = None;
        for (i, v) in values.iter().enumerate() {
            let ts = start + Duration::seconds(30 * i as i64);
            if let Some(alert) = detector.record_metric("svc", MetricKind::Throughput, *v, ts).await {
                last = Some(alert);
            }
        }
        let alert = last.unwrap();
        assert_eq!(alert.level, AlertLevel::Error);

        let status = detector.get_health_status("svc");
        assert_eq!(status.status, HealthStatus::Critical);
        assert_eq!(status.degraded_metrics, vec![MetricKind::Throughput]);
    }

    #[tokio::test]
    async fn test_error_rate_uses_percentage_points() {
        let (detector, _channel) = detector();
        let start = Utc::now();
        // +8pp: large relative change but under the absolute threshold.
        for (i, v) in [1.0, 2.0, 4.0, 6.0, 8.0, 9.0].iter().enumerate() {
            let ts = start + Duration::seconds(30 * i as i64);
            assert!(detector.record_metric("svc", MetricKind::ErrorRate, *v, ts).await.is_none());
        }
    }

    #[tokio::test]
    async fn test_cooldown_uses_sample_timestamps() {
        let (detector, _channel) = detector();
        let start = Utc::now();
        let mut emitted = Vec::new();
        for i in 0..30 {
            let value = 100.0 + 20.0 * i as f64;
            let ts = start + Duration::minutes(i);
            if detector
                .record_metric("svc", MetricKind::ResponseTime, value, ts)
                .await
                .is_some()
            {
                emitted.push(i);
            }
        }
        assert!(emitted.len() >= 2);
        for pair in emitted.windows(2) {
            assert!(pair[1] - pair[0] >= 5);
        }
    }

    #[test]
    fn test_too_few_points_unknown() {
        let (detector, _channel) = detector();
        assert_eq!(detector.get_health_status("nobody").status, HealthStatus::Unknown);
        assert!(detector.analyze_trend("nobody", MetricKind::CpuUsage).is_none());
    }

    #[tokio::test]
    async fn test_predictive_alerts() {
        let (detector, channel) = detector();
        let start = Utc::now();
        // CPU rising 2% per minute from 60%.
        for i in 0..8 {
            let ts = start + Duration::minutes(i);
            detector
                .record_metric("host", MetricKind::CpuUsage, 60.0 + 2.0 * i as f64, ts)
                .await;
        }
        let before = channel.count();

        let predictions = detector.get_predictive_alerts("host", 15);
        assert_eq!(predictions.len(), 1);
        let p = &predictions[0];
        assert_eq!(p.metric, MetricKind::CpuUsage);
        assert!(p.projected_value > 90.0);
        assert!((p.threshold - 90.0).abs() < f64::EPSILON);

        assert!(detector.get_predictive_alerts("host", 1).is_empty());
        // Predictions are returned, not sent.
        assert_eq!(channel.count(), before);
        assert_eq!(p.to_alert().component, "performance.host.cpu_usage");
    }

    #[tokio::test]
    async fn test_prune_and_tracked_services() {
        let (detector, _channel) = detector();
        let start = Utc::now();
        detector.record_metric("a", MetricKind::CpuUsage, 1.0, start).await;
        detector
            .record_metric("b", MetricKind::CpuUsage, 1.0, start + Duration::minutes(10))
            .await;
        assert_eq!(detector.tracked_services(), vec!["a", "b"]);

        assert_eq!(detector.prune_older_than(start + Duration::minutes(5)), 1);
        assert_eq!(detector.tracked_services(), vec!["b"]);
    }

    #[test]
    fn test_window_bounded() {
        let (detector, _channel) = detector();
        detector.apply_config(DegradationConfig {
            max_window_size: 10,
            ..Default::default()
        });
        let start = Utc::now();
        for i in 0..25 {
            detector.ingest("svc", MetricKind::CpuUsage, 10.0, start + Duration::seconds(i));
        }
        let analysis = detector.analyze_trend("svc", MetricKind::CpuUsage).unwrap();
        assert_eq!(analysis.stats.data_points, 10);
    }

    #[test]
    fn test_config_validation() {
        assert!(DegradationConfig::default().validate().is_ok());
        let bad = DegradationConfig {
            min_data_points: 1,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }
}
