//! System-wide health aggregation.
//!
//! [`HealthMonitor`] recomputes a [`SystemHealth`] snapshot on every call from
//! the scheduler tracker, OS metrics, API call windows, circuit breakers and
//! the degradation detector. Alerts raised while computing the snapshot are
//! forwarded to the alert manager before it is returned.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::tracker::{ApiCallSummary, ApiCallTracker, GroupSnapshot, SchedulerTracker};
use super::types::{
    ApiHealth, GroupHealth, HealthStatus, ResourceHealth, SchedulerHealth, SystemHealth,
    aggregate_status, format_bytes,
};
use crate::alerting::{Alert, AlertLevel, AlertManager};
use crate::degradation::DegradationDetector;
use crate::load::{LoadBasedProcessor, features};
use crate::resilience::{CircuitState, ResilienceRegistry};
use crate::{Error, Result};

/// Health thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// A group is degraded when it has not started for this many intervals.
    pub staleness_warning_multiplier: f64,
    /// A group is critical when it has not started for this many intervals.
    pub staleness_critical_multiplier: f64,
    /// API error rate in percent.
    pub api_error_rate_warning: f64,
    pub api_error_rate_critical: f64,
    pub api_latency_warning_ms: f64,
    pub api_latency_critical_ms: f64,
    pub api_consecutive_failures_critical: u32,
    /// Horizon for predictive alerts included in the snapshot.
    pub forecast_minutes: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            staleness_warning_multiplier: 2.0,
            staleness_critical_multiplier: 5.0,
            api_error_rate_warning: 10.0,
            api_error_rate_critical: 50.0,
            api_latency_warning_ms: 2000.0,
            api_latency_critical_ms: 5000.0,
            api_consecutive_failures_critical: 5,
            forecast_minutes: 15,
        }
    }
}

impl HealthConfig {
    pub fn validate(&self) -> Result<()> {
        if self.staleness_warning_multiplier < 1.0
            || self.staleness_warning_multiplier >= self.staleness_critical_multiplier
        {
            return Err(Error::config(
                "health staleness multipliers must satisfy 1 <= warning < critical",
            ));
        }
        if self.api_error_rate_warning >= self.api_error_rate_critical {
            return Err(Error::config(
                "health.api_error_rate_warning must be below api_error_rate_critical",
            ));
        }
        if self.api_latency_warning_ms >= self.api_latency_critical_ms {
            return Err(Error::config(
                "health.api_latency_warning_ms must be below api_latency_critical_ms",
            ));
        }
        if self.api_consecutive_failures_critical == 0 {
            return Err(Error::config(
                "health.api_consecutive_failures_critical must be > 0",
            ));
        }
        Ok(())
    }
}

/// Collaborators the monitor reads from.
pub struct HealthSources {
    pub registry: Arc<ResilienceRegistry>,
    pub load: Arc<LoadBasedProcessor>,
    pub detector: Arc<DegradationDetector>,
    pub alerts: Arc<AlertManager>,
    pub scheduler: Arc<SchedulerTracker>,
    pub apis: Arc<ApiCallTracker>,
}

/// Aggregates component health into one snapshot.
pub struct HealthMonitor {
    config: RwLock<HealthConfig>,
    sources: HealthSources,
    started: Instant,
    version: String,
}

impl HealthMonitor {
    pub fn new(config: HealthConfig, sources: HealthSources) -> Self {
        Self {
            config: RwLock::new(config),
            sources,
            started: Instant::now(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    pub fn apply_config(&self, config: HealthConfig) {
        *self.config.write() = config;
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started.elapsed().as_secs()
    }

    /// Full snapshot. Alerts raised while building it are sent before returning.
    pub async fn get_comprehensive_health(&self) -> SystemHealth {
        let now = Utc::now();
        let mut alerts = Vec::new();

        let scheduler = self.assess_scheduler(now, &mut alerts);
        let resources = self.assess_resources(&mut alerts);
        let apis: BTreeMap<String, ApiHealth> = self
            .api_names()
            .into_iter()
            .map(|name| {
                let health = self.assess_api(&name, &mut alerts);
                (name, health)
            })
            .collect();

        let performance: BTreeMap<String, HealthStatus> = self
            .sources
            .detector
            .tracked_services()
            .into_iter()
            .map(|service| {
                let status = self.sources.detector.get_health_status(&service).status;
                (service, status)
            })
            .collect();

        if self.sources.load.is_feature_enabled(features::PREDICTIVE_ALERTS) {
            let forecast = self.config.read().forecast_minutes;
            for service in performance.keys() {
                alerts.extend(
                    self.sources
                        .detector
                        .get_predictive_alerts(service, forecast)
                        .iter()
                        .map(|p| p.to_alert()),
                );
            }
        }

        let mut statuses = vec![scheduler.status, resources.status];
        statuses.extend(apis.values().map(|a| a.status));
        statuses.extend(performance.values().copied());
        let overall_status = aggregate_status(&statuses, &alerts);

        for alert in &alerts {
            self.sources.alerts.send(alert.clone()).await;
        }

        debug!(status = %overall_status, alerts = alerts.len(), "Health snapshot computed");

        SystemHealth {
            overall_status,
            scheduler,
            resources,
            apis,
            performance,
            alerts,
            version: self.version.clone(),
            uptime_secs: self.uptime_secs(),
            timestamp: now,
        }
    }

    pub fn get_scheduler_health(&self) -> SchedulerHealth {
        self.assess_scheduler(Utc::now(), &mut Vec::new())
    }

    pub fn get_resource_health(&self) -> ResourceHealth {
        self.assess_resources(&mut Vec::new())
    }

    /// Health of one dependency, `None` if nothing is known about it.
    pub fn get_api_health(&self, name: &str) -> Option<ApiHealth> {
        let known = self.sources.apis.summary(name).is_some()
            || self.sources.registry.existing_breaker(name).is_some();
        known.then(|| self.assess_api(name, &mut Vec::new()))
    }

    fn api_names(&self) -> BTreeSet<String> {
        let mut names: BTreeSet<String> = self.sources.apis.names().into_iter().collect();
        names.extend(
            self.sources
                .registry
                .breaker_stats()
                .into_iter()
                .map(|s| s.name),
        );
        names
    }

    fn assess_scheduler(&self, now: DateTime<Utc>, alerts: &mut Vec<Alert>) -> SchedulerHealth {
        let tracker = &self.sources.scheduler;
        let stuck_jobs = tracker.stuck_jobs(now);

        let groups: BTreeMap<String, GroupHealth> = tracker
            .groups()
            .into_iter()
            .filter_map(|group| tracker.snapshot(&group))
            .map(|snapshot| {
                let stuck = stuck_jobs.iter().filter(|j| j.group == snapshot.group).count();
                let health = self.group_health(&snapshot, stuck, now, alerts);
                (snapshot.group, health)
            })
            .collect();

        for job in &stuck_jobs {
            alerts.push(
                Alert::error(
                    format!("scheduler.{}", job.group),
                    "scheduler job exceeded stuck threshold",
                )
                .with_context("job_id", job.id)
                .with_context("age_secs", job.age_secs),
            );
        }

        SchedulerHealth {
            status: HealthStatus::worst_of(groups.values().map(|g| g.status)),
            groups,
            stuck_jobs,
        }
    }

    fn group_health(
        &self,
        snapshot: &GroupSnapshot,
        stuck: usize,
        now: DateTime<Utc>,
        alerts: &mut Vec<Alert>,
    ) -> GroupHealth {
        let config = self.config.read().clone();
        let interval_secs = snapshot.expected_interval.as_secs_f64();
        let component = format!("scheduler.{}", snapshot.group);

        let seconds_since_last_run = snapshot.last_started.map(|ts| (now - ts).num_seconds());
        // Before the first run, measure staleness from process start.
        let age = seconds_since_last_run.unwrap_or(self.uptime_secs() as i64) as f64;

        let (mut status, mut message) = if interval_secs <= 0.0 {
            (HealthStatus::Unknown, Some("no expected interval registered".to_string()))
        } else if age > interval_secs * config.staleness_critical_multiplier {
            alerts.push(
                Alert::critical(component.clone(), "scheduler group has stopped running")
                    .with_context("seconds_since_last_run", age),
            );
            (
                HealthStatus::Critical,
                Some(format!("no run for {age:.0}s (interval {interval_secs:.0}s)")),
            )
        } else if age > interval_secs * config.staleness_warning_multiplier {
            alerts.push(
                Alert::warning(component.clone(), "scheduler group is running late")
                    .with_context("seconds_since_last_run", age),
            );
            (
                HealthStatus::Degraded,
                Some(format!("last run {age:.0}s ago (interval {interval_secs:.0}s)")),
            )
        } else if snapshot.last_started.is_none() {
            (HealthStatus::Unknown, Some("no executions yet".to_string()))
        } else {
            (HealthStatus::Healthy, None)
        };

        if snapshot.recent.last().is_some_and(|e| e.is_failure()) {
            status = status.worst(HealthStatus::Degraded);
            message.get_or_insert_with(|| "last execution failed for every entity".to_string());
        }
        if stuck > 0 {
            status = status.worst(HealthStatus::Degraded);
            message.get_or_insert_with(|| format!("{stuck} job(s) stuck"));
        }

        let recent = &snapshot.recent;
        let avg_processing_ms = (!recent.is_empty())
            .then(|| recent.iter().map(|e| e.duration_ms as f64).sum::<f64>() / recent.len() as f64);
        let total_ms: u64 = recent.iter().map(|e| e.duration_ms).sum();
        let throughput_per_sec = (total_ms > 0).then(|| {
            recent.iter().map(|e| e.processed as f64).sum::<f64>() / (total_ms as f64 / 1000.0)
        });

        GroupHealth {
            group: snapshot.group.clone(),
            status,
            message,
            expected_interval_secs: snapshot.expected_interval.as_secs(),
            last_started: snapshot.last_started,
            last_finished: recent.last().map(|e| e.finished_at),
            seconds_since_last_run,
            total_executions: snapshot.total_executions,
            failed_executions: snapshot.failed_executions,
            avg_processing_ms,
            throughput_per_sec,
            in_flight: snapshot.in_flight,
        }
    }

    fn assess_resources(&self, alerts: &mut Vec<Alert>) -> ResourceHealth {
        let load = &self.sources.load;
        let provider = load.provider();
        let thresholds = load.thresholds();

        let cpu_percent = provider.cpu_percent();
        let memory = provider.virtual_memory();
        let disk = provider.disk_usage(&load.disk_path());

        let mut status = HealthStatus::Healthy;
        let mut check = |metric: &str, value: f64, warning: f64, critical: f64| {
            let component = format!("resources.{metric}");
            if value >= critical {
                status = status.worst(HealthStatus::Critical);
                alerts.push(
                    Alert::critical(component, format!("{metric} usage critical"))
                        .with_context("percent", value),
                );
            } else if value >= warning {
                status = status.worst(HealthStatus::Degraded);
                alerts.push(
                    Alert::warning(component, format!("{metric} usage high"))
                        .with_context("percent", value),
                );
            }
        };

        check("cpu", cpu_percent, thresholds.cpu_warning, thresholds.cpu_critical);
        check(
            "memory",
            memory.percent,
            thresholds.memory_warning,
            thresholds.memory_critical,
        );
        if let Some(disk) = &disk {
            check("disk", disk.percent, thresholds.disk_warning, thresholds.disk_critical);
        }

        // Counters without fixed limits go through the configurable threshold rules.
        let open_fds = provider.open_fd_count();
        let connection_count = provider.connection_count();
        let counters = [
            ("open_fds", open_fds.map(|v| v as f64)),
            ("connection_count", connection_count.map(|v| v as f64)),
            ("load_score", load.latest_sample().map(|s| s.load_score)),
        ];
        for (metric, value) in counters {
            let Some(alert) = value
                .and_then(|value| self.sources.alerts.evaluate_threshold("resources", metric, value))
            else {
                continue;
            };
            status = status.worst(match alert.level {
                AlertLevel::Critical => HealthStatus::Critical,
                AlertLevel::Info => HealthStatus::Healthy,
                _ => HealthStatus::Degraded,
            });
            alerts.push(alert);
        }

        ResourceHealth {
            status,
            cpu_percent,
            memory_percent: memory.percent,
            memory_used: format_bytes(memory.used_bytes),
            disk_percent: disk.as_ref().map(|d| d.percent),
            disk_available: disk.as_ref().map(|d| format_bytes(d.available_bytes)),
            open_fds,
            connection_count,
            db_connections: provider.db_connection_count(),
            load_level: load.current_level(),
            disabled_features: load.disabled_features(),
        }
    }

    fn assess_api(&self, name: &str, alerts: &mut Vec<Alert>) -> ApiHealth {
        let config = self.config.read().clone();
        let summary = self.sources.apis.summary(name).unwrap_or_else(|| ApiCallSummary {
            name: name.to_string(),
            window_calls: 0,
            total_calls: 0,
            total_failures: 0,
            avg_latency_ms: 0.0,
            p95_latency_ms: 0.0,
            error_rate: 0.0,
            consecutive_failures: 0,
            last_success: None,
            last_failure: None,
        });

        let (circuit_state, circuit_inferred) = match self.sources.registry.existing_breaker(name) {
            Some(breaker) => (Some(breaker.state()), false),
            None if summary.consecutive_failures >= config.api_consecutive_failures_critical => {
                (Some(CircuitState::Open), true)
            }
            None if summary.window_calls > 0 => (Some(CircuitState::Closed), true),
            None => (None, true),
        };

        let component = format!("api.{name}");
        let status = if summary.window_calls == 0 && circuit_state.is_none_or(|s| s == CircuitState::Closed) {
            HealthStatus::Unknown
        } else if circuit_state == Some(CircuitState::Open)
            || summary.error_rate >= config.api_error_rate_critical
            || summary.p95_latency_ms >= config.api_latency_critical_ms
            || summary.consecutive_failures >= config.api_consecutive_failures_critical
        {
            alerts.push(
                Alert::critical(component, "external API unavailable")
                    .with_context("error_rate", summary.error_rate)
                    .with_context("p95_latency_ms", summary.p95_latency_ms)
                    .with_context("consecutive_failures", summary.consecutive_failures),
            );
            HealthStatus::Critical
        } else if circuit_state == Some(CircuitState::HalfOpen)
            || summary.error_rate >= config.api_error_rate_warning
            || summary.p95_latency_ms >= config.api_latency_warning_ms
        {
            alerts.push(
                Alert::warning(component, "external API degraded")
                    .with_context("error_rate", summary.error_rate)
                    .with_context("p95_latency_ms", summary.p95_latency_ms),
            );
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        ApiHealth {
            name: name.to_string(),
            status,
            window_calls: summary.window_calls,
            total_calls: summary.total_calls,
            avg_latency_ms: summary.avg_latency_ms,
            p95_latency_ms: summary.p95_latency_ms,
            error_rate: summary.error_rate,
            consecutive_failures: summary.consecutive_failures,
            circuit_state,
            circuit_inferred,
            last_success: summary.last_success,
            last_failure: summary.last_failure,
        }
    }
}
