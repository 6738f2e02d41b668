//! Health snapshot types.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::Display;

use crate::alerting::{Alert, AlertLevel};
use crate::load::LoadLevel;
use crate::resilience::CircuitState;

/// Health status of a component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Critical,
    /// Not enough information yet.
    #[default]
    Unknown,
}

impl HealthStatus {
    fn rank(self) -> u8 {
        match self {
            Self::Unknown => 0,
            Self::Healthy => 1,
            Self::Degraded => 2,
            Self::Critical => 3,
        }
    }

    /// The worse of two statuses. `Unknown` never outranks a known status.
    pub fn worst(self, other: Self) -> Self {
        if other.rank() > self.rank() { other } else { self }
    }

    /// Worst status of an iterator, `Unknown` if empty.
    pub fn worst_of(statuses: impl IntoIterator<Item = Self>) -> Self {
        statuses.into_iter().fold(Self::Unknown, Self::worst)
    }
}

/// Health of one scheduled group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupHealth {
    pub group: String,
    pub status: HealthStatus,
    pub message: Option<String>,
    pub expected_interval_secs: u64,
    pub last_started: Option<DateTime<Utc>>,
    pub last_finished: Option<DateTime<Utc>>,
    pub seconds_since_last_run: Option<i64>,
    pub total_executions: u64,
    pub failed_executions: u64,
    pub avg_processing_ms: Option<f64>,
    /// Entities processed per second over the recent executions.
    pub throughput_per_sec: Option<f64>,
    pub in_flight: usize,
}

/// A job that has been running longer than the stuck threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StuckJob {
    pub id: u64,
    pub group: String,
    pub started_at: DateTime<Utc>,
    pub age_secs: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerHealth {
    pub status: HealthStatus,
    pub groups: BTreeMap<String, GroupHealth>,
    pub stuck_jobs: Vec<StuckJob>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceHealth {
    pub status: HealthStatus,
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub memory_used: String,
    pub disk_percent: Option<f64>,
    pub disk_available: Option<String>,
    pub open_fds: Option<u64>,
    pub connection_count: Option<u64>,
    pub db_connections: Option<u64>,
    pub load_level: LoadLevel,
    pub disabled_features: Vec<String>,
}

/// Health of one external dependency.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiHealth {
    pub name: String,
    pub status: HealthStatus,
    pub window_calls: usize,
    pub total_calls: u64,
    pub avg_latency_ms: f64,
    pub p95_latency_ms: f64,
    /// Percent of failed calls in the window.
    pub error_rate: f64,
    pub consecutive_failures: u32,
    pub circuit_state: Option<CircuitState>,
    /// True when `circuit_state` was inferred from call outcomes rather
    /// than read from a registered breaker.
    pub circuit_inferred: bool,
    pub last_success: Option<DateTime<Utc>>,
    pub last_failure: Option<DateTime<Utc>>,
}

/// Aggregated health of the whole process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemHealth {
    pub overall_status: HealthStatus,
    pub scheduler: SchedulerHealth,
    pub resources: ResourceHealth,
    pub apis: BTreeMap<String, ApiHealth>,
    /// Degradation status per tracked service.
    pub performance: BTreeMap<String, HealthStatus>,
    pub alerts: Vec<Alert>,
    pub version: String,
    pub uptime_secs: u64,
    pub timestamp: DateTime<Utc>,
}

impl SystemHealth {
    /// Ready to serve while not critical.
    pub fn is_ready(&self) -> bool {
        matches!(
            self.overall_status,
            HealthStatus::Healthy | HealthStatus::Degraded
        )
    }

    pub fn is_healthy(&self) -> bool {
        self.overall_status == HealthStatus::Healthy
    }
}

/// Worst-of aggregation: any critical sub-status is critical; otherwise any
/// degraded sub-status or warning-level alert is degraded; otherwise healthy.
pub fn aggregate_status(statuses: &[HealthStatus], alerts: &[Alert]) -> HealthStatus {
    if statuses.contains(&HealthStatus::Critical) {
        return HealthStatus::Critical;
    }
    if statuses.contains(&HealthStatus::Degraded)
        || alerts.iter().any(|a| a.level >= AlertLevel::Warning)
    {
        return HealthStatus::Degraded;
    }
    HealthStatus::Healthy
}

/// Format bytes into human-readable string.
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    const TB: u64 = GB * 1024;

    if bytes >= TB {
        format!("{:.2} TB", bytes as f64 / TB as f64)
    } else if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worst() {
        use HealthStatus::*;
        assert_eq!(Healthy.worst(Degraded), Degraded);
        assert_eq!(Critical.worst(Degraded), Critical);
        assert_eq!(Unknown.worst(Healthy), Healthy);
        assert_eq!(Healthy.worst(Unknown), Healthy);
        assert_eq!(HealthStatus::worst_of([]), Unknown);
        assert_eq!(HealthStatus::worst_of([Healthy, Critical, Degraded]), Critical);
    }

    #[test]
    fn test_aggregate_status() {
        use HealthStatus::*;
        assert_eq!(aggregate_status(&[Healthy, Unknown], &[]), Healthy);
        assert_eq!(aggregate_status(&[Healthy, Degraded], &[]), Degraded);
        assert_eq!(aggregate_status(&[Degraded, Critical], &[]), Critical);
        assert_eq!(
            aggregate_status(&[Healthy], &[Alert::warning("x", "y")]),
            Degraded
        );
        assert_eq!(aggregate_status(&[Healthy], &[Alert::info("x", "y")]), Healthy);
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(1024), "1.00 KB");
        assert_eq!(format_bytes(1536 * 1024 * 1024), "1.50 GB");
    }
}
