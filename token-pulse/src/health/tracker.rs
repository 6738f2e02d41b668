//! Execution trackers feeding the health monitor.
//!
//! [`ApiCallTracker`] keeps a rolling window of call outcomes per external
//! dependency. [`SchedulerTracker`] records group executions and the jobs
//! currently in flight, which is what the stuck-job detector inspects.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::types::StuckJob;
use crate::error::ErrorKind;

const DEFAULT_API_WINDOW: usize = 100;
const DEFAULT_EXECUTION_HISTORY: usize = 50;

/// Outcome of one call to an external dependency.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiCallRecord {
    pub latency_ms: f64,
    pub success: bool,
    pub error_kind: Option<ErrorKind>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct ApiWindow {
    calls: VecDeque<ApiCallRecord>,
    consecutive_failures: u32,
    total_calls: u64,
    total_failures: u64,
    last_success: Option<DateTime<Utc>>,
    last_failure: Option<DateTime<Utc>>,
}

/// Statistics over the rolling window of one dependency.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiCallSummary {
    pub name: String,
    pub window_calls: usize,
    pub total_calls: u64,
    pub total_failures: u64,
    pub avg_latency_ms: f64,
    pub p95_latency_ms: f64,
    /// Percent of failed calls in the window.
    pub error_rate: f64,
    pub consecutive_failures: u32,
    pub last_success: Option<DateTime<Utc>>,
    pub last_failure: Option<DateTime<Utc>>,
}

/// Rolling record of external call outcomes.
#[derive(Debug)]
pub struct ApiCallTracker {
    windows: DashMap<String, ApiWindow>,
    window_size: usize,
}

impl ApiCallTracker {
    pub fn new(window_size: usize) -> Self {
        Self {
            windows: DashMap::new(),
            window_size: window_size.max(1),
        }
    }

    pub fn record_success(&self, name: &str, latency: Duration) {
        self.record(name, latency, None);
    }

    pub fn record_failure(&self, name: &str, latency: Duration, kind: ErrorKind) {
        self.record(name, latency, Some(kind));
    }

    fn record(&self, name: &str, latency: Duration, error_kind: Option<ErrorKind>) {
        let now = Utc::now();
        let success = error_kind.is_none();
        let mut window = self.windows.entry(name.to_string()).or_default();

        if window.calls.len() >= self.window_size {
            window.calls.pop_front();
        }
        window.calls.push_back(ApiCallRecord {
            latency_ms: latency.as_secs_f64() * 1000.0,
            success,
            error_kind,
            timestamp: now,
        });
        window.total_calls += 1;
        if success {
            window.consecutive_failures = 0;
            window.last_success = Some(now);
        } else {
            window.consecutive_failures += 1;
            window.total_failures += 1;
            window.last_failure = Some(now);
        }
    }

    pub fn summary(&self, name: &str) -> Option<ApiCallSummary> {
        let window = self.windows.get(name)?;
        let n = window.calls.len();

        let mut latencies: Vec<f64> = window.calls.iter().map(|c| c.latency_ms).collect();
        latencies.sort_by(|a, b| a.total_cmp(b));
        let avg_latency_ms = if n == 0 {
            0.0
        } else {
            latencies.iter().sum::<f64>() / n as f64
        };
        let failures = window.calls.iter().filter(|c| !c.success).count();

        Some(ApiCallSummary {
            name: name.to_string(),
            window_calls: n,
            total_calls: window.total_calls,
            total_failures: window.total_failures,
            avg_latency_ms,
            p95_latency_ms: percentile(&latencies, 95.0),
            error_rate: if n == 0 {
                0.0
            } else {
                failures as f64 / n as f64 * 100.0
            },
            consecutive_failures: window.consecutive_failures,
            last_success: window.last_success,
            last_failure: window.last_failure,
        })
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.windows.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}

impl Default for ApiCallTracker {
    fn default() -> Self {
        Self::new(DEFAULT_API_WINDOW)
    }
}

/// Nearest-rank percentile of sorted values.
fn percentile(sorted: &[f64], pct: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = ((pct / 100.0) * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

/// One finished group execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobExecution {
    pub group: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub processed: usize,
    pub failed: usize,
}

impl JobExecution {
    /// An execution fails when it had work and none of it succeeded.
    pub fn is_failure(&self) -> bool {
        self.processed == 0 && self.failed > 0
    }
}

type InFlightMap = DashMap<u64, InFlightJob>;

/// Handle for a started job, passed back to [`SchedulerTracker::job_finished`].
///
/// Dropping the handle without finishing it (an early return, a panic in
/// the job) removes the job from the in-flight set without recording an
/// execution.
#[derive(Debug)]
pub struct JobHandle {
    id: u64,
    group: String,
    started_at: DateTime<Utc>,
    in_flight: Weak<InFlightMap>,
}

impl Drop for JobHandle {
    fn drop(&mut self) {
        let Some(in_flight) = self.in_flight.upgrade() else {
            return;
        };
        if in_flight.remove(&self.id).is_some() {
            warn!(group = %self.group, job_id = self.id, "Job ended without being finished");
        }
    }
}

impl JobHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn group(&self) -> &str {
        &self.group
    }
}

#[derive(Debug, Clone)]
struct InFlightJob {
    group: String,
    started_at: DateTime<Utc>,
}

#[derive(Debug)]
struct GroupRecord {
    expected_interval: Duration,
    history: VecDeque<JobExecution>,
    total_executions: u64,
    failed_executions: u64,
    last_started: Option<DateTime<Utc>>,
}

impl GroupRecord {
    fn new(expected_interval: Duration) -> Self {
        Self {
            expected_interval,
            history: VecDeque::with_capacity(DEFAULT_EXECUTION_HISTORY),
            total_executions: 0,
            failed_executions: 0,
            last_started: None,
        }
    }
}

/// Snapshot of one group's execution record.
#[derive(Debug, Clone, Serialize)]
pub struct GroupSnapshot {
    pub group: String,
    pub expected_interval: Duration,
    pub recent: Vec<JobExecution>,
    pub total_executions: u64,
    pub failed_executions: u64,
    pub last_started: Option<DateTime<Utc>>,
    pub in_flight: usize,
}

/// Records scheduler group executions.
#[derive(Debug)]
pub struct SchedulerTracker {
    groups: DashMap<String, GroupRecord>,
    in_flight: Arc<InFlightMap>,
    next_id: AtomicU64,
    stuck_threshold_secs: AtomicU64,
}

impl SchedulerTracker {
    pub fn new(stuck_threshold: Duration) -> Self {
        Self {
            groups: DashMap::new(),
            in_flight: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(1),
            stuck_threshold_secs: AtomicU64::new(stuck_threshold.as_secs()),
        }
    }

    /// Declare a group and the interval it is expected to run at.
    pub fn register_group(&self, group: &str, expected_interval: Duration) {
        self.groups
            .entry(group.to_string())
            .and_modify(|g| g.expected_interval = expected_interval)
            .or_insert_with(|| GroupRecord::new(expected_interval));
    }

    pub fn job_started(&self, group: &str) -> JobHandle {
        let now = Utc::now();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.in_flight.insert(
            id,
            InFlightJob {
                group: group.to_string(),
                started_at: now,
            },
        );
        if let Some(mut record) = self.groups.get_mut(group) {
            record.last_started = Some(now);
        }
        JobHandle {
            id,
            group: group.to_string(),
            started_at: now,
            in_flight: Arc::downgrade(&self.in_flight),
        }
    }

    pub fn job_finished(&self, handle: JobHandle, processed: usize, failed: usize) -> JobExecution {
        self.in_flight.remove(&handle.id);
        let finished_at = Utc::now();
        let execution = JobExecution {
            duration_ms: (finished_at - handle.started_at).num_milliseconds().max(0) as u64,
            group: handle.group.clone(),
            started_at: handle.started_at,
            finished_at,
            processed,
            failed,
        };
        self.record_execution(execution.clone());
        execution
    }

    /// Record an execution measured elsewhere.
    pub fn record_execution(&self, execution: JobExecution) {
        let mut record = self
            .groups
            .entry(execution.group.clone())
            .or_insert_with(|| GroupRecord::new(Duration::ZERO));
        if record.history.len() >= DEFAULT_EXECUTION_HISTORY {
            record.history.pop_front();
        }
        record.total_executions += 1;
        if execution.is_failure() {
            record.failed_executions += 1;
        }
        if record.last_started.is_none_or(|ts| ts < execution.started_at) {
            record.last_started = Some(execution.started_at);
        }
        record.history.push_back(execution);
    }

    pub fn set_stuck_threshold(&self, threshold: Duration) {
        self.stuck_threshold_secs
            .store(threshold.as_secs(), Ordering::Relaxed);
    }

    pub fn stuck_threshold(&self) -> Duration {
        Duration::from_secs(self.stuck_threshold_secs.load(Ordering::Relaxed))
    }

    /// Jobs in flight for longer than the stuck threshold. They are reported,
    /// never cancelled.
    pub fn stuck_jobs(&self, now: DateTime<Utc>) -> Vec<StuckJob> {
        let threshold = self.stuck_threshold_secs.load(Ordering::Relaxed) as i64;
        let mut stuck: Vec<StuckJob> = self
            .in_flight
            .iter()
            .filter_map(|entry| {
                let age_secs = (now - entry.started_at).num_seconds();
                (age_secs > threshold).then(|| StuckJob {
                    id: *entry.key(),
                    group: entry.group.clone(),
                    started_at: entry.started_at,
                    age_secs,
                })
            })
            .collect();
        stuck.sort_by_key(|job| job.id);
        stuck
    }

    pub fn in_flight_count(&self, group: &str) -> usize {
        self.in_flight.iter().filter(|e| e.group == group).count()
    }

    pub fn groups(&self) -> Vec<String> {
        let mut groups: Vec<String> = self.groups.iter().map(|e| e.key().clone()).collect();
        groups.sort();
        groups
    }

    pub fn snapshot(&self, group: &str) -> Option<GroupSnapshot> {
        let in_flight = self.in_flight_count(group);
        let record = self.groups.get(group)?;
        Some(GroupSnapshot {
            group: group.to_string(),
            expected_interval: record.expected_interval,
            recent: record.history.iter().cloned().collect(),
            total_executions: record.total_executions,
            failed_executions: record.failed_executions,
            last_started: record.last_started,
            in_flight,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_window_stats() {
        let tracker = ApiCallTracker::new(10);
        for ms in 1..=9 {
            tracker.record_success("price_api", Duration::from_millis(ms * 10));
        }
        tracker.record_failure("price_api", Duration::from_millis(1000), ErrorKind::ServerError);

        let summary = tracker.summary("price_api").unwrap();
        assert_eq!(summary.window_calls, 10);
        assert_eq!(summary.consecutive_failures, 1);
        assert!((summary.error_rate - 10.0).abs() < 1e-9);
        assert!((summary.p95_latency_ms - 1000.0).abs() < 1e-6);
        assert!((summary.avg_latency_ms - 145.0).abs() < 1e-6);
        assert!(tracker.summary("other").is_none());
    }

    #[test]
    fn test_api_window_rolls() {
        let tracker = ApiCallTracker::new(3);
        tracker.record_failure("a", Duration::ZERO, ErrorKind::Timeout);
        for _ in 0..3 {
            tracker.record_success("a", Duration::from_millis(5));
        }
        let summary = tracker.summary("a").unwrap();
        assert_eq!(summary.window_calls, 3);
        assert_eq!(summary.error_rate, 0.0);
        assert_eq!(summary.total_calls, 4);
        assert_eq!(summary.total_failures, 1);
        assert_eq!(summary.consecutive_failures, 0);
    }

    #[test]
    fn test_percentile() {
        assert_eq!(percentile(&[], 95.0), 0.0);
        assert_eq!(percentile(&[1.0], 95.0), 1.0);
        let values: Vec<f64> = (1..=100).map(|v| v as f64).collect();
        assert_eq!(percentile(&values, 95.0), 95.0);
    }

    #[test]
    fn test_job_lifecycle() {
        let tracker = SchedulerTracker::new(Duration::from_secs(600));
        tracker.register_group("hot", Duration::from_secs(30));

        let job = tracker.job_started("hot");
        assert_eq!(tracker.in_flight_count("hot"), 1);
        let execution = tracker.job_finished(job, 8, 2);
        assert!(!execution.is_failure());
        assert_eq!(tracker.in_flight_count("hot"), 0);

        let snapshot = tracker.snapshot("hot").unwrap();
        assert_eq!(snapshot.total_executions, 1);
        assert_eq!(snapshot.recent[0].processed, 8);
        assert_eq!(snapshot.expected_interval, Duration::from_secs(30));
    }

    #[test]
    fn test_dropped_handle_leaves_in_flight() {
        let tracker = SchedulerTracker::new(Duration::ZERO);
        tracker.register_group("hot", Duration::from_secs(30));

        let job = tracker.job_started("hot");
        assert_eq!(tracker.in_flight_count("hot"), 1);
        drop(job);

        assert_eq!(tracker.in_flight_count("hot"), 0);
        assert!(tracker.stuck_jobs(Utc::now() + chrono::Duration::hours(1)).is_empty());
        assert_eq!(tracker.snapshot("hot").unwrap().total_executions, 0);
    }

    #[tokio::test]
    async fn test_panicking_job_leaves_in_flight() {
        let tracker = Arc::new(SchedulerTracker::new(Duration::ZERO));
        let job = tracker.job_started("cold");

        let result = tokio::spawn(async move {
            if job.id() > 0 {
                panic!("job failed");
            }
            drop(job);
        })
        .await;
        assert!(result.unwrap_err().is_panic());

        assert_eq!(tracker.in_flight_count("cold"), 0);
        assert!(tracker.stuck_jobs(Utc::now() + chrono::Duration::hours(1)).is_empty());
    }

    #[test]
    fn test_stuck_jobs() {
        let tracker = SchedulerTracker::new(Duration::from_secs(60));
        let job = tracker.job_started("cold");
        let now = Utc::now();

        assert!(tracker.stuck_jobs(now).is_empty());
        let stuck = tracker.stuck_jobs(now + chrono::Duration::seconds(120));
        assert_eq!(stuck.len(), 1);
        assert_eq!(stuck[0].group, "cold");
        assert_eq!(stuck[0].id, job.id());

        tracker.job_finished(job, 0, 0);
        assert!(tracker.stuck_jobs(now + chrono::Duration::seconds(120)).is_empty());
    }

    #[test]
    fn test_failed_execution_counted() {
        let tracker = SchedulerTracker::new(Duration::from_secs(60));
        let job = tracker.job_started("hot");
        tracker.job_finished(job, 0, 5);
        assert_eq!(tracker.snapshot("hot").unwrap().failed_executions, 1);
    }
}
