//! Periodic polling of one token group.
//!
//! Each execution selects a batch from the group's token list, fetches the
//! batch in parallel with bounded concurrency (each fetch through the
//! `price_api` circuit breaker and retry manager), then applies the results
//! to the repository one token at a time. A failed token is logged and
//! skipped; it never aborts the batch.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::fetcher::{MarketPair, PriceFetcher};
use super::repository::{TokenGroup, TokenRepository};
use crate::alerting::{Alert, AlertManager};
use crate::degradation::{DegradationDetector, MetricKind};
use crate::health::{ApiCallTracker, SchedulerTracker};
use crate::load::{LoadBasedProcessor, features};
use crate::resilience::{CircuitState, ResilienceRegistry};
use crate::{Error, Result};

/// Name of the breaker, retry manager and API tracker entry for the price API.
pub const PRICE_API: &str = "price_api";

/// How long shutdown waits for an in-flight execution.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Settings for one group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupConfig {
    pub interval_secs: u64,
    /// Tokens per execution before load adjustment.
    pub batch_size: usize,
    /// Parallel fetches per execution.
    pub concurrency: usize,
}

impl GroupConfig {
    pub fn hot() -> Self {
        Self {
            interval_secs: 30,
            batch_size: 50,
            concurrency: 4,
        }
    }

    pub fn cold() -> Self {
        Self {
            interval_secs: 120,
            batch_size: 100,
            concurrency: 3,
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn validate(&self, group: TokenGroup) -> Result<()> {
        if self.interval_secs == 0 {
            return Err(Error::config(format!("scheduler.{group}.interval_secs must be > 0")));
        }
        if self.batch_size == 0 {
            return Err(Error::config(format!("scheduler.{group}.batch_size must be > 0")));
        }
        if self.concurrency == 0 {
            return Err(Error::config(format!("scheduler.{group}.concurrency must be > 0")));
        }
        Ok(())
    }
}

/// Shared collaborators of every group runner.
#[derive(Clone)]
pub struct SchedulerContext {
    pub registry: Arc<ResilienceRegistry>,
    pub load: Arc<LoadBasedProcessor>,
    pub detector: Arc<DegradationDetector>,
    pub alerts: Arc<AlertManager>,
    pub jobs: Arc<SchedulerTracker>,
    pub api_calls: Arc<ApiCallTracker>,
    pub fetcher: Arc<dyn PriceFetcher>,
    pub repository: Arc<dyn TokenRepository>,
}

/// Outcome of one group execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GroupReport {
    pub group: String,
    pub selected: usize,
    /// Tokens fetched and applied.
    pub processed: usize,
    /// Tokens whose stored state changed.
    pub updated: usize,
    pub failed: usize,
    /// Failures that were rejected by an open circuit without a call.
    pub circuit_rejected: usize,
    pub duration_ms: u64,
}

struct FetchOutcome {
    index: usize,
    key: String,
    result: Result<Vec<MarketPair>>,
    /// Wall time of the guarded call, retries included.
    latency: Duration,
}

impl FetchOutcome {
    /// Whether the call reached the API.
    fn attempted(&self) -> bool {
        !matches!(&self.result, Err(e) if e.is_circuit_open())
    }
}

/// Clears the running flag when an execution ends.
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Drives one token group.
pub struct GroupRunner {
    group: TokenGroup,
    config: RwLock<GroupConfig>,
    ctx: SchedulerContext,
    cursor: AtomicUsize,
    running: AtomicBool,
}

impl GroupRunner {
    pub fn new(group: TokenGroup, config: GroupConfig, ctx: SchedulerContext) -> Self {
        ctx.jobs.register_group(&group.to_string(), config.interval());
        Self {
            group,
            config: RwLock::new(config),
            ctx,
            cursor: AtomicUsize::new(0),
            running: AtomicBool::new(false),
        }
    }

    pub fn group(&self) -> TokenGroup {
        self.group
    }

    pub fn config(&self) -> GroupConfig {
        self.config.read().clone()
    }

    pub fn apply_config(&self, config: GroupConfig) {
        self.ctx
            .jobs
            .register_group(&self.group.to_string(), config.interval());
        *self.config.write() = config;
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn feature(&self) -> &'static str {
        match self.group {
            TokenGroup::Hot => features::HOT_TOKENS,
            TokenGroup::Cold => features::COLD_TOKENS,
        }
    }

    /// Run one execution.
    ///
    /// Returns `None` when the execution was skipped: the group is disabled
    /// by load shedding or the previous execution is still running.
    pub async fn run_once(&self) -> Option<GroupReport> {
        let load = &self.ctx.load;
        if !load.is_feature_enabled(self.feature()) || !load.is_feature_enabled(features::PRICE_FETCH)
        {
            debug!(group = %self.group, level = %load.current_level(), "Group disabled by load shedding");
            return None;
        }

        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            warn!(group = %self.group, "Previous execution still running, skipping tick");
            return None;
        }
        let _guard = RunningGuard(&self.running);

        Some(self.execute().await)
    }

    async fn execute(&self) -> GroupReport {
        let started = Instant::now();
        let group_name = self.group.to_string();
        let handle = self.ctx.jobs.job_started(&group_name);
        let config = self.config();

        let mut report = GroupReport {
            group: group_name.clone(),
            ..Default::default()
        };

        let tokens = match self.ctx.repository.tokens_for_group(self.group).await {
            Ok(tokens) => tokens,
            Err(e) => {
                warn!(group = %self.group, error = %e, "Failed to load token list");
                report.failed = 1;
                report.duration_ms = started.elapsed().as_millis() as u64;
                self.ctx.jobs.job_finished(handle, 0, 1);
                return report;
            }
        };

        let batch_size = self.ctx.load.get_adjusted_batch_size(config.batch_size);
        let batch = select_batch(&tokens, batch_size, &self.cursor);
        report.selected = batch.len();

        let outcomes = self.fetch_all(batch, config.concurrency).await;
        self.record_api_metrics(&outcomes).await;

        // Apply sequentially in batch order.
        for outcome in outcomes {
            match outcome.result {
                Ok(pairs) => match self.ctx.repository.apply(&outcome.key, &pairs).await {
                    Ok(changed) => {
                        report.processed += 1;
                        if changed {
                            report.updated += 1;
                        }
                    }
                    Err(e) => {
                        report.failed += 1;
                        warn!(group = %self.group, token = %outcome.key, error = %e, "Failed to apply token update");
                    }
                },
                Err(e) => {
                    report.failed += 1;
                    if e.is_circuit_open() {
                        report.circuit_rejected += 1;
                    }
                    warn!(
                        group = %self.group,
                        token = %outcome.key,
                        kind = %e.kind(),
                        error = %e,
                        "Skipping token this cycle"
                    );
                }
            }
        }

        self.check_circuit(&report).await;

        report.duration_ms = started.elapsed().as_millis() as u64;
        self.ctx
            .jobs
            .job_finished(handle, report.processed, report.failed);

        info!(
            group = %self.group,
            selected = report.selected,
            processed = report.processed,
            updated = report.updated,
            failed = report.failed,
            duration_ms = report.duration_ms,
            "Group execution finished"
        );
        report
    }

    async fn fetch_all(&self, batch: Vec<String>, concurrency: usize) -> Vec<FetchOutcome> {
        let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
        let mut tasks = JoinSet::new();

        for (index, key) in batch.into_iter().enumerate() {
            let semaphore = semaphore.clone();
            let registry = self.ctx.registry.clone();
            let fetcher = self.ctx.fetcher.clone();
            let api_calls = self.ctx.api_calls.clone();

            tasks.spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return FetchOutcome {
                        index,
                        result: Err(Error::Other("fetch semaphore closed".to_string())),
                        key,
                        latency: Duration::ZERO,
                    };
                };

                let started = Instant::now();
                let result = registry
                    .call_guarded(PRICE_API, || {
                        let fetcher = fetcher.clone();
                        let key = key.clone();
                        async move { fetcher.fetch(&key).await.map_err(Error::from) }
                    })
                    .await;
                let latency = started.elapsed();

                match &result {
                    Ok(_) => api_calls.record_success(PRICE_API, latency),
                    // Rejected calls never reached the API.
                    Err(e) if e.is_circuit_open() => {}
                    Err(e) => api_calls.record_failure(PRICE_API, latency, e.kind()),
                }

                FetchOutcome {
                    index,
                    key,
                    result,
                    latency,
                }
            });
        }

        let mut outcomes = Vec::with_capacity(tasks.len());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => warn!(group = %self.group, error = %e, "Fetch task panicked"),
            }
        }
        outcomes.sort_by_key(|o| o.index);
        outcomes
    }

    /// Feed this execution's mean latency and error rate to the degradation
    /// detector. Calls rejected by an open circuit are left out of both.
    async fn record_api_metrics(&self, outcomes: &[FetchOutcome]) {
        if !self.ctx.load.is_feature_enabled(features::DEGRADATION_ANALYSIS) {
            return;
        }
        let attempted: Vec<&FetchOutcome> = outcomes.iter().filter(|o| o.attempted()).collect();
        if attempted.is_empty() {
            return;
        }

        let n = attempted.len() as f64;
        let latency_ms = attempted
            .iter()
            .map(|o| o.latency.as_secs_f64() * 1000.0)
            .sum::<f64>()
            / n;
        let failures = attempted.iter().filter(|o| o.result.is_err()).count();
        let error_rate = failures as f64 / n * 100.0;
        let now = Utc::now();

        let detector = &self.ctx.detector;
        detector
            .record_metric(PRICE_API, MetricKind::ResponseTime, latency_ms, now)
            .await;
        detector
            .record_metric(PRICE_API, MetricKind::ErrorRate, error_rate, now)
            .await;
    }

    /// Alert while the price API breaker is open. Cooldown absorbs repeats.
    async fn check_circuit(&self, report: &GroupReport) {
        let Some(breaker) = self.ctx.registry.existing_breaker(PRICE_API) else {
            return;
        };
        if breaker.state() != CircuitState::Open {
            return;
        }
        let stats = breaker.stats();
        let alert = Alert::critical(
            format!("circuit_breaker.{PRICE_API}"),
            "Price API circuit breaker is open",
        )
        .with_context("group", report.group.clone())
        .with_context("rejected", report.circuit_rejected)
        .with_context("failure_count", stats.failure_count)
        .with_context("retry_after_ms", stats.retry_after_ms);
        self.ctx.alerts.send(alert).await;
    }

    /// Tick until cancelled. Each tick spawns an execution; a tick that finds
    /// the previous execution still running is skipped.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!(group = %self.group, "Group runner started");
        let mut inflight = JoinSet::new();
        let group_name = self.group.to_string();

        loop {
            let interval = self.ctx.load.get_adjusted_interval(self.config().interval());
            // Staleness is judged against the interval actually in effect.
            self.ctx.jobs.register_group(&group_name, interval);

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }

            while inflight.try_join_next().is_some() {}
            let runner = self.clone();
            inflight.spawn(async move { runner.run_once().await });
        }

        if tokio::time::timeout(SHUTDOWN_GRACE, async {
            while inflight.join_next().await.is_some() {}
        })
        .await
        .is_err()
        {
            warn!(group = %self.group, "Execution still running at shutdown, abandoning");
        }
        info!(group = %self.group, "Group runner stopped");
    }
}

/// Take up to `size` tokens starting at the cursor, wrapping around, and
/// advance the cursor so successive batches cover the whole list.
pub fn select_batch(tokens: &[String], size: usize, cursor: &AtomicUsize) -> Vec<String> {
    if tokens.is_empty() || size == 0 {
        return Vec::new();
    }
    let len = tokens.len();
    let take = size.min(len);
    let start = cursor.load(Ordering::Relaxed) % len;
    cursor.store((start + take) % len, Ordering::Relaxed);
    tokens.iter().cycle().skip(start).take(take).cloned().collect()
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;

    use async_trait::async_trait;

    use super::*;
    use crate::alerting::testing::RecordingChannel;
    use crate::alerting::{AlertLevel, AlertManagerConfig, AlertRule, ChannelKind};
    use crate::degradation::DegradationConfig;
    use crate::error::{ErrorKind, FetchError};
    use crate::load::{LoadConfig, StaticMetricsProvider};
    use crate::resilience::{CircuitBreakerConfig, RetryPolicy};
    use crate::scheduler::repository::InMemoryTokenRepository;

    type FetchFn = dyn Fn(&str) -> std::result::Result<Vec<MarketPair>, FetchError> + Send + Sync;

    struct FnFetcher {
        f: Box<FetchFn>,
        calls: AtomicU32,
    }

    impl FnFetcher {
        fn new(
            f: impl Fn(&str) -> std::result::Result<Vec<MarketPair>, FetchError> + Send + Sync + 'static,
        ) -> Arc<Self> {
            Arc::new(Self {
                f: Box::new(f),
                calls: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl PriceFetcher for FnFetcher {
        async fn fetch(&self, key: &str) -> std::result::Result<Vec<MarketPair>, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            (self.f)(key)
        }
    }

    fn pair(price: f64) -> MarketPair {
        MarketPair {
            pair_address: "0x1".to_string(),
            dex_id: "dex".to_string(),
            base_symbol: "TOK".to_string(),
            quote_symbol: "USDC".to_string(),
            price_usd: Some(price),
            liquidity_usd: Some(1000.0),
            volume_24h: None,
        }
    }

    struct Harness {
        ctx: SchedulerContext,
        repo: Arc<InMemoryTokenRepository>,
        channel: Arc<RecordingChannel>,
        provider: Arc<StaticMetricsProvider>,
    }

    fn harness(fetcher: Arc<dyn PriceFetcher>, keys: &[&str]) -> Harness {
        let channel = RecordingChannel::new(ChannelKind::Log);
        let alerts = Arc::new(
            AlertManager::new(AlertManagerConfig {
                rules: vec![AlertRule::new("*", AlertLevel::Info)],
                escalation_rules: Vec::new(),
                threshold_rules: Vec::new(),
            })
            .with_channel(channel.clone()),
        );
        let provider = Arc::new(StaticMetricsProvider::new(10.0, 10.0));
        let repo = Arc::new(InMemoryTokenRepository::with_tokens(
            TokenGroup::Hot,
            keys.iter().copied(),
        ));
        let ctx = SchedulerContext {
            registry: Arc::new(ResilienceRegistry::new(
                CircuitBreakerConfig {
                    failure_threshold: 2,
                    ..Default::default()
                },
                RetryPolicy::no_retry(),
            )),
            load: Arc::new(LoadBasedProcessor::new(provider.clone(), LoadConfig::default())),
            detector: Arc::new(DegradationDetector::new(
                DegradationConfig::default(),
                alerts.clone(),
            )),
            alerts,
            jobs: Arc::new(SchedulerTracker::new(Duration::from_secs(600))),
            api_calls: Arc::new(ApiCallTracker::default()),
            fetcher,
            repository: repo.clone(),
        };
        Harness {
            ctx,
            repo,
            channel,
            provider,
        }
    }

    fn hot_config(batch_size: usize, concurrency: usize) -> GroupConfig {
        GroupConfig {
            interval_secs: 30,
            batch_size,
            concurrency,
        }
    }

    #[test]
    fn test_select_batch_rotates() {
        let tokens: Vec<String> = ["a", "b", "c", "d", "e"].iter().map(|s| s.to_string()).collect();
        let cursor = AtomicUsize::new(0);
        assert_eq!(select_batch(&tokens, 2, &cursor), vec!["a", "b"]);
        assert_eq!(select_batch(&tokens, 2, &cursor), vec!["c", "d"]);
        assert_eq!(select_batch(&tokens, 2, &cursor), vec!["e", "a"]);
        assert_eq!(select_batch(&tokens, 10, &cursor).len(), 5);
        assert!(select_batch(&[], 3, &cursor).is_empty());
    }

    #[test]
    fn test_group_config_validate() {
        assert!(GroupConfig::hot().validate(TokenGroup::Hot).is_ok());
        assert!(hot_config(0, 1).validate(TokenGroup::Hot).is_err());
        assert!(hot_config(1, 0).validate(TokenGroup::Hot).is_err());
    }

    #[tokio::test]
    async fn test_failed_token_is_skipped() {
        let fetcher = FnFetcher::new(|key| {
            if key == "bad" {
                Err(FetchError::new(ErrorKind::ClientError, key, "HTTP 400"))
            } else {
                Ok(vec![pair(1.5)])
            }
        });
        let h = harness(fetcher.clone(), &["a", "bad", "c"]);
        let runner = GroupRunner::new(TokenGroup::Hot, hot_config(10, 2), h.ctx.clone());

        let report = runner.run_once().await.unwrap();
        assert_eq!(report.selected, 3);
        assert_eq!(report.processed, 2);
        assert_eq!(report.updated, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(report.circuit_rejected, 0);
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 3);
        assert_eq!(h.repo.get("a").unwrap().price_usd, Some(1.5));
        assert!(h.repo.get("bad").unwrap().updated_at.is_none());

        let snapshot = h.ctx.jobs.snapshot("hot").unwrap();
        assert_eq!(snapshot.total_executions, 1);
        assert_eq!(snapshot.failed_executions, 0);
        assert!(!runner.is_running());

        let summary = h.ctx.api_calls.summary(PRICE_API).unwrap();
        assert_eq!(summary.total_calls, 3);
        assert_eq!(summary.total_failures, 1);
    }

    #[tokio::test]
    async fn test_overlapping_tick_is_skipped() {
        let fetcher = FnFetcher::new(|_| Ok(Vec::new()));
        let h = harness(fetcher, &["a"]);
        let runner = GroupRunner::new(TokenGroup::Hot, hot_config(10, 1), h.ctx);

        runner.running.store(true, Ordering::Release);
        assert!(runner.run_once().await.is_none());
        runner.running.store(false, Ordering::Release);
        assert!(runner.run_once().await.is_some());
    }

    #[tokio::test]
    async fn test_cold_group_disabled_under_minimal_load() {
        let fetcher = FnFetcher::new(|_| Ok(Vec::new()));
        let h = harness(fetcher.clone(), &[]);
        h.repo.insert("z", TokenGroup::Cold);
        let runner = GroupRunner::new(TokenGroup::Cold, GroupConfig::cold(), h.ctx.clone());

        h.provider.set_cpu(99.0);
        for _ in 0..3 {
            h.ctx.load.process_load_adjustment();
        }
        assert!(!h.ctx.load.is_feature_enabled(features::COLD_TOKENS));
        assert!(runner.run_once().await.is_none());
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_open_circuit_rejects_and_alerts_once() {
        let fetcher = FnFetcher::new(|key| Err(FetchError::new(ErrorKind::ServerError, key, "HTTP 500")));
        let h = harness(fetcher.clone(), &["a", "b", "c", "d"]);
        let runner = GroupRunner::new(TokenGroup::Hot, hot_config(4, 1), h.ctx.clone());

        let report = runner.run_once().await.unwrap();
        assert_eq!(report.failed, 4);
        assert_eq!(report.circuit_rejected, 2);
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);
        assert!(runner.run_once().await.is_some());
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);

        let critical: Vec<_> = h
            .channel
            .alerts
            .lock()
            .iter()
            .filter(|a| a.component == "circuit_breaker.price_api")
            .cloned()
            .collect();
        assert_eq!(critical.len(), 1);
        assert_eq!(critical[0].level, AlertLevel::Critical);

        // The whole execution failed.
        assert_eq!(h.ctx.jobs.snapshot("hot").unwrap().failed_executions, 2);
    }

    struct SlowFetcher {
        delay: Duration,
    }

    #[async_trait]
    impl PriceFetcher for SlowFetcher {
        async fn fetch(&self, _key: &str) -> std::result::Result<Vec<MarketPair>, FetchError> {
            tokio::time::sleep(self.delay).await;
            Ok(vec![pair(2.0)])
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_execution_latency_recorded_unsmoothed() {
        let h = harness(
            Arc::new(SlowFetcher {
                delay: Duration::from_millis(800),
            }),
            &["a", "b"],
        );
        for _ in 0..30 {
            h.ctx.api_calls.record_success(PRICE_API, Duration::from_millis(10));
        }
        let runner = GroupRunner::new(TokenGroup::Hot, hot_config(2, 2), h.ctx.clone());

        let report = runner.run_once().await.unwrap();
        assert_eq!(report.processed, 2);

        let recorded = h
            .ctx
            .detector
            .latest_value(PRICE_API, MetricKind::ResponseTime)
            .unwrap();
        assert!((800.0..900.0).contains(&recorded), "recorded {recorded}");
        assert_eq!(
            h.ctx.detector.latest_value(PRICE_API, MetricKind::ErrorRate),
            Some(0.0)
        );
        // The rolling window still averages in the older fast calls.
        assert!(h.ctx.api_calls.summary(PRICE_API).unwrap().avg_latency_ms < 100.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_cancel() {
        let fetcher = FnFetcher::new(|_| Ok(vec![pair(1.0)]));
        let h = harness(fetcher.clone(), &["a"]);
        let runner = Arc::new(GroupRunner::new(TokenGroup::Hot, hot_config(1, 1), h.ctx));
        let cancel = CancellationToken::new();

        let task = tokio::spawn(runner.clone().run(cancel.clone()));
        tokio::time::sleep(Duration::from_secs(95)).await;
        cancel.cancel();
        task.await.unwrap();

        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 3);
    }
}
