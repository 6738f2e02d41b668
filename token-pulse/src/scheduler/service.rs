//! Scheduler service: group runners plus the maintenance loop.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::repository::TokenGroup;
use super::runner::{GroupConfig, GroupRunner, SchedulerContext};
use crate::alerting::Alert;
use crate::health::{HealthMonitor, HealthStatus, SystemHealth};
use crate::load::{LoadAdjustment, LoadLevel, features};
use crate::{Error, Result};

/// Scheduler settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub hot: GroupConfig,
    pub cold: GroupConfig,
    /// Jobs running longer than this are reported as stuck.
    pub stuck_job_threshold_secs: u64,
    /// Period of load adjustment, health checks and history cleanup.
    pub maintenance_interval_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            hot: GroupConfig::hot(),
            cold: GroupConfig::cold(),
            stuck_job_threshold_secs: 600,
            maintenance_interval_secs: 15,
        }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> Result<()> {
        self.hot.validate(TokenGroup::Hot)?;
        self.cold.validate(TokenGroup::Cold)?;
        if self.stuck_job_threshold_secs == 0 {
            return Err(Error::config("scheduler.stuck_job_threshold_secs must be > 0"));
        }
        if self.maintenance_interval_secs == 0 {
            return Err(Error::config("scheduler.maintenance_interval_secs must be > 0"));
        }
        Ok(())
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.maintenance_interval_secs)
    }
}

/// Owns the group runners and drives periodic maintenance.
pub struct SchedulerService {
    ctx: SchedulerContext,
    health: Arc<HealthMonitor>,
    runners: Vec<Arc<GroupRunner>>,
    maintenance_interval_secs: AtomicU64,
    alert_retention_hours: AtomicU64,
    last_health: RwLock<Option<SystemHealth>>,
}

impl SchedulerService {
    pub fn new(
        config: SchedulerConfig,
        ctx: SchedulerContext,
        health: Arc<HealthMonitor>,
        alert_retention_hours: u64,
    ) -> Self {
        ctx.jobs
            .set_stuck_threshold(Duration::from_secs(config.stuck_job_threshold_secs));
        let runners = vec![
            Arc::new(GroupRunner::new(TokenGroup::Hot, config.hot.clone(), ctx.clone())),
            Arc::new(GroupRunner::new(TokenGroup::Cold, config.cold.clone(), ctx.clone())),
        ];
        Self {
            ctx,
            health,
            runners,
            maintenance_interval_secs: AtomicU64::new(config.maintenance_interval_secs),
            alert_retention_hours: AtomicU64::new(alert_retention_hours),
            last_health: RwLock::new(None),
        }
    }

    pub fn runner(&self, group: TokenGroup) -> Option<&Arc<GroupRunner>> {
        self.runners.iter().find(|r| r.group() == group)
    }

    /// Snapshot computed by the last maintenance pass.
    pub fn last_health(&self) -> Option<SystemHealth> {
        self.last_health.read().clone()
    }

    pub fn apply_config(&self, config: &SchedulerConfig, alert_retention_hours: u64) {
        for runner in &self.runners {
            let group_config = match runner.group() {
                TokenGroup::Hot => config.hot.clone(),
                TokenGroup::Cold => config.cold.clone(),
            };
            runner.apply_config(group_config);
        }
        self.ctx
            .jobs
            .set_stuck_threshold(Duration::from_secs(config.stuck_job_threshold_secs));
        self.maintenance_interval_secs
            .store(config.maintenance_interval_secs, Ordering::Relaxed);
        self.alert_retention_hours
            .store(alert_retention_hours, Ordering::Relaxed);
        info!("Scheduler settings reloaded");
    }

    /// One maintenance pass.
    pub async fn maintenance_once(&self) {
        let adjustment = self.ctx.load.process_load_adjustment();
        if adjustment.changed {
            self.ctx.alerts.send(load_change_alert(&adjustment)).await;
        }

        if self.ctx.load.is_feature_enabled(features::HEALTH_CHECKS) {
            // Stuck jobs are reported as part of the snapshot.
            let health = self.health.get_comprehensive_health().await;
            match health.overall_status {
                HealthStatus::Healthy | HealthStatus::Unknown => {
                    debug!(status = %health.overall_status, "System health")
                }
                status => warn!(
                    status = %status,
                    alerts = health.alerts.len(),
                    stuck_jobs = health.scheduler.stuck_jobs.len(),
                    "System health"
                ),
            }
            *self.last_health.write() = Some(health);
        } else {
            for job in self.ctx.jobs.stuck_jobs(Utc::now()) {
                let alert = Alert::error(
                    format!("scheduler.{}", job.group),
                    "scheduler job exceeded stuck threshold",
                )
                .with_context("job_id", job.id)
                .with_context("age_secs", job.age_secs);
                self.ctx.alerts.send(alert).await;
            }
        }

        let retention = self.alert_retention_hours.load(Ordering::Relaxed) as i64;
        let removed = self
            .ctx
            .alerts
            .cleanup_history(chrono::Duration::hours(retention));
        let pruned = self
            .ctx
            .detector
            .prune_older_than(Utc::now() - chrono::Duration::hours(retention));
        if removed > 0 || pruned > 0 {
            debug!(alert_history = removed, metric_samples = pruned, "Pruned old state");
        }
    }

    /// Run every group and the maintenance loop until cancelled.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!(groups = self.runners.len(), "Scheduler started");
        let mut tasks = JoinSet::new();
        for runner in &self.runners {
            tasks.spawn(runner.clone().run(cancel.child_token()));
        }

        loop {
            let interval =
                Duration::from_secs(self.maintenance_interval_secs.load(Ordering::Relaxed).max(1));
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => self.maintenance_once().await,
            }
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "Group runner task failed");
            }
        }
        info!("Scheduler stopped");
    }
}

fn load_change_alert(adjustment: &LoadAdjustment) -> Alert {
    let message = format!("Load level changed to {}", adjustment.new_level);
    let alert = match adjustment.new_level {
        LoadLevel::Minimal => Alert::error("performance.load", message),
        _ if adjustment.new_level > adjustment.previous_level => {
            Alert::warning("performance.load", message)
        }
        _ => Alert::info("performance.load", message),
    };
    let mut alert = alert
        .with_context("previous_level", adjustment.previous_level.to_string())
        .with_context("processing_factor", adjustment.processing_factor)
        .with_context("disabled_features", adjustment.disabled_features.clone());
    if let Some(sample) = &adjustment.sample {
        alert = alert
            .with_context("cpu_percent", sample.cpu_percent)
            .with_context("memory_percent", sample.memory_percent);
    }
    alert
}
