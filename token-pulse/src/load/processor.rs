//! Adaptive load shedding with hysteresis.
//!
//! The processor samples OS load, keeps the last samples in a ring buffer and
//! moves between [`LoadLevel`]s only when the recent trend confirms it. The
//! current level drives a processing factor (batch sizes, intervals) and a
//! set of disabled low-priority features.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use strum::Display;
use tracing::{debug, info, warn};

use super::provider::SystemMetricsProvider;
use crate::{Error, Result};

/// Number of samples considered when confirming a level change.
const TREND_SAMPLES: usize = 3;
/// Samples out of [`TREND_SAMPLES`] that must agree before escalating.
const ESCALATION_VOTES: usize = 2;

/// Warning and critical thresholds, all in percent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadThresholds {
    pub cpu_warning: f64,
    pub cpu_critical: f64,
    pub memory_warning: f64,
    pub memory_critical: f64,
    pub disk_warning: f64,
    pub disk_critical: f64,
    /// Samples within this margin of a threshold vote for escalation.
    /// De-escalation needs the window average twice this margin below it.
    pub hysteresis_margin: f64,
}

impl Default for LoadThresholds {
    fn default() -> Self {
        Self {
            cpu_warning: 70.0,
            cpu_critical: 85.0,
            memory_warning: 75.0,
            memory_critical: 90.0,
            disk_warning: 80.0,
            disk_critical: 90.0,
            hysteresis_margin: 5.0,
        }
    }
}

impl LoadThresholds {
    pub fn validate(&self) -> Result<()> {
        let pairs = [
            ("cpu", self.cpu_warning, self.cpu_critical),
            ("memory", self.memory_warning, self.memory_critical),
            ("disk", self.disk_warning, self.disk_critical),
        ];
        for (name, warning, critical) in pairs {
            if !(0.0..=100.0).contains(&warning) || !(0.0..=100.0).contains(&critical) {
                return Err(Error::config(format!(
                    "{name} thresholds must be within 0..=100"
                )));
            }
            if warning >= critical {
                return Err(Error::config(format!(
                    "{name}_warning ({warning}) must be below {name}_critical ({critical})"
                )));
            }
        }
        if self.hysteresis_margin < 0.0 {
            return Err(Error::config("hysteresis_margin must not be negative"));
        }
        Ok(())
    }

    /// (cpu, memory) thresholds that put a sample at `level`.
    fn for_level(&self, level: LoadLevel) -> Option<(f64, f64)> {
        match level {
            LoadLevel::Normal => None,
            LoadLevel::Reduced => Some((self.cpu_warning, self.memory_warning)),
            LoadLevel::Minimal => Some((self.cpu_critical, self.memory_critical)),
        }
    }
}

/// Load processor configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadConfig {
    pub thresholds: LoadThresholds,
    /// Ring buffer capacity.
    pub history_size: usize,
    /// Path whose filesystem is sampled for disk usage.
    pub disk_path: PathBuf,
    /// Feature name to priority (1 = least important, 10 = most important).
    pub feature_priorities: BTreeMap<String, u8>,
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            thresholds: LoadThresholds::default(),
            history_size: 60,
            disk_path: PathBuf::from("/"),
            feature_priorities: default_feature_priorities(),
        }
    }
}

impl LoadConfig {
    pub fn validate(&self) -> Result<()> {
        self.thresholds.validate()?;
        if self.history_size < TREND_SAMPLES {
            return Err(Error::config(format!(
                "load.history_size must be at least {TREND_SAMPLES}"
            )));
        }
        if let Some((name, _)) = self
            .feature_priorities
            .iter()
            .find(|(_, p)| !(1..=10).contains(*p))
        {
            return Err(Error::config(format!(
                "feature '{name}' priority must be within 1..=10"
            )));
        }
        Ok(())
    }
}

/// Well-known feature names checked by the scheduler.
pub mod features {
    pub const DEBUG_METRICS: &str = "debug_metrics";
    pub const CACHE_WARMING: &str = "cache_warming";
    pub const ANALYTICS_EXPORT: &str = "analytics_export";
    pub const HISTORICAL_BACKFILL: &str = "historical_backfill";
    pub const DEGRADATION_ANALYSIS: &str = "degradation_analysis";
    pub const PREDICTIVE_ALERTS: &str = "predictive_alerts";
    pub const COLD_TOKENS: &str = "cold_tokens";
    pub const HEALTH_CHECKS: &str = "health_checks";
    pub const HOT_TOKENS: &str = "hot_tokens";
    pub const PRICE_FETCH: &str = "price_fetch";
    pub const ALERTING: &str = "alerting";
}

pub fn default_feature_priorities() -> BTreeMap<String, u8> {
    use features::*;
    [
        (DEBUG_METRICS, 1),
        (CACHE_WARMING, 2),
        (ANALYTICS_EXPORT, 3),
        (HISTORICAL_BACKFILL, 3),
        (DEGRADATION_ANALYSIS, 4),
        (PREDICTIVE_ALERTS, 5),
        (COLD_TOKENS, 5),
        (HEALTH_CHECKS, 8),
        (HOT_TOKENS, 9),
        (PRICE_FETCH, 10),
        (ALERTING, 10),
    ]
    .into_iter()
    .map(|(name, priority)| (name.to_string(), priority))
    .collect()
}

/// Processing level chosen from recent load.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize, Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum LoadLevel {
    #[default]
    Normal,
    Reduced,
    Minimal,
}

impl LoadLevel {
    pub fn processing_factor(self) -> f64 {
        match self {
            Self::Normal => 1.0,
            Self::Reduced => 0.7,
            Self::Minimal => 0.3,
        }
    }

    /// Features with priority at or below this are disabled.
    fn disabled_priority_ceiling(self) -> Option<u8> {
        match self {
            Self::Normal => None,
            Self::Reduced => Some(3),
            Self::Minimal => Some(5),
        }
    }
}

/// One load observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadSample {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub disk_percent: f64,
    pub connection_count: u64,
    pub load_score: f64,
    pub timestamp: DateTime<Utc>,
}

impl LoadSample {
    pub fn new(
        cpu_percent: f64,
        memory_percent: f64,
        disk_percent: f64,
        connection_count: u64,
        timestamp: DateTime<Utc>,
    ) -> Self {
        let load_score = 0.4 * cpu_percent
            + 0.4 * memory_percent
            + 0.1 * disk_percent.min(100.0)
            + 0.1 * (connection_count as f64 / 100.0).min(100.0);
        Self {
            cpu_percent,
            memory_percent,
            disk_percent,
            connection_count,
            load_score,
            timestamp,
        }
    }
}

/// Result of one adjustment pass.
#[derive(Debug, Clone, Serialize)]
pub struct LoadAdjustment {
    pub previous_level: LoadLevel,
    pub new_level: LoadLevel,
    pub changed: bool,
    pub processing_factor: f64,
    pub disabled_features: Vec<String>,
    pub sample: Option<LoadSample>,
}

#[derive(Debug)]
struct ProcessorState {
    samples: VecDeque<LoadSample>,
    level: LoadLevel,
    disabled: BTreeSet<String>,
}

/// Load-based processor.
pub struct LoadBasedProcessor {
    provider: Arc<dyn SystemMetricsProvider>,
    config: RwLock<LoadConfig>,
    state: Mutex<ProcessorState>,
}

impl LoadBasedProcessor {
    pub fn new(provider: Arc<dyn SystemMetricsProvider>, config: LoadConfig) -> Self {
        let capacity = config.history_size;
        Self {
            provider,
            config: RwLock::new(config),
            state: Mutex::new(ProcessorState {
                samples: VecDeque::with_capacity(capacity),
                level: LoadLevel::Normal,
                disabled: BTreeSet::new(),
            }),
        }
    }

    pub fn provider(&self) -> &Arc<dyn SystemMetricsProvider> {
        &self.provider
    }

    pub fn thresholds(&self) -> LoadThresholds {
        self.config.read().thresholds.clone()
    }

    pub fn disk_path(&self) -> PathBuf {
        self.config.read().disk_path.clone()
    }

    /// Sample current OS load without recording it.
    pub fn assess(&self) -> LoadSample {
        let disk_path = self.config.read().disk_path.clone();
        let cpu = self.provider.cpu_percent();
        let memory = self.provider.virtual_memory().percent;
        let disk = self
            .provider
            .disk_usage(&disk_path)
            .map(|d| d.percent)
            .unwrap_or(0.0);
        let connections = self.provider.connection_count().unwrap_or(0);
        LoadSample::new(cpu, memory, disk, connections, Utc::now())
    }

    /// Append a sample to the ring buffer.
    pub fn record_sample(&self, sample: LoadSample) {
        let capacity = self.config.read().history_size;
        let mut state = self.state.lock();
        while state.samples.len() >= capacity {
            state.samples.pop_front();
        }
        state.samples.push_back(sample);
    }

    /// Sample, record and re-evaluate the level.
    pub fn process_load_adjustment(&self) -> LoadAdjustment {
        let sample = self.assess();
        debug!(
            cpu = sample.cpu_percent,
            memory = sample.memory_percent,
            disk = sample.disk_percent,
            score = sample.load_score,
            "Load sample"
        );
        self.record_sample(sample.clone());
        let mut adjustment = self.adjust_processing_parameters();
        adjustment.sample = Some(sample);
        adjustment
    }

    /// Re-evaluate the level from recorded samples, applying hysteresis.
    pub fn adjust_processing_parameters(&self) -> LoadAdjustment {
        let config = self.config.read().clone();
        let mut state = self.state.lock();
        let previous = state.level;
        let next = confirmed_level(&state.samples, previous, &config.thresholds);

        if next != previous {
            state.level = next;
            state.disabled = disabled_features_for(next, &config.feature_priorities);
            if next > previous {
                warn!(from = %previous, to = %next, factor = next.processing_factor(), "Load level raised");
            } else {
                info!(from = %previous, to = %next, factor = next.processing_factor(), "Load level lowered");
            }
        }

        LoadAdjustment {
            previous_level: previous,
            new_level: next,
            changed: next != previous,
            processing_factor: next.processing_factor(),
            disabled_features: state.disabled.iter().cloned().collect(),
            sample: state.samples.back().cloned(),
        }
    }

    pub fn current_level(&self) -> LoadLevel {
        self.state.lock().level
    }

    pub fn processing_factor(&self) -> f64 {
        self.current_level().processing_factor()
    }

    /// `round(base * factor)`, never below 1.
    pub fn get_adjusted_batch_size(&self, base: usize) -> usize {
        let scaled = (base as f64 * self.processing_factor()).round() as usize;
        scaled.max(1)
    }

    /// `base / factor`, so reduced capacity only ever widens the interval.
    pub fn get_adjusted_interval(&self, base: Duration) -> Duration {
        base.div_f64(self.processing_factor())
    }

    /// Unknown features are always enabled.
    pub fn is_feature_enabled(&self, name: &str) -> bool {
        !self.state.lock().disabled.contains(name)
    }

    pub fn disabled_features(&self) -> Vec<String> {
        self.state.lock().disabled.iter().cloned().collect()
    }

    /// Most recent samples, oldest first.
    pub fn recent_samples(&self, limit: usize) -> Vec<LoadSample> {
        let state = self.state.lock();
        let skip = state.samples.len().saturating_sub(limit);
        state.samples.iter().skip(skip).cloned().collect()
    }

    pub fn latest_sample(&self) -> Option<LoadSample> {
        self.state.lock().samples.back().cloned()
    }

    /// Apply reloaded settings. The current level is kept; the disabled set
    /// is recomputed against the new priority map.
    pub fn apply_config(&self, config: LoadConfig) {
        let mut state = self.state.lock();
        while state.samples.len() > config.history_size {
            state.samples.pop_front();
        }
        state.disabled = disabled_features_for(state.level, &config.feature_priorities);
        drop(state);
        *self.config.write() = config;
        info!("Load thresholds reloaded");
    }
}

/// Raw level of a single sample, without hysteresis.
pub fn determine_level(cpu: f64, memory: f64, thresholds: &LoadThresholds) -> LoadLevel {
    if cpu >= thresholds.cpu_critical || memory >= thresholds.memory_critical {
        LoadLevel::Minimal
    } else if cpu >= thresholds.cpu_warning || memory >= thresholds.memory_warning {
        LoadLevel::Reduced
    } else {
        LoadLevel::Normal
    }
}

fn confirmed_level(
    samples: &VecDeque<LoadSample>,
    current: LoadLevel,
    thresholds: &LoadThresholds,
) -> LoadLevel {
    let recent: Vec<&LoadSample> = samples.iter().rev().take(TREND_SAMPLES).collect();
    let margin = thresholds.hysteresis_margin;

    // Escalate when enough recent samples reach the higher level.
    for candidate in [LoadLevel::Minimal, LoadLevel::Reduced] {
        if candidate <= current {
            break;
        }
        let Some((cpu_limit, mem_limit)) = thresholds.for_level(candidate) else {
            continue;
        };
        let votes = recent
            .iter()
            .filter(|s| s.cpu_percent >= cpu_limit - margin || s.memory_percent >= mem_limit - margin)
            .count();
        if votes >= ESCALATION_VOTES {
            return candidate;
        }
    }

    // De-escalate only when no sample in a full window still votes for the
    // current level and the average sits a second margin below it. The gap
    // between the two bounds keeps a signal oscillating around the trigger
    // from flapping.
    if let Some((cpu_limit, mem_limit)) = thresholds.for_level(current)
        && recent.len() >= TREND_SAMPLES
    {
        let still_voting = recent
            .iter()
            .any(|s| s.cpu_percent >= cpu_limit - margin || s.memory_percent >= mem_limit - margin);
        let n = recent.len() as f64;
        let avg_cpu = recent.iter().map(|s| s.cpu_percent).sum::<f64>() / n;
        let avg_mem = recent.iter().map(|s| s.memory_percent).sum::<f64>() / n;
        if !still_voting && avg_cpu < cpu_limit - 2.0 * margin && avg_mem < mem_limit - 2.0 * margin {
            let target = determine_level(avg_cpu, avg_mem, thresholds);
            if target < current {
                return target;
            }
        }
    }

    current
}

fn disabled_features_for(level: LoadLevel, priorities: &BTreeMap<String, u8>) -> BTreeSet<String> {
    let Some(ceiling) = level.disabled_priority_ceiling() else {
        return BTreeSet::new();
    };
    priorities
        .iter()
        .filter(|(_, priority)| **priority <= ceiling)
        .map(|(name, _)| name.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::load::provider::StaticMetricsProvider;

    fn processor() -> (LoadBasedProcessor, Arc<StaticMetricsProvider>) {
        let provider = Arc::new(StaticMetricsProvider::new(20.0, 30.0));
        let processor = LoadBasedProcessor::new(provider.clone(), LoadConfig::default());
        (processor, provider)
    }

    fn sample(cpu: f64, memory: f64) -> LoadSample {
        LoadSample::new(cpu, memory, 0.0, 0, Utc::now())
    }

    #[test]
    fn test_load_score() {
        let s = LoadSample::new(50.0, 50.0, 200.0, 50_000, Utc::now());
        // 20 + 20 + 10 + 50
        assert!((s.load_score - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_determine_level() {
        let t = LoadThresholds::default();
        assert_eq!(determine_level(10.0, 10.0, &t), LoadLevel::Normal);
        assert_eq!(determine_level(70.0, 10.0, &t), LoadLevel::Reduced);
        assert_eq!(determine_level(10.0, 76.0, &t), LoadLevel::Reduced);
        assert_eq!(determine_level(85.0, 10.0, &t), LoadLevel::Minimal);
        assert_eq!(determine_level(10.0, 95.0, &t), LoadLevel::Minimal);
    }

    #[test]
    fn test_single_spike_does_not_escalate() {
        let (processor, _) = processor();
        for i in 0..60 {
            let cpu = if i == 40 { 99.0 } else { 20.0 };
            processor.record_sample(sample(cpu, 30.0));
            let adjustment = processor.adjust_processing_parameters();
            assert_eq!(adjustment.new_level, LoadLevel::Normal, "sample {i}");
        }
        assert_eq!(processor.recent_samples(100).len(), 60);
    }

    #[test]
    fn test_sustained_warning_escalates_to_reduced() {
        let (processor, _) = processor();
        processor.record_sample(sample(20.0, 30.0));
        processor.adjust_processing_parameters();

        // cpu_warning - margin = 65
        for cpu in [66.0, 67.0, 68.0] {
            processor.record_sample(sample(cpu, 30.0));
            processor.adjust_processing_parameters();
        }
        assert_eq!(processor.current_level(), LoadLevel::Reduced);
        assert_eq!(processor.processing_factor(), 0.7);
        assert!(!processor.is_feature_enabled(features::ANALYTICS_EXPORT));
        assert!(processor.is_feature_enabled(features::COLD_TOKENS));
        assert!(processor.is_feature_enabled("unknown_feature"));
    }

    #[test]
    fn test_sustained_critical_escalates_to_minimal() {
        let (processor, _) = processor();
        for _ in 0..3 {
            processor.record_sample(sample(95.0, 30.0));
        }
        let adjustment = processor.adjust_processing_parameters();
        assert!(adjustment.changed);
        assert_eq!(adjustment.new_level, LoadLevel::Minimal);
        assert!(adjustment.disabled_features.contains(&features::COLD_TOKENS.to_string()));
        assert!(processor.is_feature_enabled(features::HOT_TOKENS));
    }

    #[test]
    fn test_de_escalation_needs_average_below_margin() {
        let (processor, _) = processor();
        for _ in 0..3 {
            processor.record_sample(sample(72.0, 30.0));
        }
        processor.adjust_processing_parameters();
        assert_eq!(processor.current_level(), LoadLevel::Reduced);

        // Average of (60, 72, 72) is still above 65.
        processor.record_sample(sample(60.0, 30.0));
        processor.adjust_processing_parameters();
        assert_eq!(processor.current_level(), LoadLevel::Reduced);

        processor.record_sample(sample(20.0, 30.0));
        processor.record_sample(sample(20.0, 30.0));
        let adjustment = processor.adjust_processing_parameters();
        assert_eq!(adjustment.previous_level, LoadLevel::Reduced);
        assert_eq!(adjustment.new_level, LoadLevel::Normal);
        assert!(adjustment.disabled_features.is_empty());
    }

    #[test]
    fn test_oscillating_load_does_not_flap() {
        let (processor, _) = processor();
        let mut levels = Vec::new();
        for cpu in [66.0, 66.0, 55.0, 66.0, 55.0, 66.0, 55.0, 66.0, 55.0, 66.0] {
            processor.record_sample(sample(cpu, 30.0));
            levels.push(processor.adjust_processing_parameters().new_level);
        }
        let escalated_at = levels
            .iter()
            .position(|l| *l == LoadLevel::Reduced)
            .unwrap();
        assert!(levels[escalated_at..].iter().all(|l| *l == LoadLevel::Reduced));

        // Every sample under the trigger, but the average is inside the dead band.
        for _ in 0..3 {
            processor.record_sample(sample(62.0, 30.0));
        }
        processor.adjust_processing_parameters();
        assert_eq!(processor.current_level(), LoadLevel::Reduced);

        for _ in 0..3 {
            processor.record_sample(sample(50.0, 30.0));
        }
        processor.adjust_processing_parameters();
        assert_eq!(processor.current_level(), LoadLevel::Normal);
    }

    #[test]
    fn test_minimal_steps_down_to_reduced() {
        let (processor, _) = processor();
        for _ in 0..3 {
            processor.record_sample(sample(95.0, 30.0));
        }
        processor.adjust_processing_parameters();
        for _ in 0..3 {
            processor.record_sample(sample(72.0, 30.0));
        }
        processor.adjust_processing_parameters();
        assert_eq!(processor.current_level(), LoadLevel::Reduced);
    }

    #[test]
    fn test_adjusted_batch_size_and_interval() {
        let (processor, _) = processor();
        assert_eq!(processor.get_adjusted_batch_size(10), 10);
        assert_eq!(processor.get_adjusted_interval(Duration::from_secs(30)), Duration::from_secs(30));

        for _ in 0..3 {
            processor.record_sample(sample(95.0, 30.0));
        }
        processor.adjust_processing_parameters();
        assert_eq!(processor.get_adjusted_batch_size(10), 3);
        assert_eq!(processor.get_adjusted_batch_size(1), 1);
        assert_eq!(processor.get_adjusted_interval(Duration::from_secs(30)), Duration::from_secs(100));
    }

    #[test]
    fn test_process_load_adjustment_uses_provider() {
        let (processor, provider) = processor();
        provider.set_cpu(90.0);
        provider.set_disk(50.0);
        let first = processor.process_load_adjustment();
        assert!(!first.changed);
        assert_eq!(first.sample.as_ref().unwrap().disk_percent, 50.0);

        let second = processor.process_load_adjustment();
        assert!(second.changed);
        assert_eq!(second.new_level, LoadLevel::Minimal);
    }

    #[test]
    fn test_ring_buffer_bounded() {
        let provider = Arc::new(StaticMetricsProvider::new(0.0, 0.0));
        let processor = LoadBasedProcessor::new(
            provider,
            LoadConfig {
                history_size: 5,
                ..Default::default()
            },
        );
        for i in 0..12 {
            processor.record_sample(sample(i as f64, 0.0));
        }
        let samples = processor.recent_samples(10);
        assert_eq!(samples.len(), 5);
        assert_eq!(samples[0].cpu_percent, 7.0);
        assert_eq!(processor.recent_samples(2)[1].cpu_percent, 11.0);
    }

    #[test]
    fn test_config_validation() {
        assert!(LoadConfig::default().validate().is_ok());
        let bad = LoadConfig {
            thresholds: LoadThresholds {
                cpu_warning: 90.0,
                cpu_critical: 80.0,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(bad.validate().is_err());

        let mut priorities = default_feature_priorities();
        priorities.insert("broken".into(), 0);
        let bad = LoadConfig {
            feature_priorities: priorities,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }
}
