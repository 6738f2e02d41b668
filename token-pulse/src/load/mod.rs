//! Load-based processing: OS metrics sampling and adaptive load shedding.

mod processor;
mod provider;

pub use processor::{
    LoadAdjustment, LoadBasedProcessor, LoadConfig, LoadLevel, LoadSample, LoadThresholds,
    default_feature_priorities, determine_level, features,
};
pub use provider::{
    DiskUsage, MemoryInfo, StaticMetricsProvider, SysinfoProvider, SystemMetricsProvider,
};
