//! Performance degradation detection and forecasting.

mod detector;
pub mod stats;

pub use detector::{
    ChangeThreshold, DegradationConfig, DegradationDetector, DegradationSeverity,
    DegradationThresholds, MetricKind, PredictionConfig, PredictiveAlert, ServicePerformance,
    TrendAnalysis,
};
pub use stats::TrendStats;
