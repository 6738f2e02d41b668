//! Health checks for the scheduler, OS resources and external APIs.

mod monitor;
mod tracker;
mod types;

pub use monitor::{HealthConfig, HealthMonitor, HealthSources};
pub use tracker::{
    ApiCallRecord, ApiCallSummary, ApiCallTracker, GroupSnapshot, JobExecution, JobHandle,
    SchedulerTracker,
};
pub use types::{
    ApiHealth, GroupHealth, HealthStatus, ResourceHealth, SchedulerHealth, StuckJob, SystemHealth,
    aggregate_status, format_bytes,
};
