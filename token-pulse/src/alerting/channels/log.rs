use async_trait::async_trait;
use tracing::{error, info, warn};

use super::{AlertChannel, ChannelKind};
use crate::Result;
use crate::alerting::alert::{Alert, AlertLevel};

/// Writes alerts to the tracing log at a matching level.
#[derive(Debug, Default, Clone)]
pub struct LogChannel;

impl LogChannel {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl AlertChannel for LogChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Log
    }

    async fn deliver(&self, alert: &Alert) -> Result<()> {
        let context = serde_json::to_string(&alert.context)?;
        match alert.level {
            AlertLevel::Info => info!(
                component = %alert.component,
                correlation_id = %alert.correlation_id,
                context = %context,
                "ALERT: {}",
                alert.message
            ),
            AlertLevel::Warning => warn!(
                component = %alert.component,
                correlation_id = %alert.correlation_id,
                context = %context,
                "ALERT: {}",
                alert.message
            ),
            AlertLevel::Error | AlertLevel::Critical => error!(
                component = %alert.component,
                correlation_id = %alert.correlation_id,
                level = %alert.level,
                context = %context,
                "ALERT: {}",
                alert.message
            ),
        }
        Ok(())
    }
}
