use std::io::Write;

use async_trait::async_trait;

use super::{AlertChannel, ChannelKind};
use crate::Result;
use crate::alerting::alert::Alert;

/// Prints alerts to stderr, one line each.
#[derive(Debug, Default, Clone)]
pub struct ConsoleChannel;

impl ConsoleChannel {
    pub fn new() -> Self {
        Self
    }

    fn format_line(alert: &Alert) -> String {
        format!(
            "[{}] {} {}: {} ({})",
            alert.timestamp.format("%Y-%m-%d %H:%M:%S%.3f"),
            alert.level.to_string().to_uppercase(),
            alert.component,
            alert.message,
            alert.correlation_id
        )
    }
}

#[async_trait]
impl AlertChannel for ConsoleChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Console
    }

    async fn deliver(&self, alert: &Alert) -> Result<()> {
        let line = Self::format_line(alert);
        let mut stderr = std::io::stderr().lock();
        writeln!(stderr, "{line}")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_line() {
        let alert = Alert::critical("circuit_breaker.price_api", "circuit breaker is open")
            .with_correlation_id("abc");
        let line = ConsoleChannel::format_line(&alert);
        assert!(line.contains("CRITICAL circuit_breaker.price_api: circuit breaker is open (abc)"));
    }
}
