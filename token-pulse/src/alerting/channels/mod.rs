//! Alert delivery channels.

mod console;
mod log;
mod webhook;

pub use console::ConsoleChannel;
pub use log::LogChannel;
pub use webhook::{WebhookChannel, WebhookConfig};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use super::alert::Alert;
use crate::Result;

/// Kind of delivery channel named by alert rules.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ChannelKind {
    Log,
    Console,
    Webhook,
}

/// Trait for alert delivery channels.
#[async_trait]
pub trait AlertChannel: Send + Sync {
    fn kind(&self) -> ChannelKind;

    /// Disabled channels are skipped without counting as a failure.
    fn is_enabled(&self) -> bool {
        true
    }

    /// Whether this channel takes `alert` at all. Rejected alerts are not
    /// handed to [`deliver`](Self::deliver) and do not count as delivered.
    fn accepts(&self, _alert: &Alert) -> bool {
        true
    }

    async fn deliver(&self, alert: &Alert) -> Result<()>;
}
