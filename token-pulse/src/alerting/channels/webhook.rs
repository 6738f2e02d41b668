//! Webhook alert channel.
//!
//! Posts one JSON document per alert. The `text` field carries a one-line
//! summary so chat incoming-webhooks render something useful without a
//! custom template.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use reqwest::header::{AUTHORIZATION, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, warn};

use super::{AlertChannel, ChannelKind};
use crate::alerting::alert::{Alert, AlertLevel};
use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhookConfig {
    pub enabled: bool,
    pub url: String,
    /// Extra request headers. Entries that are not valid HTTP headers are skipped.
    pub headers: BTreeMap<String, String>,
    /// Sent as `Authorization: Bearer <token>`.
    pub bearer_token: Option<String>,
    /// Alerts below this level are not posted even when a rule routes them here.
    pub min_level: AlertLevel,
    pub timeout_secs: u64,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: String::new(),
            headers: BTreeMap::new(),
            bearer_token: None,
            min_level: AlertLevel::Warning,
            timeout_secs: 10,
        }
    }
}

pub struct WebhookChannel {
    config: WebhookConfig,
    client: Client,
}

impl WebhookChannel {
    pub fn new(config: WebhookConfig) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()
            .unwrap_or_default();
        Self { config, client }
    }

    pub fn config(&self) -> &WebhookConfig {
        &self.config
    }

    fn request_headers(&self) -> Vec<(HeaderName, HeaderValue)> {
        let mut out: Vec<_> = self
            .config
            .headers
            .iter()
            .filter_map(|(name, value)| {
                Some((
                    HeaderName::try_from(name.as_str()).ok()?,
                    HeaderValue::try_from(value.as_str()).ok()?,
                ))
            })
            .collect();
        if let Some(token) = &self.config.bearer_token
            && let Ok(value) = HeaderValue::try_from(format!("Bearer {token}"))
        {
            out.push((AUTHORIZATION, value));
        }
        out
    }

    fn payload(alert: &Alert) -> Value {
        json!({
            "text": format!(
                "[{}] {}: {}",
                alert.level.to_string().to_uppercase(),
                alert.component,
                alert.message
            ),
            "level": alert.level,
            "component": alert.component,
            "message": alert.message,
            "timestamp": alert.timestamp.to_rfc3339(),
            "correlation_id": alert.correlation_id,
            "context": alert.context,
        })
    }
}

#[async_trait]
impl AlertChannel for WebhookChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Webhook
    }

    fn is_enabled(&self) -> bool {
        self.config.enabled && !self.config.url.is_empty()
    }

    fn accepts(&self, alert: &Alert) -> bool {
        alert.level >= self.config.min_level
    }

    async fn deliver(&self, alert: &Alert) -> Result<()> {
        let mut request = self.client.post(&self.config.url).json(&Self::payload(alert));
        for (name, value) in self.request_headers() {
            request = request.header(name, value);
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::Other(format!("webhook request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(%status, component = %alert.component, "Webhook rejected alert");
            return Err(Error::Other(format!("webhook returned {status}: {body}")));
        }

        debug!(component = %alert.component, "Alert posted to webhook");
        Ok(())
    }
}
