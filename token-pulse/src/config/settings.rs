//! Application settings loaded from TOML.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::alerting::{AlertManagerConfig, WebhookConfig};
use crate::degradation::DegradationConfig;
use crate::health::HealthConfig;
use crate::load::LoadConfig;
use crate::resilience::{CircuitBreakerConfig, RetryPolicy};
use crate::scheduler::SchedulerConfig;
use crate::{Error, Result};

/// Environment variable selecting the configuration file.
pub const CONFIG_PATH_ENV: &str = "TOKEN_PULSE_CONFIG";
/// Environment variable overriding `api.base_url`.
pub const API_BASE_URL_ENV: &str = "TOKEN_PULSE_API_BASE_URL";
/// File used when [`CONFIG_PATH_ENV`] is unset.
pub const DEFAULT_CONFIG_PATH: &str = "token-pulse.toml";

/// Default log filter directive.
pub const DEFAULT_LOG_FILTER: &str = "token_pulse=info,reqwest=warn";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive. `RUST_LOG` takes precedence at startup.
    pub filter: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
    /// Directory for daily rolling log files. Console only when unset.
    pub directory: Option<PathBuf>,
    pub file_prefix: String,
    /// Rotated log files older than this are deleted. 0 keeps everything.
    pub retention_days: u64,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: DEFAULT_LOG_FILTER.to_string(),
            json: false,
            directory: None,
            file_prefix: "token-pulse.log".to_string(),
            retention_days: 7,
        }
    }
}

/// Alert routing and delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertsConfig {
    #[serde(flatten)]
    pub manager: AlertManagerConfig,
    pub webhook: WebhookConfig,
    /// Write alerts to stderr in addition to the log.
    pub console: bool,
    /// Alert history entries idle for longer than this are dropped.
    pub history_retention_hours: u64,
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self {
            manager: AlertManagerConfig::default(),
            webhook: WebhookConfig::default(),
            console: true,
            history_retention_hours: 24,
        }
    }
}

/// External price API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub base_url: String,
    pub timeout_secs: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.dexscreener.com/latest/dex".to_string(),
            timeout_secs: 10,
        }
    }
}

impl ApiConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Token keys seeded into the in-process repository.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TokensConfig {
    pub hot: Vec<String>,
    pub cold: Vec<String>,
}

/// Full application configuration. Every section is optional in the file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub logging: LoggingConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub retry: RetryPolicy,
    pub load: LoadConfig,
    pub degradation: DegradationConfig,
    pub alerts: AlertsConfig,
    pub scheduler: SchedulerConfig,
    pub health: HealthConfig,
    pub api: ApiConfig,
    pub tokens: TokensConfig,
    /// Seconds between modification checks of the config file. 0 disables reload.
    pub reload_interval_secs: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            logging: LoggingConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            retry: RetryPolicy::default(),
            load: LoadConfig::default(),
            degradation: DegradationConfig::default(),
            alerts: AlertsConfig::default(),
            scheduler: SchedulerConfig::default(),
            health: HealthConfig::default(),
            api: ApiConfig::default(),
            tokens: TokensConfig::default(),
            reload_interval_secs: 5,
        }
    }
}

impl AppConfig {
    pub fn reload_interval(&self) -> Option<Duration> {
        (self.reload_interval_secs > 0).then(|| Duration::from_secs(self.reload_interval_secs))
    }

    /// Read, parse and validate a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let config = Self::parse(&content)?;
        debug!(path = %path.display(), "Configuration loaded");
        Ok(config)
    }

    /// Parse and validate TOML content.
    pub fn parse(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `TOKEN_PULSE_CONFIG` (or the default path), falling back to
    /// defaults when the default file does not exist. Applies environment
    /// overrides.
    pub fn from_env() -> Result<(Self, Option<PathBuf>)> {
        let explicit = std::env::var(CONFIG_PATH_ENV).ok().map(PathBuf::from);
        let path = explicit
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

        let (mut config, source) = if explicit.is_some() || path.exists() {
            (Self::load(&path)?, Some(path))
        } else {
            (Self::default(), None)
        };

        if let Ok(url) = std::env::var(API_BASE_URL_ENV)
            && !url.is_empty()
        {
            config.api.base_url = url;
        }
        config.validate()?;
        Ok((config, source))
    }

    pub fn validate(&self) -> Result<()> {
        if self.logging.filter.trim().is_empty() {
            return Err(Error::config("logging.filter must not be empty"));
        }
        self.circuit_breaker.validate()?;
        self.retry.validate()?;
        self.load.validate()?;
        self.degradation.validate()?;
        self.alerts.manager.validate()?;
        if self.alerts.webhook.enabled && self.alerts.webhook.url.is_empty() {
            return Err(Error::config("alerts.webhook.url is required when enabled"));
        }
        if self.alerts.history_retention_hours == 0 {
            return Err(Error::config("alerts.history_retention_hours must be > 0"));
        }
        self.scheduler.validate()?;
        self.health.validate()?;
        if self.api.base_url.is_empty() {
            return Err(Error::config("api.base_url must not be empty"));
        }
        if self.api.timeout_secs == 0 {
            return Err(Error::config("api.timeout_secs must be > 0"));
        }
        if let Some(key) = self.tokens.hot.iter().find(|k| self.tokens.cold.contains(k)) {
            return Err(Error::config(format!("token '{key}' is listed in both groups")));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::alerting::AlertLevel;
    use crate::resilience::BackoffStrategy;

    #[test]
    fn test_empty_file_uses_defaults() {
        let config = AppConfig::parse("").unwrap();
        assert_eq!(config, AppConfig::default());
        assert_eq!(config.circuit_breaker.failure_threshold, 5);
        assert_eq!(config.scheduler.hot.interval_secs, 30);
        assert!(!config.alerts.manager.rules.is_empty());
    }

    #[test]
    fn test_partial_sections() {
        let config = AppConfig::parse(
            r#"
            [circuit_breaker]
            failure_threshold = 3

            [retry]
            max_attempts = 4
            strategy = "exponential"

            [alerts]
            history_retention_hours = 6

            [[alerts.rules]]
            component_pattern = "api.*"
            min_level = "error"
            cooldown_minutes = 1

            [scheduler.cold]
            interval_secs = 300
            batch_size = 20
            concurrency = 2
            "#,
        )
        .unwrap();

        assert_eq!(config.circuit_breaker.failure_threshold, 3);
        assert_eq!(config.circuit_breaker.recovery_timeout_secs, 60);
        assert_eq!(config.retry.max_attempts, 4);
        assert_eq!(config.retry.strategy, BackoffStrategy::Exponential);
        assert_eq!(config.alerts.history_retention_hours, 6);
        assert_eq!(config.alerts.manager.rules.len(), 1);
        assert_eq!(config.alerts.manager.rules[0].min_level, AlertLevel::Error);
        assert_eq!(config.alerts.manager.rules[0].max_frequency_per_hour, 10);
        assert_eq!(config.scheduler.cold.interval_secs, 300);
        assert_eq!(config.scheduler.hot, SchedulerConfig::default().hot);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let err = AppConfig::parse(
            r#"
            [load.thresholds]
            cpu_warning = 90
            cpu_critical = 80
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));

        let err = AppConfig::parse("[retry]\njitter_factor = 1.5\n").unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));

        let err = AppConfig::parse("[api]\ntimeout_secs = 0\n").unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));

        let err = AppConfig::parse("[alerts.webhook]\nenabled = true\n").unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn test_malformed_toml() {
        let err = AppConfig::parse("[circuit_breaker\n").unwrap_err();
        assert!(matches!(err, Error::ConfigParse(_)));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[api]\nbase_url = \"http://localhost:9000\"").unwrap();

        let config = AppConfig::load(file.path()).unwrap();
        assert_eq!(config.api.base_url, "http://localhost:9000");

        let missing = AppConfig::load("/nonexistent/token-pulse.toml").unwrap_err();
        assert!(matches!(missing, Error::Io(_)));
    }
}
