//! Service container for dependency injection.
//!
//! The ServiceContainer builds every component from [`AppConfig`], wires
//! configuration reload, and manages the background task lifecycle.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::Result;
use crate::alerting::{AlertManager, ConsoleChannel, LogChannel, WebhookChannel};
use crate::config::{AppConfig, ConfigEventBroadcaster, ConfigUpdateEvent, ConfigWatcher};
use crate::degradation::DegradationDetector;
use crate::health::{ApiCallTracker, HealthMonitor, HealthSources, SchedulerTracker, SystemHealth};
use crate::load::{LoadBasedProcessor, SysinfoProvider, SystemMetricsProvider};
use crate::logging::LoggingHandle;
use crate::resilience::ResilienceRegistry;
use crate::scheduler::{
    HttpPriceFetcher, InMemoryTokenRepository, PriceFetcher, SchedulerContext, SchedulerService,
    TokenGroup, TokenRepository,
};

/// Default shutdown timeout.
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Service container holding all application services.
pub struct ServiceContainer {
    config: RwLock<Arc<AppConfig>>,
    pub registry: Arc<ResilienceRegistry>,
    pub alerts: Arc<AlertManager>,
    pub load: Arc<LoadBasedProcessor>,
    pub detector: Arc<DegradationDetector>,
    pub jobs: Arc<SchedulerTracker>,
    pub api_calls: Arc<ApiCallTracker>,
    pub health: Arc<HealthMonitor>,
    pub scheduler: Arc<SchedulerService>,
    /// Configuration event broadcaster.
    pub event_broadcaster: ConfigEventBroadcaster,
    logging: Option<Arc<LoggingHandle>>,
    config_path: Option<PathBuf>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    cancellation_token: CancellationToken,
}

impl ServiceContainer {
    /// Production wiring: sysinfo metrics, HTTP price API and an in-process
    /// repository seeded from `tokens`.
    pub fn new(config: AppConfig) -> Result<Self> {
        let fetcher = Arc::new(HttpPriceFetcher::new(
            config.api.base_url.clone(),
            config.api.timeout(),
        ));
        let repository = InMemoryTokenRepository::new();
        for key in &config.tokens.hot {
            repository.insert(key, TokenGroup::Hot);
        }
        for key in &config.tokens.cold {
            repository.insert(key, TokenGroup::Cold);
        }
        Self::with_components(
            config,
            Arc::new(SysinfoProvider::new()),
            fetcher,
            Arc::new(repository),
        )
    }

    /// Build with explicit collaborators.
    pub fn with_components(
        config: AppConfig,
        provider: Arc<dyn SystemMetricsProvider>,
        fetcher: Arc<dyn PriceFetcher>,
        repository: Arc<dyn TokenRepository>,
    ) -> Result<Self> {
        config.validate()?;
        info!("Initializing service container");

        let registry = Arc::new(ResilienceRegistry::new(
            config.circuit_breaker.clone(),
            config.retry.clone(),
        ));

        let alerts = Arc::new(AlertManager::new(config.alerts.manager.clone()));
        alerts.register_channel(Arc::new(LogChannel::new()));
        if config.alerts.console {
            alerts.register_channel(Arc::new(ConsoleChannel::new()));
        }
        alerts.register_channel(Arc::new(WebhookChannel::new(config.alerts.webhook.clone())));

        let load = Arc::new(LoadBasedProcessor::new(provider, config.load.clone()));
        let detector = Arc::new(DegradationDetector::new(
            config.degradation.clone(),
            alerts.clone(),
        ));
        let jobs = Arc::new(SchedulerTracker::new(Duration::from_secs(
            config.scheduler.stuck_job_threshold_secs,
        )));
        let api_calls = Arc::new(ApiCallTracker::default());

        let health = Arc::new(HealthMonitor::new(
            config.health.clone(),
            HealthSources {
                registry: registry.clone(),
                load: load.clone(),
                detector: detector.clone(),
                alerts: alerts.clone(),
                scheduler: jobs.clone(),
                apis: api_calls.clone(),
            },
        ));

        let ctx = SchedulerContext {
            registry: registry.clone(),
            load: load.clone(),
            detector: detector.clone(),
            alerts: alerts.clone(),
            jobs: jobs.clone(),
            api_calls: api_calls.clone(),
            fetcher,
            repository,
        };
        let scheduler = Arc::new(SchedulerService::new(
            config.scheduler.clone(),
            ctx,
            health.clone(),
            config.alerts.history_retention_hours,
        ));

        info!("Service container initialized");

        Ok(Self {
            config: RwLock::new(Arc::new(config)),
            registry,
            alerts,
            load,
            detector,
            jobs,
            api_calls,
            health,
            scheduler,
            event_broadcaster: ConfigEventBroadcaster::new(),
            logging: None,
            config_path: None,
            tasks: Mutex::new(Vec::new()),
            cancellation_token: CancellationToken::new(),
        })
    }

    pub fn with_logging(mut self, logging: Arc<LoggingHandle>) -> Self {
        self.logging = Some(logging);
        self
    }

    /// Watch this file for changes once started.
    pub fn with_config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_path = Some(path.into());
        self
    }

    pub fn config(&self) -> Arc<AppConfig> {
        self.config.read().clone()
    }

    /// Apply a validated configuration to every running component.
    pub fn apply_config(&self, config: Arc<AppConfig>) {
        self.registry
            .apply_config(config.circuit_breaker.clone(), config.retry.clone());
        self.alerts.apply_config(config.alerts.manager.clone());
        self.alerts
            .register_channel(Arc::new(WebhookChannel::new(config.alerts.webhook.clone())));
        self.load.apply_config(config.load.clone());
        self.detector.apply_config(config.degradation.clone());
        self.health.apply_config(config.health.clone());
        self.scheduler
            .apply_config(&config.scheduler, config.alerts.history_retention_hours);

        if let Some(logging) = &self.logging
            && logging.get_filter() != config.logging.filter
            && let Err(e) = logging.set_filter(&config.logging.filter)
        {
            warn!(error = %e, "Failed to apply reloaded log filter");
        }

        *self.config.write() = config;
        info!("Configuration applied");
    }

    /// Spawn the scheduler, the config watcher and the reload listener.
    pub fn start(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock();
        let cancel = self.cancellation_token.clone();

        tasks.push(tokio::spawn(self.scheduler.clone().run(cancel.child_token())));

        let config = self.config();
        if let Some(logging) = &self.logging {
            logging.start_retention_cleanup(config.logging.retention_days, cancel.child_token());
        }

        if let (Some(path), Some(interval)) = (&self.config_path, config.reload_interval()) {
            let watcher = ConfigWatcher::new(
                path,
                interval,
                config.clone(),
                self.event_broadcaster.clone(),
            );
            tasks.push(tokio::spawn(watcher.run(cancel.child_token())));
        }

        let mut events = self.event_broadcaster.subscribe();
        let container = Arc::downgrade(self);
        let listener_cancel = cancel.child_token();
        tasks.push(tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = listener_cancel.cancelled() => break,
                    event = events.recv() => event,
                };
                match event {
                    Ok(event @ ConfigUpdateEvent::Reloaded { .. }) => {
                        if event.requires_restart() {
                            warn!("{}; api and tokens changes take effect after a restart", event.description());
                        }
                        let ConfigUpdateEvent::Reloaded { config, .. } = event else { continue };
                        let Some(container) = container.upgrade() else { break };
                        container.apply_config(config);
                    }
                    Ok(ConfigUpdateEvent::ReloadFailed { error }) => {
                        debug!(error = %error, "Ignoring rejected configuration");
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Config event listener lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }));

        info!(tasks = tasks.len(), "Services started");
    }

    /// Start, then block until ctrl-c and shut down.
    pub async fn run_until_shutdown(self: &Arc<Self>) -> Result<()> {
        self.start();
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result?;
                info!("Received ctrl-c");
            }
            _ = self.cancellation_token.cancelled() => {}
        }
        self.shutdown().await
    }

    /// Shutdown all services gracefully.
    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown_with_timeout(DEFAULT_SHUTDOWN_TIMEOUT).await
    }

    /// Shutdown all services gracefully with a custom timeout.
    pub async fn shutdown_with_timeout(&self, timeout: Duration) -> Result<()> {
        info!("Shutting down services (timeout: {:?})", timeout);

        // Signal all background tasks to stop
        self.cancellation_token.cancel();

        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        let shutdown_result = tokio::time::timeout(timeout, async {
            for task in tasks {
                if let Err(e) = task.await {
                    warn!(error = %e, "Background task failed");
                }
            }
        })
        .await;

        if shutdown_result.is_err() {
            warn!("Shutdown timeout reached, forcing shutdown");
        }

        info!("Services shut down");
        Ok(())
    }

    /// Get the cancellation token for external use.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation_token.clone()
    }

    /// Check if shutdown has been requested.
    pub fn is_shutting_down(&self) -> bool {
        self.cancellation_token.is_cancelled()
    }

    pub async fn health(&self) -> SystemHealth {
        self.health.get_comprehensive_health().await
    }

    /// Get service statistics.
    pub fn stats(&self) -> ServiceStats {
        let alerts = self.alerts.get_statistics();
        ServiceStats {
            load_level: self.load.current_level().to_string(),
            disabled_features: self.load.disabled_features(),
            open_breakers: self
                .registry
                .breaker_stats()
                .into_iter()
                .filter(|s| s.state != crate::resilience::CircuitState::Closed)
                .map(|s| s.name)
                .collect(),
            alerts_received: alerts.total_received,
            alerts_delivered: alerts.total_delivered,
            tracked_services: self.detector.tracked_services().len(),
            event_subscriber_count: self.event_broadcaster.subscriber_count(),
        }
    }
}

/// Service statistics.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStats {
    pub load_level: String,
    pub disabled_features: Vec<String>,
    /// Breakers that are open or half-open.
    pub open_breakers: Vec<String>,
    pub alerts_received: u64,
    pub alerts_delivered: u64,
    pub tracked_services: usize,
    pub event_subscriber_count: usize,
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::error::FetchError;
    use crate::load::StaticMetricsProvider;
    use crate::scheduler::MarketPair;

    struct NoopFetcher;

    #[async_trait]
    impl PriceFetcher for NoopFetcher {
        async fn fetch(&self, _key: &str) -> std::result::Result<Vec<MarketPair>, FetchError> {
            Ok(Vec::new())
        }
    }

    fn container(config: AppConfig) -> ServiceContainer {
        ServiceContainer::with_components(
            config,
            Arc::new(StaticMetricsProvider::new(5.0, 5.0)),
            Arc::new(NoopFetcher),
            Arc::new(InMemoryTokenRepository::new()),
        )
        .unwrap()
    }

    #[test]
    fn test_invalid_config_is_fatal() {
        let mut config = AppConfig::default();
        config.circuit_breaker.failure_threshold = 0;
        let result = ServiceContainer::with_components(
            config,
            Arc::new(StaticMetricsProvider::new(5.0, 5.0)),
            Arc::new(NoopFetcher),
            Arc::new(InMemoryTokenRepository::new()),
        );
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_apply_config_reaches_components() {
        let container = container(AppConfig::default());
        let breaker = container.registry.breaker("price_api");

        let mut config = AppConfig::default();
        config.circuit_breaker.failure_threshold = 2;
        config.scheduler.stuck_job_threshold_secs = 30;
        config.alerts.manager.rules.truncate(1);
        container.apply_config(Arc::new(config));

        assert_eq!(breaker.config().failure_threshold, 2);
        assert_eq!(container.jobs.stuck_threshold(), Duration::from_secs(30));
        assert_eq!(container.alerts.rules().len(), 1);
        assert_eq!(container.config().circuit_breaker.failure_threshold, 2);
    }

    #[tokio::test]
    async fn test_reload_event_is_applied() {
        let container = Arc::new(container(AppConfig::default()));
        container.start();

        let mut config = AppConfig::default();
        config.retry.max_attempts = 7;
        container.event_broadcaster.publish(ConfigUpdateEvent::Reloaded {
            config: Arc::new(config),
            changed: vec!["retry"],
        });

        for _ in 0..50 {
            if container.config().retry.max_attempts == 7 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(container.config().retry.max_attempts, 7);

        container
            .shutdown_with_timeout(Duration::from_secs(5))
            .await
            .unwrap();
        assert!(container.is_shutting_down());
    }

    #[tokio::test]
    async fn test_health_and_stats() {
        let container = container(AppConfig::default());
        let health = container.health().await;
        assert!(health.is_ready());
        let stats = container.stats();
        assert_eq!(stats.load_level, "normal");
        assert!(stats.open_breakers.is_empty());
    }
}
