//! Configuration: TOML settings, validation and hot reload.
//!
//! [`AppConfig`] is read once at startup. [`ConfigWatcher`] then polls the
//! file and publishes [`ConfigUpdateEvent`]s that the service container
//! applies to the running components.

pub mod events;
mod settings;
mod watcher;

pub use events::{ConfigEventBroadcaster, ConfigUpdateEvent};
pub use settings::{
    API_BASE_URL_ENV, AlertsConfig, ApiConfig, AppConfig, CONFIG_PATH_ENV, DEFAULT_CONFIG_PATH,
    DEFAULT_LOG_FILTER, LoggingConfig, TokensConfig,
};
pub use watcher::ConfigWatcher;
