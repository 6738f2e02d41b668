//! Polling watcher for the configuration file.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::events::{ConfigEventBroadcaster, ConfigUpdateEvent, changed_sections};
use super::settings::AppConfig;

/// Reloads the configuration file when its modification time changes.
///
/// A file that fails to parse or validate is reported and ignored; the
/// previous configuration stays in effect.
pub struct ConfigWatcher {
    path: PathBuf,
    interval: Duration,
    broadcaster: ConfigEventBroadcaster,
    current: Arc<AppConfig>,
    last_modified: Option<SystemTime>,
}

impl ConfigWatcher {
    /// `current` is the configuration in effect; changes are reported
    /// relative to it.
    pub fn new(
        path: impl Into<PathBuf>,
        interval: Duration,
        current: Arc<AppConfig>,
        broadcaster: ConfigEventBroadcaster,
    ) -> Self {
        let path = path.into();
        let last_modified = modified(&path);
        Self {
            path,
            interval,
            broadcaster,
            current,
            last_modified,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Check the file once. Returns the event published, if any.
    ///
    /// A touch that leaves every section unchanged publishes nothing.
    pub fn poll(&mut self) -> Option<ConfigUpdateEvent> {
        let mtime = modified(&self.path);
        if mtime.is_none() || mtime == self.last_modified {
            return None;
        }
        self.last_modified = mtime;

        let event = match AppConfig::load(&self.path) {
            Ok(config) => {
                let changed = changed_sections(&self.current, &config);
                if changed.is_empty() {
                    debug!(path = %self.path.display(), "Configuration file touched without changes");
                    return None;
                }
                info!(path = %self.path.display(), sections = ?changed, "Configuration file changed, reloading");
                let config = Arc::new(config);
                self.current = config.clone();
                ConfigUpdateEvent::Reloaded { config, changed }
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Rejected configuration change, keeping previous");
                ConfigUpdateEvent::ReloadFailed {
                    error: e.to_string(),
                }
            }
        };
        self.broadcaster.publish(event.clone());
        Some(event)
    }

    /// Poll until cancelled.
    pub async fn run(mut self, cancel: CancellationToken) {
        debug!(path = %self.path.display(), interval_secs = self.interval.as_secs(), "Config watcher started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Config watcher shutting down");
                    break;
                }
                _ = tokio::time::sleep(self.interval) => {
                    self.poll();
                }
            }
        }
    }
}

fn modified(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}
