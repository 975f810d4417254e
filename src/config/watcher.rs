//! Configuration file watcher for hot reload.
//!
//! File changes are not applied here. The watcher only enqueues a
//! [`ControlSignal::ReloadConfig`] into the dispatcher queue, so watcher
//! reloads are serialized with every other lifecycle transition.

use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use crate::lifecycle::signals::{ControlSignal, Delivery, SignalSender};

/// A watcher that monitors the configuration file for changes.
pub struct ConfigWatcher {
    path: PathBuf,
    signals: SignalSender,
}

impl ConfigWatcher {
    /// Create a new ConfigWatcher feeding the given dispatcher queue.
    pub fn new(path: &Path, signals: SignalSender) -> Self {
        Self {
            path: path.to_path_buf(),
            signals,
        }
    }

    /// Start watching the file in a background thread.
    ///
    /// The returned watcher must be kept alive for as long as changes should
    /// be observed.
    pub fn run(self) -> Result<RecommendedWatcher, notify::Error> {
        let tx = self.signals.clone();

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    if event.kind.is_modify() || event.kind.is_create() {
                        tracing::info!("Config file change detected, requesting reload");
                        match tx.try_send(ControlSignal::ReloadConfig) {
                            Delivery::Queued => {}
                            Delivery::Coalesced => tracing::debug!("Reload already pending"),
                            Delivery::Dropped => tracing::warn!("Reload request dropped, dispatcher busy or gone"),
                        }
                    }
                }
                Err(e) => tracing::error!(error = ?e, "Config watch error"),
            },
            Config::default().with_poll_interval(Duration::from_secs(2)),
        )?;

        watcher.watch(&self.path, RecursiveMode::NonRecursive)?;

        tracing::info!(path = ?self.path, "Config watcher started");
        Ok(watcher)
    }
}
