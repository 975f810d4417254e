//! Active mirror monitoring.
//!
//! # Responsibilities
//! - Periodically probe every mirror in the store
//! - Update mirror health state based on results
//! - Stop on request and report when the loop has exited

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time;

use crate::config::SharedConfig;
use crate::lifecycle::BackgroundMonitor;
use crate::observability::metrics;
use crate::store::{MirrorState, MirrorStore};

pub struct MirrorMonitor {
    store: MirrorStore,
    config: Arc<SharedConfig>,
    client: reqwest::Client,
    stop_tx: watch::Sender<bool>,
    finished_tx: watch::Sender<bool>,
}

impl MirrorMonitor {
    pub fn new(store: MirrorStore, config: Arc<SharedConfig>) -> Self {
        let client = reqwest::Client::builder()
            .user_agent(concat!("redirectd-monitor/", env!("CARGO_PKG_VERSION")))
            .redirect(reqwest::redirect::Policy::none())
            .no_proxy()
            .build()
            .unwrap_or_default();

        Self {
            store,
            config,
            client,
            stop_tx: watch::Sender::new(false),
            finished_tx: watch::Sender::new(true),
        }
    }

    /// Spawn the run loop on the current runtime.
    ///
    /// The monitor counts as running from this call on, so a `wait` issued
    /// before the task is first polled still blocks.
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        self.finished_tx.send_replace(false);
        let monitor = Arc::clone(self);
        tokio::spawn(async move { monitor.run().await })
    }

    /// Probe mirrors until `stop` is called.
    pub async fn run(&self) {
        self.finished_tx.send_replace(false);
        let mut stop_rx = self.stop_tx.subscribe();

        let settings = self.config.current().monitor.clone();
        tracing::info!(
            interval = settings.interval_secs,
            path = %settings.path,
            mirrors = self.store.len(),
            "Mirror monitor starting"
        );

        let mut ticker = time::interval(Duration::from_secs(settings.interval_secs));
        ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

        loop {
            if *stop_rx.borrow_and_update() {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => {
                    self.check_all().await;
                }
                changed = stop_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        tracing::info!("Mirror monitor stopped");
        self.finished_tx.send_replace(true);
    }

    /// Block until the run loop has exited (immediately if it never ran).
    pub async fn wait(&self) {
        let mut rx = self.finished_tx.subscribe();
        // The sender lives in self, so the channel cannot close while we wait.
        let _ = rx.wait_for(|finished| *finished).await;
    }

    async fn check_all(&self) {
        let settings = self.config.current().monitor.clone();
        let timeout = Duration::from_secs(settings.timeout_secs);

        for mirror in self.store.snapshot() {
            let healthy = self.probe(&mirror, &settings.path, timeout).await;
            if let Some(state) = self.store.record_probe(
                &mirror.name,
                healthy,
                settings.healthy_threshold,
                settings.unhealthy_threshold,
            ) {
                tracing::info!(mirror = %mirror.name, state = ?state, "Mirror health changed");
            }
            metrics::record_mirror_health(&mirror.name, healthy);
        }
    }

    async fn probe(&self, mirror: &MirrorState, path: &str, timeout: Duration) -> bool {
        let url = format!(
            "{}/{}",
            mirror.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        );

        match time::timeout(timeout, self.client.get(&url).send()).await {
            Ok(Ok(response)) => {
                let status = response.status();
                let success = status.is_success() || status.is_redirection();
                if !success {
                    tracing::warn!(mirror = %mirror.name, status = %status, "Probe failed: non-success status");
                }
                success
            }
            Ok(Err(e)) => {
                tracing::warn!(mirror = %mirror.name, error = %e, "Probe failed: connection error");
                false
            }
            Err(_) => {
                tracing::warn!(mirror = %mirror.name, "Probe failed: timeout");
                false
            }
        }
    }
}

impl BackgroundMonitor for MirrorMonitor {
    fn stop(&self) {
        self.stop_tx.send_replace(true);
    }
}
