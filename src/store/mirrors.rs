//! Mirror state caching and persistence.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use arc_swap::ArcSwap;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::config::MirrorConfig;
use crate::health::state::{HealthRecord, HealthState};

/// Everything the daemon knows about one mirror.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MirrorState {
    pub name: String,
    pub base_url: String,
    #[serde(default)]
    pub health: HealthRecord,
    /// Last probe timestamp (seconds since epoch).
    #[serde(default)]
    pub last_checked: Option<u64>,
}

impl MirrorState {
    fn from_config(config: &MirrorConfig) -> Self {
        Self {
            name: config.name.clone(),
            base_url: config.base_url.clone(),
            health: HealthRecord::default(),
            last_checked: None,
        }
    }
}

/// A thread-safe store of mirror state shared by the monitor, the request
/// server and the control channel.
#[derive(Clone, Default)]
pub struct MirrorStore {
    inner: Arc<DashMap<String, MirrorState>>,
    order: Arc<ArcSwap<Vec<String>>>,
    persistence_path: Option<PathBuf>,
}

impl std::fmt::Debug for MirrorStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MirrorStore")
            .field("mirrors", &self.inner.len())
            .field("persistence_path", &self.persistence_path)
            .finish()
    }
}

impl MirrorStore {
    /// Create a new empty store.
    pub fn new(persistence_path: Option<PathBuf>) -> Self {
        Self {
            inner: Arc::new(DashMap::new()),
            order: Arc::new(ArcSwap::from_pointee(Vec::new())),
            persistence_path,
        }
    }

    /// Load from file if it exists.
    pub fn load_from_file(path: &Path) -> std::io::Result<Self> {
        let store = Self::new(Some(path.to_path_buf()));
        if path.exists() {
            let reader = BufReader::new(File::open(path)?);
            let saved: Vec<MirrorState> = serde_json::from_reader(reader)?;

            let order = saved.iter().map(|m| m.name.clone()).collect();
            for mirror in saved {
                store.inner.insert(mirror.name.clone(), mirror);
            }
            store.order.store(Arc::new(order));
            tracing::info!(mirrors = store.inner.len(), path = %path.display(), "Loaded mirror state");
        }
        Ok(store)
    }

    /// Persist the store to its file, if it has one.
    pub fn save_to_file(&self) -> std::io::Result<()> {
        let Some(path) = self.persistence_path.as_deref() else {
            return Ok(());
        };
        let writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer(writer, &self.snapshot())?;
        tracing::debug!(path = %path.display(), "Mirror state saved");
        Ok(())
    }

    /// Align the store with the configured mirror list.
    ///
    /// Known mirrors keep their health history; removed mirrors are dropped.
    pub fn sync_mirrors(&self, mirrors: &[MirrorConfig]) {
        let wanted: HashMap<&str, &MirrorConfig> =
            mirrors.iter().map(|m| (m.name.as_str(), m)).collect();

        self.inner.retain(|name, _| wanted.contains_key(name.as_str()));
        for mirror in mirrors {
            self.inner
                .entry(mirror.name.clone())
                .and_modify(|state| state.base_url = mirror.base_url.clone())
                .or_insert_with(|| MirrorState::from_config(mirror));
        }
        self.order
            .store(Arc::new(mirrors.iter().map(|m| m.name.clone()).collect()));
    }

    /// Apply a probe result. Returns the new state on a transition.
    pub fn record_probe(
        &self,
        name: &str,
        success: bool,
        healthy_threshold: u32,
        unhealthy_threshold: u32,
    ) -> Option<HealthState> {
        let mut entry = self.inner.get_mut(name)?;
        entry.last_checked = Some(now_secs());
        if success {
            entry.health.mark_success(healthy_threshold)
        } else {
            entry.health.mark_failure(unhealthy_threshold)
        }
    }

    /// First healthy mirror in configured order.
    pub fn pick(&self) -> Option<MirrorState> {
        self.order.load().iter().find_map(|name| {
            self.inner
                .get(name)
                .filter(|m| m.health.is_healthy())
                .map(|m| m.value().clone())
        })
    }

    /// All mirrors in configured order.
    pub fn snapshot(&self) -> Vec<MirrorState> {
        self.order
            .load()
            .iter()
            .filter_map(|name| self.inner.get(name).map(|m| m.value().clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
