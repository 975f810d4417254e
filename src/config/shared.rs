//! Live configuration handle.
//!
//! Holds the active configuration behind an `ArcSwap` so readers always see a
//! complete snapshot and a failed reload never leaves a half-applied state.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::config::loader::{load_config, ConfigError};
use crate::config::schema::DaemonConfig;

/// Shared, atomically swappable configuration bound to its backing file.
#[derive(Debug)]
pub struct SharedConfig {
    path: Option<PathBuf>,
    current: ArcSwap<DaemonConfig>,
}

impl SharedConfig {
    /// Load the configuration file for the first time.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let config = load_config(path)?;
        Ok(Self {
            path: Some(path.to_path_buf()),
            current: ArcSwap::from_pointee(config),
        })
    }

    /// Wrap an in-memory configuration with no backing file.
    pub fn from_config(config: DaemonConfig) -> Self {
        Self {
            path: None,
            current: ArcSwap::from_pointee(config),
        }
    }

    /// Re-read the backing file and swap it in.
    ///
    /// On error the active configuration is left untouched. Returns the
    /// previous and the new snapshot on success.
    pub fn reload(&self) -> Result<(Arc<DaemonConfig>, Arc<DaemonConfig>), ConfigError> {
        let Some(path) = self.path.as_deref() else {
            let current = self.current();
            return Ok((current.clone(), current));
        };

        let next = Arc::new(load_config(path)?);
        let previous = self.current.swap(next.clone());
        Ok((previous, next))
    }

    /// Snapshot of the active configuration.
    pub fn current(&self) -> Arc<DaemonConfig> {
        self.current.load_full()
    }

    /// Path of the backing file, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}
