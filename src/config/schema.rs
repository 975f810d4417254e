//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the daemon.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};

/// Root configuration for the redirector daemon.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
#[serde(default)]
pub struct DaemonConfig {
    /// Listener configuration (bind address).
    pub listener: ListenerConfig,

    /// Remote control channel settings.
    pub control: ControlConfig,

    /// Mirror monitor settings and the mirror list.
    pub monitor: MonitorConfig,

    /// Shared data store settings.
    pub store: StoreConfig,

    /// Process identity and upgrade settings.
    pub process: ProcessConfig,

    /// Timeout configuration.
    pub timeouts: TimeoutConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    pub bind_address: String,

    /// Maximum concurrent connections (backpressure).
    pub max_connections: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            max_connections: 10_000,
        }
    }
}

/// Control channel configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ControlConfig {
    /// Enable the control channel.
    pub enabled: bool,

    /// API key for authentication (Bearer token).
    pub api_key: String,

    /// Control channel bind address.
    pub bind_address: String,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            // WARNING: This is a placeholder! Change this in production.
            api_key: "CHANGE_ME_IN_PRODUCTION".to_string(),
            bind_address: "127.0.0.1:8081".to_string(),
        }
    }
}

/// A single mirror the redirector may send clients to.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct MirrorConfig {
    /// Unique mirror identifier.
    pub name: String,

    /// Base URL requests are redirected to (e.g., "https://mirror.example.org/pub/").
    pub base_url: String,
}

/// Mirror monitor configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct MonitorConfig {
    /// Enable the background monitor.
    pub enabled: bool,

    /// Probe interval in seconds.
    pub interval_secs: u64,

    /// Probe timeout in seconds.
    pub timeout_secs: u64,

    /// Path probed on each mirror, relative to its base URL.
    pub path: String,

    /// Number of consecutive failures before marking a mirror down.
    pub unhealthy_threshold: u32,

    /// Number of consecutive successes before marking a mirror up.
    pub healthy_threshold: u32,

    /// Mirrors known to the daemon.
    pub mirrors: Vec<MirrorConfig>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 30,
            timeout_secs: 5,
            path: "/".to_string(),
            unhealthy_threshold: 3,
            healthy_threshold: 2,
            mirrors: Vec::new(),
        }
    }
}

/// Shared data store configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Default)]
#[serde(default)]
pub struct StoreConfig {
    /// JSON file the mirror state is loaded from and persisted to.
    pub state_path: Option<String>,
}

/// Process identity and upgrade configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ProcessConfig {
    /// Path of the PID file holding the active generation's process id.
    pub pid_file: String,

    /// Reload automatically when the config file changes on disk.
    pub watch_config: bool,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            pid_file: "/run/redirectd.pid".to_string(),
            watch_config: false,
        }
    }
}

/// Timeout configuration for various operations.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Request timeout in seconds.
    pub request_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self { request_secs: 30 }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Write logs to this file instead of stderr. Reopened on SIGUSR1.
    pub log_file: Option<String>,

    /// Emit JSON log lines.
    pub json_logs: bool,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_file: None,
            json_logs: false,
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9090".to_string(),
        }
    }
}
