//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → DaemonConfig (validated, immutable)
//!     → shared.rs (ArcSwap snapshot shared by all subsystems)
//!
//! On reload signal (SIGHUP, control channel, or watcher.rs):
//!     → lifecycle reload handler calls SharedConfig::reload
//!     → loader.rs loads new config
//!     → validation.rs validates
//!     → atomic swap of Arc<DaemonConfig>
//!     → subsystems observe new config
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; changes require full reload
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks
//! - A failed reload never replaces the active snapshot

pub mod loader;
pub mod schema;
pub mod shared;
pub mod validation;
pub mod watcher;

pub use loader::ConfigError;
pub use schema::{
    ControlConfig, DaemonConfig, ListenerConfig, MirrorConfig, MonitorConfig, ObservabilityConfig,
    ProcessConfig, StoreConfig, TimeoutConfig,
};
pub use shared::SharedConfig;
