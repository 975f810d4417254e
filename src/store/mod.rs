//! Shared data store.
//!
//! # Data Flow
//! ```text
//! startup:   state file (JSON) → mirrors.rs (MirrorStore)
//! monitor:   probe results     → MirrorStore::record_probe
//! http:      redirect lookup   → MirrorStore::pick
//! control:   status queries    → MirrorStore::snapshot
//! reload:    new mirror list   → MirrorStore::sync_mirrors
//! shutdown:  MirrorStore       → state file (JSON)
//! ```
//!
//! # Design Decisions
//! - Concurrent map, no global lock on the request path
//! - Configured order is kept separately so lookups are deterministic
//! - Persistence is best-effort; a missing file means an empty store

pub mod mirrors;

pub use mirrors::{MirrorState, MirrorStore};
