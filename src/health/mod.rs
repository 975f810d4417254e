//! Mirror health subsystem.
//!
//! # Data Flow
//! ```text
//! Active monitoring (monitor.rs):
//!     Periodic timer
//!     → Probe each mirror
//!     → Update state.rs records in the mirror store
//!
//! State machine (state.rs):
//!     Healthy ←→ Unhealthy
//!     With thresholds to prevent flapping
//! ```
//!
//! # Design Decisions
//! - Health state is per-mirror
//! - State transitions require consecutive successes/failures
//! - The monitor is cancellable and reports when its loop has exited

pub mod monitor;
pub mod state;

pub use monitor::MirrorMonitor;
