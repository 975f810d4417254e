//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (controller.rs):
//!     Adopt inherited listener (identity.rs recover) or acquire identity
//!     → store → control channel → request server socket → monitor
//!     → signal forwarding + dispatcher → serve until terminated
//!     → wait for monitor → release identity
//!
//! Signals (signals.rs):
//!     SIGINT/SIGTERM → remove identity, exit now
//!     SIGQUIT        → shutdown.rs graceful sequence
//!     SIGHUP         → reload.rs
//!     SIGUSR1        → reopen log file
//!     SIGUSR2        → handoff.rs seamless upgrade
//!
//! Shutdown (shutdown.rs):
//!     Stop monitor → close control → stop accepting → drain (bounded) → exit
//!
//! Upgrade (handoff.rs):
//!     Close control → pause accepting → spawn new generation with
//!     listener at fd 3 → new generation serves, takes identity, sends SIGQUIT
//!     → old generation drains and exits
//!     (new generation exits first → old resumes accepting, reopens control)
//! ```
//!
//! # Design Decisions
//! - One dispatcher task handles signals serially
//! - Shutdown has a deadline: forced close after drain timeout
//! - The listening socket is never closed across an upgrade
//! - Subsystem failures during shutdown are logged, never fatal

pub mod context;
pub mod controller;
pub mod handoff;
pub mod identity;
pub mod reload;
pub mod shutdown;
pub mod signals;

#[cfg(test)]
pub(crate) mod testing;

use std::time::Duration;

pub use context::{Generation, GenerationState, ProcessContext};
pub use controller::{run_daemon, StartupError};
pub use handoff::{HandoffError, HandoffToken, LaunchSpec};
pub use identity::{IdentityError, ProcessIdentity};
pub use signals::{ControlSignal, ShutdownRequest, SignalDispatcher, SignalSender};

/// Error reported by a subsystem while it is being stopped or reconfigured.
pub type SubsystemError = Box<dyn std::error::Error + Send + Sync>;

/// The request-serving side as seen by the lifecycle handlers.
pub trait RequestServer: Send + Sync {
    /// Whether a listening socket is currently held.
    fn has_listener(&self) -> bool;

    /// Stop accepting and let in-flight work finish within `deadline`.
    ///
    /// Returns immediately; the serve loop enforces the deadline.
    fn stop(&self, deadline: Duration);

    /// Apply the current configuration without touching the socket.
    fn reload(&self);

    /// Mark the next stop as a listener restart rather than a shutdown.
    fn set_restarting(&self, restarting: bool);

    /// Pause or resume accepting without giving up the socket.
    fn set_accepting(&self, accepting: bool);

    /// Duplicate the listening socket for transfer to a new generation.
    fn handoff_token(&self) -> Result<Option<HandoffToken>, HandoffError>;
}

/// The background monitor as seen by the lifecycle handlers.
pub trait BackgroundMonitor: Send + Sync {
    /// Ask the run loop to exit. Does not wait.
    fn stop(&self);
}

/// The remote-control channel as seen by the lifecycle handlers.
pub trait ControlChannel: Send + Sync {
    /// Stop accepting control calls.
    fn close(&self) -> Result<(), SubsystemError>;

    /// Start accepting control calls again after a `close`.
    fn reopen(&self) -> Result<(), SubsystemError>;
}
