//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! bind or inherited descriptor
//!     → listener.rs (master socket, runtime clones, handoff copies)
//!     → accept loop in http::server
//!     → connection.rs (lifecycle tracking)
//!
//! Connection States:
//!     Active → Draining → Closed
//! ```
//!
//! # Design Decisions
//! - The master socket outlives any single accept loop
//! - Accept errors are classified by kind, never by message text
//! - Each connection tracked for graceful shutdown

pub mod connection;
pub mod listener;

pub use listener::{BoundListener, ListenerError};
