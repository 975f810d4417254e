//! HTTP request serving subsystem.
//!
//! # Data Flow
//! ```text
//! TCP connection (listener held by server.rs, possibly inherited)
//!     → server.rs accept loop (connection tracking, limit)
//!     → hyper-util auto builder (HTTP/1.1 or HTTP/2)
//!     → Axum router (timeout, trace)
//!     → /healthz, or 302 to the first healthy mirror from the store
//! ```

pub mod server;

pub use server::{HttpServer, ServerError};
