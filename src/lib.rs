//! Mirror redirector daemon library.

pub mod admin;
pub mod cli;
pub mod config;
pub mod health;
pub mod http;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod store;

pub use config::{DaemonConfig, SharedConfig};
pub use http::HttpServer;
pub use lifecycle::run_daemon;
