//! Remote control channel.
//!
//! # Data Flow
//! ```text
//! operator (redirectd CLI, curl)
//!     → auth.rs (Bearer key from the live config)
//!     → handlers.rs
//!         GET  /admin/status         generation, listener, connections
//!         GET  /admin/mirrors        mirror store snapshot
//!         POST /admin/signal/{name}  → dispatcher queue (same path as OS signals)
//! ```
//!
//! The channel is closed during graceful shutdown and before an upgrade, and
//! reopened if the upgrade fails to launch.

pub mod auth;
pub mod handlers;

use std::io;
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use arc_swap::ArcSwapOption;
use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use thiserror::Error;
use tokio::sync::oneshot;

use crate::config::SharedConfig;
use crate::http::HttpServer;
use crate::lifecycle::context::Generation;
use crate::lifecycle::signals::SignalSender;
use crate::lifecycle::{ControlChannel, SubsystemError};
use crate::store::MirrorStore;

use self::auth::admin_auth_middleware;
use self::handlers::{get_mirrors, get_status, post_signal};

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("Invalid control address '{address}': {source}")]
    InvalidAddress {
        address: String,
        source: std::net::AddrParseError,
    },

    #[error("Failed to bind control channel on {address}: {source}")]
    Bind { address: SocketAddr, source: io::Error },

    #[error("Control channel needs a running Tokio runtime: {0}")]
    Runtime(io::Error),
}

/// Handles the control handlers read from.
///
/// Filled in by the controller as the subsystems come up; a handler that
/// finds a handle missing reports it as absent.
pub struct ControlState {
    pub config: Arc<SharedConfig>,
    pub signals: SignalSender,
    pub store: ArcSwapOption<MirrorStore>,
    pub generation: ArcSwapOption<Generation>,
    pub server: ArcSwapOption<HttpServer>,
}

struct Running {
    addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
}

/// The control channel server.
pub struct ControlServer {
    state: Arc<ControlState>,
    running: Mutex<Option<Running>>,
}

impl ControlServer {
    pub fn new(config: Arc<SharedConfig>, signals: SignalSender) -> Self {
        Self {
            state: Arc::new(ControlState {
                config,
                signals,
                store: ArcSwapOption::empty(),
                generation: ArcSwapOption::empty(),
                server: ArcSwapOption::empty(),
            }),
            running: Mutex::new(None),
        }
    }

    pub fn set_store(&self, store: MirrorStore) {
        self.state.store.store(Some(Arc::new(store)));
    }

    pub fn set_generation(&self, generation: Arc<Generation>) {
        self.state.generation.store(Some(generation));
    }

    pub fn set_request_server(&self, server: Arc<HttpServer>) {
        self.state.server.store(Some(server));
    }

    /// Address the channel is serving on, if open.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.lock_running().as_ref().map(|r| r.addr)
    }

    /// Bind and start serving. Returns `None` when the channel is disabled.
    ///
    /// Must be called from within the Tokio runtime. Starting an open
    /// channel is a no-op.
    pub fn start(&self) -> Result<Option<SocketAddr>, ControlError> {
        let settings = self.state.config.current().control.clone();
        if !settings.enabled {
            return Ok(None);
        }

        let mut running = self.lock_running();
        if let Some(current) = running.as_ref() {
            return Ok(Some(current.addr));
        }

        let address: SocketAddr = settings.bind_address.parse().map_err(|source| ControlError::InvalidAddress {
            address: settings.bind_address.clone(),
            source,
        })?;
        let std_listener = StdTcpListener::bind(address).map_err(|source| ControlError::Bind { address, source })?;
        std_listener.set_nonblocking(true).map_err(ControlError::Runtime)?;
        let addr = std_listener.local_addr().map_err(ControlError::Runtime)?;
        let listener = tokio::net::TcpListener::from_std(std_listener).map_err(ControlError::Runtime)?;

        let (shutdown, shutdown_rx) = oneshot::channel::<()>();
        let app = router(Arc::clone(&self.state));
        tokio::spawn(async move {
            let served = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.await;
                })
                .await;
            if let Err(e) = served {
                tracing::error!(error = %e, "Control channel failed");
            }
            tracing::debug!(address = %addr, "Control channel stopped serving");
        });

        tracing::info!(address = %addr, "Control channel listening");
        *running = Some(Running { addr, shutdown });
        Ok(Some(addr))
    }

    /// Start, retrying while the address is still held by a draining
    /// predecessor.
    pub async fn start_with_retry(&self, attempts: u32, delay: Duration) -> Result<Option<SocketAddr>, ControlError> {
        let mut attempt = 1;
        loop {
            match self.start() {
                Err(ControlError::Bind { address, source })
                    if source.kind() == io::ErrorKind::AddrInUse && attempt < attempts =>
                {
                    tracing::debug!(address = %address, attempt, "Control address still in use, retrying");
                    attempt += 1;
                    tokio::time::sleep(delay).await;
                }
                result => return result,
            }
        }
    }

    fn lock_running(&self) -> MutexGuard<'_, Option<Running>> {
        self.running.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl ControlChannel for ControlServer {
    fn close(&self) -> Result<(), SubsystemError> {
        if let Some(running) = self.lock_running().take() {
            // The serve task may already be gone; nothing left to stop then.
            let _ = running.shutdown.send(());
            tracing::info!(address = %running.addr, "Control channel closed");
        }
        Ok(())
    }

    fn reopen(&self) -> Result<(), SubsystemError> {
        self.start()?;
        Ok(())
    }
}

/// Build the control router.
pub fn router(state: Arc<ControlState>) -> Router {
    Router::new()
        .route("/admin/status", get(get_status))
        .route("/admin/mirrors", get(get_mirrors))
        .route("/admin/signal/{name}", post(post_signal))
        .layer(middleware::from_fn_with_state(Arc::clone(&state), admin_auth_middleware))
        .with_state(state)
}
