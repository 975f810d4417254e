//! Daemon startup, serving and cleanup.
//!
//! # Startup order
//! 1. Adopt an inherited listener, if this generation was launched by an
//!    upgrade
//! 2. Claim the identity record (fresh start only; an upgraded generation
//!    claims it once it is serving)
//! 3. Metrics, data store, signal queue
//! 4. Control channel, request server socket, monitor
//! 5. Signal forwarding, dispatcher, config watcher
//! 6. Upgrade handshake: once serving, take identity and SIGQUIT the parent

use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::admin::{ControlError, ControlServer};
use crate::config::watcher::ConfigWatcher;
use crate::config::{DaemonConfig, SharedConfig};
use crate::health::MirrorMonitor;
use crate::http::{HttpServer, ServerError};
use crate::lifecycle::context::{Generation, GenerationState, ProcessContext};
use crate::lifecycle::handoff::{self, HandoffError, LaunchSpec};
use crate::lifecycle::identity::{IdentityError, ProcessIdentity};
use crate::lifecycle::signals::{self, ControlSignal, Delivery, SignalDispatcher};
use crate::lifecycle::{BackgroundMonitor, ControlChannel};
use crate::net::ListenerError;
use crate::observability::{metrics, LogSink};
use crate::store::MirrorStore;

/// Bind attempts for the control channel while a predecessor releases it.
const CONTROL_BIND_ATTEMPTS: u32 = 20;
const CONTROL_BIND_DELAY: Duration = Duration::from_millis(100);

/// Errors that abort startup.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error(transparent)]
    Identity(#[from] IdentityError),

    #[error(transparent)]
    Handoff(#[from] HandoffError),

    #[error(transparent)]
    Listener(#[from] ListenerError),

    #[error(transparent)]
    Control(#[from] ControlError),

    #[error("Failed to register signal handlers: {0}")]
    Signals(#[source] io::Error),
}

/// Run the daemon until it terminates. Returns the process exit code.
pub async fn run_daemon(config: Arc<SharedConfig>, logs: LogSink, launch: LaunchSpec) -> Result<i32, StartupError> {
    let settings = config.current();
    let identity = Arc::new(ProcessIdentity::for_current_process(&settings.process.pid_file));

    let inherited = identity.recover()?;
    let parent_pid = inherited.as_ref().and_then(|i| i.parent_pid);
    if inherited.is_none() {
        identity.acquire()?;
    }

    let generation = Arc::new(Generation::current(parent_pid));
    tracing::info!(
        generation = %generation.id,
        pid = generation.pid,
        parent_pid = ?parent_pid,
        "redirectd v{} starting",
        env!("CARGO_PKG_VERSION")
    );

    let started = start(&settings, config, identity.clone(), generation, inherited, logs, launch).await;
    match started {
        Ok(ctx) => Ok(serve(ctx).await),
        Err(e) => {
            if let Err(release) = identity.release() {
                tracing::warn!(error = %release, "Failed to remove identity record");
            }
            Err(e)
        }
    }
}

struct Running {
    ctx: Arc<ProcessContext>,
    server: Arc<HttpServer>,
    monitor: Arc<MirrorMonitor>,
    store: MirrorStore,
    tasks: Vec<tokio::task::JoinHandle<()>>,
    _watcher: Option<notify::RecommendedWatcher>,
}

async fn start(
    settings: &DaemonConfig,
    config: Arc<SharedConfig>,
    identity: Arc<ProcessIdentity>,
    generation: Arc<Generation>,
    inherited: Option<handoff::InheritedListener>,
    logs: LogSink,
    launch: LaunchSpec,
) -> Result<Running, StartupError> {
    if settings.observability.metrics_enabled {
        match settings.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(_) => tracing::error!(
                metrics_address = %settings.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let store = open_store(settings);
    let (signal_tx, signal_rx) = signals::channel();

    let control = Arc::new(ControlServer::new(config.clone(), signal_tx.clone()));
    control.set_store(store.clone());
    control.set_generation(generation.clone());
    if inherited.is_some() {
        control.start_with_retry(CONTROL_BIND_ATTEMPTS, CONTROL_BIND_DELAY).await?;
    } else {
        control.start()?;
    }

    let server = Arc::new(HttpServer::new(config.clone(), store.clone()));
    let parent_pid = inherited.as_ref().and_then(|i| i.parent_pid);
    let upgraded = inherited.is_some();
    let bound = match inherited {
        Some(inherited) => {
            server.set_listener(inherited.listener);
            Ok(())
        }
        None => server.bind().map(|_| ()),
    };
    if let Err(e) = bound {
        close_control(&control);
        return Err(e.into());
    }
    control.set_request_server(server.clone());

    let monitor = Arc::new(MirrorMonitor::new(store.clone(), config.clone()));
    let mut tasks = Vec::new();
    if settings.monitor.enabled {
        tasks.push(monitor.spawn());
    }

    let ctx = Arc::new(ProcessContext::new(
        generation,
        config.clone(),
        identity,
        server.clone(),
        monitor.clone(),
        control.clone(),
        logs,
        launch,
    ));

    let forwarder = match signals::forward_os_signals(signal_tx.clone()) {
        Ok(handle) => handle,
        Err(e) => {
            monitor.stop();
            close_control(&control);
            return Err(StartupError::Signals(e));
        }
    };
    tasks.push(forwarder);
    tasks.push(tokio::spawn(SignalDispatcher::new(ctx.clone(), signal_rx).run()));

    let watcher = match config.path() {
        Some(path) if settings.process.watch_config => watch_config(path, signal_tx.clone()),
        _ => None,
    };

    if upgraded {
        tasks.push(tokio::spawn(complete_upgrade(
            ctx.clone(),
            server.clone(),
            signal_tx.clone(),
            parent_pid,
        )));
    }

    Ok(Running {
        ctx,
        server,
        monitor,
        store,
        tasks,
        _watcher: watcher,
    })
}

fn close_control(control: &ControlServer) {
    if let Err(e) = control.close() {
        tracing::warn!(error = %e, "Failed to close control channel");
    }
}

fn open_store(settings: &DaemonConfig) -> MirrorStore {
    let store = match settings.store.state_path.as_deref() {
        Some(path) => MirrorStore::load_from_file(Path::new(path)).unwrap_or_else(|e| {
            tracing::warn!(path = %path, error = %e, "Failed to load mirror state, starting empty");
            MirrorStore::new(Some(path.into()))
        }),
        None => MirrorStore::new(None),
    };
    store.sync_mirrors(&settings.monitor.mirrors);
    store
}

fn watch_config(path: &Path, signals: signals::SignalSender) -> Option<notify::RecommendedWatcher> {
    match ConfigWatcher::new(path, signals).run() {
        Ok(watcher) => Some(watcher),
        Err(e) => {
            tracing::error!(error = %e, "Failed to start config watcher");
            None
        }
    }
}

/// Second half of the upgrade handshake, run by the new generation.
///
/// If the identity cannot be taken over, this generation drains what it
/// accepted and exits with 1, leaving the parent to resume.
async fn complete_upgrade(
    ctx: Arc<ProcessContext>,
    server: Arc<HttpServer>,
    signals: signals::SignalSender,
    parent_pid: Option<u32>,
) {
    let addr = server.ready().await;
    if ctx.generation.state() >= GenerationState::Draining {
        tracing::warn!("Stopped before taking over; leaving the previous generation running");
        return;
    }

    if let Err(e) = ctx.identity.acquire_from(parent_pid) {
        tracing::error!(error = %e, "Cannot take over identity; abandoning upgrade");
        ctx.set_exit_code(1);
        if signals.send(ControlSignal::Quit).await == Delivery::Dropped {
            ctx.request_exit(1);
        }
        return;
    }

    match parent_pid {
        Some(parent) => match handoff::terminate_parent(parent) {
            Ok(()) => tracing::info!(address = %addr, parent_pid = parent, "Upgrade complete"),
            Err(e) => tracing::error!(error = %e, "Failed to signal previous generation"),
        },
        None => tracing::warn!("Inherited listener without a parent pid; nothing to signal"),
    }
}

async fn serve(running: Running) -> i32 {
    let Running {
        ctx,
        server,
        monitor,
        store,
        tasks,
        _watcher,
    } = running;

    ctx.generation.advance(GenerationState::Running);

    let serve_loop = async {
        loop {
            server.run().await?;
            if !server.take_restarting() {
                return Ok::<(), ServerError>(());
            }
            tracing::info!(
                address = %ctx.config.current().listener.bind_address,
                "Rebinding listener"
            );
        }
    };

    let (code, immediate) = tokio::select! {
        result = serve_loop => match result {
            Ok(()) => (ctx.exit_code(), false),
            Err(e) => {
                tracing::error!(error = %e, "Request server failed");
                (1, false)
            }
        },
        code = ctx.exit_signal() => (code, true),
    };

    // Cleanup.
    monitor.stop();
    if !immediate {
        let limit = Duration::from_secs(ctx.config.current().monitor.timeout_secs + 1);
        if tokio::time::timeout(limit, monitor.wait()).await.is_err() {
            tracing::warn!("Mirror monitor did not stop in time");
        }
    }
    if let Err(e) = ctx.control.close() {
        tracing::warn!(error = %e, "Failed to close control channel");
    }
    for task in &tasks {
        task.abort();
    }
    if let Err(e) = store.save_to_file() {
        tracing::warn!(error = %e, "Failed to persist mirror state");
    }

    ctx.generation.advance(GenerationState::Terminated);
    if let Err(e) = ctx.identity.release() {
        tracing::warn!(error = %e, "Failed to remove identity record");
    }

    tracing::info!(exit_code = code, "Shutdown complete");
    code
}
