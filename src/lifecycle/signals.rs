//! OS signal handling and dispatch.
//!
//! # Responsibilities
//! - Register the control signals (SIGINT, SIGTERM, SIGQUIT, SIGHUP, SIGUSR1, SIGUSR2)
//! - Forward them, and signals injected by the control channel or the config
//!   watcher, into one bounded queue
//! - Drain the queue from a single task and route each signal to one handler
//!
//! # Design Decisions
//! - Uses Tokio's signal handling (async-safe)
//! - Handlers run one at a time, so two lifecycle transitions never interleave
//! - At most one reload is pending; further reload requests are coalesced
//! - Signals not listed above are never registered, so they keep their
//!   default disposition

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::lifecycle::context::ProcessContext;
use crate::lifecycle::{handoff, reload, shutdown};
use crate::observability::metrics;

/// Capacity of the dispatcher queue.
pub const SIGNAL_QUEUE_CAPACITY: usize = 16;

/// A control signal understood by the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlSignal {
    /// SIGINT.
    Interrupt,
    /// SIGTERM.
    Terminate,
    /// SIGQUIT: graceful stop.
    Quit,
    /// SIGHUP: reload configuration.
    ReloadConfig,
    /// SIGUSR1: reopen log files.
    ReopenLogs,
    /// SIGUSR2: seamless binary upgrade.
    Upgrade,
}

impl ControlSignal {
    pub const ALL: [ControlSignal; 6] = [
        ControlSignal::Interrupt,
        ControlSignal::Terminate,
        ControlSignal::Quit,
        ControlSignal::ReloadConfig,
        ControlSignal::ReopenLogs,
        ControlSignal::Upgrade,
    ];

    /// Name used on the control channel and in logs.
    pub fn name(self) -> &'static str {
        match self {
            ControlSignal::Interrupt => "interrupt",
            ControlSignal::Terminate => "terminate",
            ControlSignal::Quit => "quit",
            ControlSignal::ReloadConfig => "reload",
            ControlSignal::ReopenLogs => "reopen-logs",
            ControlSignal::Upgrade => "upgrade",
        }
    }

    /// Parse a control-channel name. Unknown names yield `None`.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.name() == name)
    }

    /// The OS signal this control signal is delivered by.
    pub fn kind(self) -> SignalKind {
        match self {
            ControlSignal::Interrupt => SignalKind::interrupt(),
            ControlSignal::Terminate => SignalKind::terminate(),
            ControlSignal::Quit => SignalKind::quit(),
            ControlSignal::ReloadConfig => SignalKind::hangup(),
            ControlSignal::ReopenLogs => SignalKind::user_defined1(),
            ControlSignal::Upgrade => SignalKind::user_defined2(),
        }
    }

    /// The lifecycle transition this signal asks for, if any.
    pub fn request(self) -> Option<ShutdownRequest> {
        match self {
            ControlSignal::Interrupt | ControlSignal::Terminate => Some(ShutdownRequest::Terminate),
            ControlSignal::Quit => Some(ShutdownRequest::Quit),
            ControlSignal::ReloadConfig => Some(ShutdownRequest::ForceReload),
            ControlSignal::Upgrade => Some(ShutdownRequest::Upgrade),
            ControlSignal::ReopenLogs => None,
        }
    }
}

/// A lifecycle transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownRequest {
    /// Graceful drain, then exit.
    Quit,
    /// Reload configuration only.
    ForceReload,
    /// Reload configuration and rebind the listener.
    ListenerRestart,
    /// Hand the listener to a new generation.
    Upgrade,
    /// Exit immediately.
    Terminate,
}

/// Result of offering a signal to the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Queued,
    /// A reload was already pending; this one folds into it.
    Coalesced,
    /// The dispatcher is gone or the queue is full.
    Dropped,
}

/// Producer side of the dispatcher queue.
#[derive(Debug, Clone)]
pub struct SignalSender {
    tx: mpsc::Sender<ControlSignal>,
    pending_reload: Arc<AtomicBool>,
}

impl SignalSender {
    /// Queue a signal, waiting for room.
    pub async fn send(&self, signal: ControlSignal) -> Delivery {
        if self.coalesce(signal) {
            return Delivery::Coalesced;
        }
        match self.tx.send(signal).await {
            Ok(()) => Delivery::Queued,
            Err(_) => {
                self.unmark(signal);
                Delivery::Dropped
            }
        }
    }

    /// Queue a signal without waiting. Usable outside the runtime.
    pub fn try_send(&self, signal: ControlSignal) -> Delivery {
        if self.coalesce(signal) {
            return Delivery::Coalesced;
        }
        match self.tx.try_send(signal) {
            Ok(()) => Delivery::Queued,
            Err(_) => {
                self.unmark(signal);
                Delivery::Dropped
            }
        }
    }

    fn coalesce(&self, signal: ControlSignal) -> bool {
        signal == ControlSignal::ReloadConfig && self.pending_reload.swap(true, Ordering::SeqCst)
    }

    fn unmark(&self, signal: ControlSignal) {
        if signal == ControlSignal::ReloadConfig {
            self.pending_reload.store(false, Ordering::SeqCst);
        }
    }
}

/// Consumer side of the dispatcher queue.
#[derive(Debug)]
pub struct SignalReceiver {
    rx: mpsc::Receiver<ControlSignal>,
    pending_reload: Arc<AtomicBool>,
}

impl SignalReceiver {
    /// Next signal, or `None` once every sender is gone.
    pub async fn recv(&mut self) -> Option<ControlSignal> {
        let signal = self.rx.recv().await?;
        if signal == ControlSignal::ReloadConfig {
            // A reload requested from here on runs after this one.
            self.pending_reload.store(false, Ordering::SeqCst);
        }
        Some(signal)
    }
}

/// Create the dispatcher queue.
pub fn channel() -> (SignalSender, SignalReceiver) {
    let (tx, rx) = mpsc::channel(SIGNAL_QUEUE_CAPACITY);
    let pending_reload = Arc::new(AtomicBool::new(false));
    (
        SignalSender {
            tx,
            pending_reload: Arc::clone(&pending_reload),
        },
        SignalReceiver { rx, pending_reload },
    )
}

/// Register every control signal and forward deliveries into the queue.
pub fn forward_os_signals(sender: SignalSender) -> io::Result<JoinHandle<()>> {
    let mut streams = Vec::with_capacity(ControlSignal::ALL.len());
    for control in ControlSignal::ALL {
        streams.push((control, signal(control.kind())?));
    }

    Ok(tokio::spawn(async move {
        let (tx, mut rx) = mpsc::unbounded_channel();
        for (control, mut stream) in streams {
            let tx = tx.clone();
            tokio::spawn(async move {
                while stream.recv().await.is_some() {
                    if tx.send(control).is_err() {
                        break;
                    }
                }
            });
        }
        drop(tx);

        while let Some(control) = rx.recv().await {
            tracing::debug!(signal = control.name(), "OS signal received");
            if sender.send(control).await == Delivery::Dropped {
                break;
            }
        }
    }))
}

/// What the dispatcher did with a signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatched {
    Terminated,
    Shutdown(shutdown::ShutdownOutcome),
    Reloaded(reload::ReloadOutcome),
    LogsReopened,
    Upgrade(handoff::UpgradeOutcome),
}

/// The single consumer of the signal queue.
pub struct SignalDispatcher {
    ctx: Arc<ProcessContext>,
    rx: SignalReceiver,
}

impl SignalDispatcher {
    pub fn new(ctx: Arc<ProcessContext>, rx: SignalReceiver) -> Self {
        Self { ctx, rx }
    }

    /// Handle signals until every sender is dropped.
    pub async fn run(mut self) {
        tracing::debug!("Signal dispatcher started");
        while let Some(signal) = self.rx.recv().await {
            dispatch(&self.ctx, signal);
        }
        tracing::debug!("Signal dispatcher stopped");
    }
}

/// Route one signal to its handler.
pub fn dispatch(ctx: &Arc<ProcessContext>, signal: ControlSignal) -> Dispatched {
    metrics::record_signal(signal.name());

    match signal.request() {
        Some(ShutdownRequest::Terminate) => {
            tracing::info!(signal = signal.name(), "Terminating immediately");
            shutdown::terminate(ctx);
            Dispatched::Terminated
        }
        Some(ShutdownRequest::Quit) => {
            tracing::info!("SIGQUIT received: stopping gracefully");
            Dispatched::Shutdown(shutdown::graceful(ctx))
        }
        Some(ShutdownRequest::ForceReload | ShutdownRequest::ListenerRestart) => {
            tracing::info!("SIGHUP received: reloading configuration");
            Dispatched::Reloaded(reload::reload(ctx))
        }
        Some(ShutdownRequest::Upgrade) => {
            tracing::info!("SIGUSR2 received: seamless binary upgrade");
            Dispatched::Upgrade(handoff::upgrade(ctx))
        }
        None => {
            tracing::info!("SIGUSR1 received: reopening logs");
            if let Err(e) = ctx.logs.reopen() {
                tracing::error!(error = %e, "Failed to reopen log file");
            }
            Dispatched::LogsReopened
        }
    }
}
