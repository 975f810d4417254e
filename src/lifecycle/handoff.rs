//! Seamless binary upgrade.
//!
//! # Protocol
//! ```text
//! old generation                          new generation
//! ──────────────                          ──────────────
//! close control channel
//! stop accepting, dup listener,
//! spawn same executable
//!   fd 3 = listener
//!   REDIRECTD_LISTEN_FD=3
//!   REDIRECTD_LISTEN_ADDR=<addr>
//!   REDIRECTD_PARENT_PID=<old pid>   ──▶  recover listener from fd 3
//! finish in-flight requests               start serving on it
//!                                         take identity record
//!                          ◀── SIGQUIT ── signal readiness to old pid
//! graceful drain, exit
//! ```
//!
//! The socket stays open the whole time, so the kernel keeps queueing
//! connections while neither side accepts. Only one upgrade runs at a time.
//! If the spawn fails, or the new generation exits before it signals, the old
//! generation resumes accepting, reopens its control channel and carries on.

use std::env;
use std::ffi::OsString;
use std::io;
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Child, Command};
use std::sync::Arc;

use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use nix::sys::signal::{kill, Signal};
use nix::unistd::{dup2, Pid};
use thiserror::Error;

use crate::lifecycle::context::{GenerationState, ProcessContext};
use crate::net::listener::{BoundListener, ListenerError};
use crate::observability::metrics;

/// Descriptor number the listener occupies in the new generation.
pub const LISTEN_FD_SLOT: RawFd = 3;

pub const ENV_LISTEN_FD: &str = "REDIRECTD_LISTEN_FD";
pub const ENV_LISTEN_ADDR: &str = "REDIRECTD_LISTEN_ADDR";
pub const ENV_PARENT_PID: &str = "REDIRECTD_PARENT_PID";

#[derive(Debug, Error)]
pub enum HandoffError {
    #[error("Failed to duplicate listener: {0}")]
    Duplicate(#[source] io::Error),

    #[error("Failed to launch {}: {source}", .executable.display())]
    Spawn {
        executable: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Invalid inherited listener: {0}")]
    InvalidToken(String),

    #[error(transparent)]
    Adopt(#[from] ListenerError),

    #[error("Failed to signal process {pid}: {source}")]
    Signal {
        pid: u32,
        #[source]
        source: nix::Error,
    },
}

/// A listening socket on its way to the next generation.
///
/// Owns a duplicate of the descriptor; the serving copy is untouched.
#[derive(Debug)]
pub struct HandoffToken {
    fd: OwnedFd,
    addr: SocketAddr,
}

impl HandoffToken {
    pub fn from_listener(listener: &BoundListener) -> Result<Self, HandoffError> {
        Ok(Self {
            fd: listener.duplicate_fd().map_err(HandoffError::Duplicate)?,
            addr: listener.local_addr(),
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Environment the new generation reads the token back from.
    pub fn env(&self, parent_pid: u32) -> [(&'static str, String); 3] {
        [
            (ENV_LISTEN_FD, LISTEN_FD_SLOT.to_string()),
            (ENV_LISTEN_ADDR, self.addr.to_string()),
            (ENV_PARENT_PID, parent_pid.to_string()),
        ]
    }
}

/// How to start the next generation.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub executable: PathBuf,
    pub args: Vec<OsString>,
}

impl LaunchSpec {
    /// Re-run this executable with this process's arguments.
    pub fn current() -> io::Result<Self> {
        Ok(Self {
            executable: env::current_exe()?,
            args: env::args_os().skip(1).collect(),
        })
    }
}

/// A listener handed over by the previous generation.
#[derive(Debug)]
pub struct InheritedListener {
    pub listener: BoundListener,
    pub parent_pid: Option<u32>,
}

/// Spawn the next generation with the token's socket at [`LISTEN_FD_SLOT`].
pub fn relaunch_with_listener(token: HandoffToken, launch: &LaunchSpec) -> Result<Child, HandoffError> {
    let raw = token.fd.as_raw_fd();

    let mut cmd = Command::new(&launch.executable);
    cmd.args(&launch.args).envs(token.env(std::process::id()));

    // SAFETY: the closure runs in the forked child before exec and only calls
    // dup2/fcntl, which are async-signal-safe. `raw` stays open in the parent
    // until spawn returns because `token` is still alive.
    unsafe {
        cmd.pre_exec(move || place_at_slot(raw));
    }

    let child = cmd.spawn().map_err(|source| HandoffError::Spawn {
        executable: launch.executable.clone(),
        source,
    })?;

    drop(token);
    Ok(child)
}

/// Put `raw` at the slot without close-on-exec.
fn place_at_slot(raw: RawFd) -> io::Result<()> {
    if raw == LISTEN_FD_SLOT {
        // dup2 onto itself is a no-op that keeps FD_CLOEXEC set.
        fcntl(raw, FcntlArg::F_SETFD(FdFlag::empty()))?;
    } else {
        dup2(raw, LISTEN_FD_SLOT)?;
    }
    Ok(())
}

/// Adopt the listener passed by the previous generation, if any.
pub fn recover_inherited_listener() -> Result<Option<InheritedListener>, HandoffError> {
    recover_from(|key| env::var(key).ok())
}

/// Adopt an inherited listener described by `lookup`.
pub fn recover_from(lookup: impl Fn(&str) -> Option<String>) -> Result<Option<InheritedListener>, HandoffError> {
    let Some(raw) = lookup(ENV_LISTEN_FD) else {
        return Ok(None);
    };
    let fd: RawFd = raw
        .parse()
        .map_err(|_| HandoffError::InvalidToken(format!("{}={} is not a descriptor", ENV_LISTEN_FD, raw)))?;
    if fd < 0 {
        return Err(HandoffError::InvalidToken(format!("{}={} is negative", ENV_LISTEN_FD, raw)));
    }

    fcntl(fd, FcntlArg::F_GETFD)
        .map_err(|e| HandoffError::InvalidToken(format!("descriptor {} is not open: {}", fd, e)))?;
    // Keep it from leaking into processes this generation spawns; an upgrade
    // passes it on explicitly.
    fcntl(fd, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))
        .map_err(|e| HandoffError::InvalidToken(format!("descriptor {}: {}", fd, e)))?;

    // SAFETY: the descriptor is open and was placed here by the previous
    // generation for this process to own; nothing else in this process
    // refers to it.
    let std_listener = unsafe { StdTcpListener::from_raw_fd(fd) };
    let listener = BoundListener::adopt(std_listener)?;

    if let Some(expected) = lookup(ENV_LISTEN_ADDR) {
        if expected != listener.local_addr().to_string() {
            tracing::warn!(
                expected = %expected,
                actual = %listener.local_addr(),
                "Inherited listener address differs from the advertised one"
            );
        }
    }

    let parent_pid = lookup(ENV_PARENT_PID).and_then(|p| p.parse().ok());
    tracing::info!(
        address = %listener.local_addr(),
        fd,
        parent_pid = ?parent_pid,
        "Recovered inherited listener"
    );
    Ok(Some(InheritedListener { listener, parent_pid }))
}

/// Tell the previous generation that this one is serving.
pub fn terminate_parent(pid: u32) -> Result<(), HandoffError> {
    let target = i32::try_from(pid)
        .ok()
        .filter(|p| *p > 0)
        .ok_or_else(|| HandoffError::InvalidToken(format!("invalid parent pid {}", pid)))?;
    kill(Pid::from_raw(target), Signal::SIGQUIT).map_err(|source| HandoffError::Signal { pid, source })?;
    tracing::info!(parent_pid = pid, "Signalled previous generation to stop");
    Ok(())
}

/// What an upgrade request did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpgradeOutcome {
    /// The next generation is running with this pid.
    Launched(u32),
    /// An earlier upgrade is still waiting for its generation to take over.
    InProgress,
    /// Nothing was launched; this generation keeps serving.
    Aborted(String),
}

/// Hand the listener to a freshly launched generation.
pub fn upgrade(ctx: &Arc<ProcessContext>) -> UpgradeOutcome {
    if !ctx.begin_upgrade() {
        tracing::warn!("Upgrade already in progress, ignoring request");
        metrics::record_upgrade("ignored");
        return UpgradeOutcome::InProgress;
    }

    if let Err(e) = ctx.control.close() {
        tracing::warn!(error = %e, "Failed to close control channel before upgrade");
    }

    let token = match ctx.server.handoff_token() {
        Ok(Some(token)) => token,
        Ok(None) => return abort(ctx, "no active listener to hand over".to_string()),
        Err(e) => return abort(ctx, e.to_string()),
    };
    let address = token.addr();

    ctx.server.set_accepting(false);
    match relaunch_with_listener(token, &ctx.launch) {
        Ok(child) => {
            let child_pid = child.id();
            tracing::info!(child_pid, address = %address, "New generation launched");
            metrics::record_upgrade("launched");
            reap(ctx.clone(), child);
            UpgradeOutcome::Launched(child_pid)
        }
        Err(e) => {
            ctx.server.set_accepting(true);
            abort(ctx, e.to_string())
        }
    }
}

fn abort(ctx: &ProcessContext, reason: String) -> UpgradeOutcome {
    tracing::error!(reason = %reason, "Relaunch failed; this generation keeps serving");
    metrics::record_upgrade("failed");
    if let Err(e) = ctx.control.reopen() {
        tracing::error!(error = %e, "Failed to reopen control channel");
    }
    ctx.end_upgrade();
    UpgradeOutcome::Aborted(reason)
}

/// Wait for the child off the runtime and take back over if it exits
/// before stopping this generation.
fn reap(ctx: Arc<ProcessContext>, mut child: Child) {
    let pid = child.id();
    let waiter = move || {
        match child.wait() {
            Ok(status) if status.success() => tracing::debug!(child_pid = pid, "New generation exited"),
            Ok(status) => tracing::error!(child_pid = pid, status = %status, "New generation exited abnormally"),
            Err(e) => tracing::warn!(child_pid = pid, error = %e, "Failed to wait for new generation"),
        }
        if ctx.generation.state() < GenerationState::Draining {
            resume_after_failed_handoff(&ctx, pid);
        }
    };
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn_blocking(waiter);
        }
        Err(_) => {
            std::thread::spawn(waiter);
        }
    }
}

fn resume_after_failed_handoff(ctx: &ProcessContext, child_pid: u32) {
    tracing::warn!(child_pid, "New generation exited before taking over; resuming service");
    metrics::record_upgrade("abandoned");
    ctx.server.set_accepting(true);
    if let Err(e) = ctx.control.reopen() {
        tracing::error!(error = %e, "Failed to reopen control channel");
    }
    ctx.end_upgrade();
}
