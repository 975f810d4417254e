//! Shutdown coordination.
//!
//! Subsystems are stopped in a fixed order regardless of which signal asked
//! for it: monitor, control channel, then the request server. Each step is
//! best-effort; a failing step is logged and the sequence moves on, so the
//! process can always exit.

use std::time::Duration;

use crate::lifecycle::context::{GenerationState, ProcessContext};

/// How long the request server may spend finishing in-flight work.
pub const DRAIN_DEADLINE: Duration = Duration::from_secs(5);

/// How the graceful sequence ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// No listener was held; the process exits without draining.
    Immediate,
    /// The request server is draining with this deadline.
    Draining(Duration),
}

/// Run the graceful stop sequence.
pub fn graceful(ctx: &ProcessContext) -> ShutdownOutcome {
    ctx.generation.advance(GenerationState::Draining);

    // 1. Monitor: signal only, the controller waits for it later.
    ctx.monitor.stop();

    // 2. Control channel.
    if let Err(e) = ctx.control.close() {
        tracing::warn!(error = %e, "Failed to close control channel; continuing shutdown");
    }

    // 3. Nothing to drain.
    if !ctx.server.has_listener() {
        tracing::info!("No active listener, exiting now");
        release_identity(ctx);
        ctx.request_exit(0);
        return ShutdownOutcome::Immediate;
    }

    // 4. Drain.
    tracing::info!(deadline = ?DRAIN_DEADLINE, "Waiting for running tasks to finish...");
    ctx.server.stop(DRAIN_DEADLINE);
    ShutdownOutcome::Draining(DRAIN_DEADLINE)
}

/// Remove the identity record and exit without draining.
pub fn terminate(ctx: &ProcessContext) {
    ctx.generation.advance(GenerationState::Terminated);
    release_identity(ctx);
    ctx.request_exit(0);
}

fn release_identity(ctx: &ProcessContext) {
    if let Err(e) = ctx.identity.release() {
        tracing::warn!(error = %e, "Failed to remove identity record");
    }
}
