//! Configuration reload.
//!
//! Runs on the dispatcher task, so only one reload executes at a time and a
//! reload never interleaves with a shutdown or upgrade. Pending reloads are
//! coalesced by the signal queue.

use std::time::Duration;

use crate::lifecycle::context::ProcessContext;
use crate::lifecycle::signals::ShutdownRequest;
use crate::observability::metrics;

/// How long the old listener may drain when the bind address changes.
pub const RESTART_DEADLINE: Duration = Duration::from_secs(1);

/// What a reload did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReloadOutcome {
    /// The file could not be read or validated; nothing changed.
    Rejected(String),
    /// The file matches the active configuration.
    Unchanged,
    /// New settings are active. Carries `ForceReload` for a live swap or
    /// `ListenerRestart` when the listener is being rebound.
    Applied(ShutdownRequest),
}

/// Reload configuration and apply it.
pub fn reload(ctx: &ProcessContext) -> ReloadOutcome {
    let (previous, next) = match ctx.config.reload() {
        Ok(pair) => pair,
        Err(e) => {
            tracing::warn!(error = %e, "Configuration reload failed; keeping current configuration");
            metrics::record_reload("rejected");
            return ReloadOutcome::Rejected(e.to_string());
        }
    };

    if previous == next {
        tracing::info!("Configuration unchanged");
        metrics::record_reload("unchanged");
        return ReloadOutcome::Unchanged;
    }

    ctx.server.reload();

    if previous.listener.bind_address == next.listener.bind_address {
        tracing::info!("Configuration reloaded");
        metrics::record_reload("applied");
        return ReloadOutcome::Applied(ShutdownRequest::ForceReload);
    }

    // The socket is being handed over; the successor owns it from here.
    if ctx.upgrade_in_flight() {
        tracing::warn!(
            to = %next.listener.bind_address,
            "Bind address changed during an upgrade; keeping the current listener"
        );
        metrics::record_reload("applied");
        return ReloadOutcome::Applied(ShutdownRequest::ForceReload);
    }

    tracing::info!(
        from = %previous.listener.bind_address,
        to = %next.listener.bind_address,
        "Bind address changed; restarting listener"
    );
    metrics::record_reload("listener_restart");
    ctx.server.set_restarting(true);
    ctx.server.stop(RESTART_DEADLINE);
    ReloadOutcome::Applied(ShutdownRequest::ListenerRestart)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::testing::Harness;

    #[test]
    fn same_address_swaps_live() {
        let harness = Harness::new();
        harness.write_config("127.0.0.1:18080", 60);

        assert_eq!(reload(&harness.ctx), ReloadOutcome::Applied(ShutdownRequest::ForceReload));
        assert_eq!(harness.calls(), vec!["server.reload"]);
        assert_eq!(harness.ctx.config.current().timeouts.request_secs, 60);
    }

    #[test]
    fn changed_address_restarts_listener() {
        let harness = Harness::new();
        harness.write_config("127.0.0.1:18081", 30);

        assert_eq!(reload(&harness.ctx), ReloadOutcome::Applied(ShutdownRequest::ListenerRestart));
        assert_eq!(
            harness.calls(),
            vec!["server.reload", "server.set_restarting(true)", "server.stop(1s)"]
        );
    }

    #[test]
    fn pending_upgrade_keeps_the_listener() {
        let harness = Harness::new();
        assert!(harness.ctx.begin_upgrade());
        harness.write_config("127.0.0.1:18081", 30);

        assert_eq!(reload(&harness.ctx), ReloadOutcome::Applied(ShutdownRequest::ForceReload));
        assert_eq!(harness.calls(), vec!["server.reload"]);
    }

    #[test]
    fn broken_file_keeps_previous_state() {
        let harness = Harness::new();
        harness.write_raw("[listener\n");

        assert!(matches!(reload(&harness.ctx), ReloadOutcome::Rejected(_)));
        assert!(harness.calls().is_empty());
        assert_eq!(harness.ctx.config.current().listener.bind_address, "127.0.0.1:18080");
    }

    #[test]
    fn identical_back_to_back_reloads_apply_once() {
        let harness = Harness::new();
        harness.write_config("127.0.0.1:18080", 45);

        assert_eq!(reload(&harness.ctx), ReloadOutcome::Applied(ShutdownRequest::ForceReload));
        assert_eq!(reload(&harness.ctx), ReloadOutcome::Unchanged);
        assert_eq!(harness.calls(), vec!["server.reload"]);
    }
}
