//! Process-wide state shared by the lifecycle handlers.
//!
//! Everything a handler touches is reachable from [`ProcessContext`], built
//! once by the controller after the subsystems have started and dropped when
//! the controller returns.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tokio::sync::watch;
use uuid::Uuid;

use crate::config::SharedConfig;
use crate::lifecycle::handoff::LaunchSpec;
use crate::lifecycle::identity::ProcessIdentity;
use crate::lifecycle::{BackgroundMonitor, ControlChannel, RequestServer};
use crate::observability::{metrics, LogSink};

/// Lifecycle state of a daemon generation. Transitions only move forward.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GenerationState {
    Starting = 0,
    Running = 1,
    Draining = 2,
    Terminated = 3,
}

impl From<u8> for GenerationState {
    fn from(val: u8) -> Self {
        match val {
            0 => GenerationState::Starting,
            1 => GenerationState::Running,
            2 => GenerationState::Draining,
            _ => GenerationState::Terminated,
        }
    }
}

/// One process instance of the daemon.
#[derive(Debug)]
pub struct Generation {
    pub id: Uuid,
    pub pid: u32,
    /// Previous generation, when this one was started by an upgrade.
    pub parent_pid: Option<u32>,
    /// Start time (seconds since epoch).
    pub started_at: u64,
    state: AtomicU8,
}

impl Generation {
    /// Describe the running process.
    pub fn current(parent_pid: Option<u32>) -> Self {
        Self {
            id: Uuid::new_v4(),
            pid: std::process::id(),
            parent_pid,
            started_at: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
            state: AtomicU8::new(GenerationState::Starting as u8),
        }
    }

    pub fn state(&self) -> GenerationState {
        GenerationState::from(self.state.load(Ordering::SeqCst))
    }

    /// Move to `next` if it is later than the current state.
    ///
    /// Returns false (and changes nothing) for a backwards or repeated move.
    pub fn advance(&self, next: GenerationState) -> bool {
        let moved = self
            .state
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                (next as u8 > current).then_some(next as u8)
            })
            .is_ok();
        if moved {
            metrics::record_generation_state(next as u8);
            tracing::info!(generation = %self.id, pid = self.pid, state = ?next, "Generation state changed");
        }
        moved
    }
}

/// Subsystem handles and process state passed to every lifecycle handler.
pub struct ProcessContext {
    pub generation: Arc<Generation>,
    pub config: Arc<SharedConfig>,
    pub identity: Arc<ProcessIdentity>,
    pub server: Arc<dyn RequestServer>,
    pub monitor: Arc<dyn BackgroundMonitor>,
    pub control: Arc<dyn ControlChannel>,
    pub logs: LogSink,
    pub launch: LaunchSpec,
    exit_tx: watch::Sender<Option<i32>>,
    /// Code reported when serving ends through the graceful path.
    exit_code: AtomicI32,
    upgrading: AtomicBool,
}

impl ProcessContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        generation: Arc<Generation>,
        config: Arc<SharedConfig>,
        identity: Arc<ProcessIdentity>,
        server: Arc<dyn RequestServer>,
        monitor: Arc<dyn BackgroundMonitor>,
        control: Arc<dyn ControlChannel>,
        logs: LogSink,
        launch: LaunchSpec,
    ) -> Self {
        Self {
            generation,
            config,
            identity,
            server,
            monitor,
            control,
            logs,
            launch,
            exit_tx: watch::Sender::new(None),
            exit_code: AtomicI32::new(0),
            upgrading: AtomicBool::new(false),
        }
    }

    /// Ask the controller to end the process now with `code`, skipping drain.
    ///
    /// The first request wins.
    pub fn request_exit(&self, code: i32) {
        self.exit_tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(code);
            true
        });
    }

    /// Exit code requested so far, if any.
    pub fn exit_requested(&self) -> Option<i32> {
        *self.exit_tx.borrow()
    }

    /// Resolve once an immediate exit has been requested.
    pub async fn exit_signal(&self) -> i32 {
        let mut rx = self.exit_tx.subscribe();
        let code = match rx.wait_for(Option::is_some).await {
            Ok(code) => (*code).unwrap_or(0),
            // Unreachable while self holds the sender.
            Err(_) => 0,
        };
        code
    }

    /// Report `code` once the graceful stop completes.
    pub fn set_exit_code(&self, code: i32) {
        self.exit_code.store(code, Ordering::SeqCst);
    }

    pub fn exit_code(&self) -> i32 {
        self.exit_code.load(Ordering::SeqCst)
    }

    /// Mark an upgrade as launched. False if one already is.
    pub fn begin_upgrade(&self) -> bool {
        self.upgrading
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Allow another upgrade after the launched one was abandoned.
    pub fn end_upgrade(&self) {
        self.upgrading.store(false, Ordering::SeqCst);
    }

    pub fn upgrade_in_flight(&self) -> bool {
        self.upgrading.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generation_never_moves_backwards() {
        let generation = Generation::current(None);
        assert_eq!(generation.state(), GenerationState::Starting);

        assert!(generation.advance(GenerationState::Running));
        assert!(generation.advance(GenerationState::Draining));
        assert!(!generation.advance(GenerationState::Running));
        assert!(!generation.advance(GenerationState::Draining));
        assert_eq!(generation.state(), GenerationState::Draining);

        assert!(generation.advance(GenerationState::Terminated));
    }

    #[tokio::test]
    async fn first_exit_request_wins() {
        let harness = crate::lifecycle::testing::Harness::new();
        let ctx = harness.ctx.clone();
        let waiter = tokio::spawn(async move { ctx.exit_signal().await });

        harness.ctx.request_exit(3);
        harness.ctx.request_exit(0);
        assert_eq!(waiter.await.unwrap(), 3);
        assert_eq!(harness.ctx.exit_requested(), Some(3));
    }

    #[test]
    fn one_upgrade_at_a_time() {
        let harness = crate::lifecycle::testing::Harness::new();
        assert!(harness.ctx.begin_upgrade());
        assert!(!harness.ctx.begin_upgrade());
        assert!(harness.ctx.upgrade_in_flight());

        harness.ctx.end_upgrade();
        assert!(harness.ctx.begin_upgrade());
    }

    #[test]
    fn generation_can_skip_states() {
        let generation = Generation::current(Some(42));
        assert!(generation.advance(GenerationState::Terminated));
        assert_eq!(generation.parent_pid, Some(42));
    }
}
