//! Mirror health state machine.
//!
//! # States
//! - Unknown: never probed, receives traffic
//! - Healthy: mirror receives traffic
//! - Unhealthy: mirror excluded from redirects
//!
//! # State Transitions
//! ```text
//! Healthy/Unknown → Unhealthy: consecutive failures >= unhealthy_threshold
//! Unhealthy/Unknown → Healthy: consecutive successes >= healthy_threshold
//! ```
//!
//! # Design Decisions
//! - Hysteresis prevents flapping
//! - Transitions are returned to the caller so it can log them
//! - Counters reset on the opposite outcome

use serde::{Deserialize, Serialize};

/// Health state of a single mirror.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    #[default]
    Unknown,
    Healthy,
    Unhealthy,
}

/// Probe counters and the resulting state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthRecord {
    pub state: HealthState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
}

impl HealthRecord {
    /// Return true if the mirror may receive traffic (Healthy or Unknown).
    pub fn is_healthy(&self) -> bool {
        self.state != HealthState::Unhealthy
    }

    /// Report a successful probe. Returns the new state on a transition.
    pub fn mark_success(&mut self, healthy_threshold: u32) -> Option<HealthState> {
        self.consecutive_failures = 0;
        if self.state == HealthState::Healthy {
            return None;
        }

        self.consecutive_successes = self.consecutive_successes.saturating_add(1);
        if self.consecutive_successes >= healthy_threshold {
            self.state = HealthState::Healthy;
            self.consecutive_successes = 0;
            return Some(HealthState::Healthy);
        }
        None
    }

    /// Report a failed probe. Returns the new state on a transition.
    pub fn mark_failure(&mut self, unhealthy_threshold: u32) -> Option<HealthState> {
        self.consecutive_successes = 0;
        if self.state == HealthState::Unhealthy {
            return None;
        }

        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        if self.consecutive_failures >= unhealthy_threshold {
            self.state = HealthState::Unhealthy;
            self.consecutive_failures = 0;
            return Some(HealthState::Unhealthy);
        }
        None
    }
}
