//! Per-connection bookkeeping for the accept loop.
//!
//! # Responsibilities
//! - Number connections for log correlation
//! - Admit connections up to the configured limit
//! - Publish the in-flight count, which the drain and the status route read

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::observability::metrics;

static NEXT_CONNECTION: AtomicU64 = AtomicU64::new(1);

/// Process-unique connection number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        Self(NEXT_CONNECTION.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Counts connections currently being served.
#[derive(Debug, Clone, Default)]
pub struct ConnectionTracker {
    in_flight: Arc<AtomicU64>,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit a connection unless `limit` connections are already in flight.
    pub fn admit(&self, limit: u64) -> Option<ConnectionGuard> {
        let admitted = self
            .in_flight
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| (n < limit).then_some(n + 1))
            .ok()?;
        metrics::record_active_connections(admitted + 1);
        Some(ConnectionGuard {
            in_flight: Arc::clone(&self.in_flight),
            id: ConnectionId::next(),
        })
    }

    pub fn in_flight(&self) -> u64 {
        self.in_flight.load(Ordering::SeqCst)
    }
}

/// Held by a connection task. Releases its slot on drop, also when the task
/// is aborted at the drain deadline.
#[derive(Debug)]
pub struct ConnectionGuard {
    in_flight: Arc<AtomicU64>,
    id: ConnectionId,
}

impl ConnectionGuard {
    pub fn id(&self) -> ConnectionId {
        self.id
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        let remaining = self.in_flight.fetch_sub(1, Ordering::SeqCst) - 1;
        metrics::record_active_connections(remaining);
        tracing::trace!(connection_id = %self.id, "Connection closed");
    }
}
