//! Connection state and the instrumented lock that guards it.

use serde::Serialize;
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{error, warn};

use crate::metrics::{MetricsSink, CONNECTION_STATE_LOCK_HOLD_MS, CONNECTION_STATE_TRANSITION};

/// Lifecycle of one bridge connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum ConnectionState {
    /// No socket
    Disconnected = 0,
    /// First handshake in progress
    Connecting = 1,
    /// Handshake done and the packet router running
    Connected = 2,
    /// Recovering after a lost link
    Reconnecting = 3,
}

impl ConnectionState {
    /// Lowercase label used in logs and metrics
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
        }
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Connected,
            3 => ConnectionState::Reconnecting,
            _ => ConnectionState::Disconnected,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Async mutex around the state, with a lock-free mirror for cheap reads.
///
/// The mirror is only ever written while the mutex is held, so it can lag but
/// never invent a state. Decisions must go through [`StateCell::lock`].
#[derive(Debug)]
pub(crate) struct StateCell {
    lock: Mutex<ConnectionState>,
    mirror: AtomicU8,
    conn_id: String,
    warn_after: Duration,
    critical_after: Duration,
    metrics: Arc<dyn MetricsSink>,
}

impl StateCell {
    pub(crate) fn new(
        conn_id: impl Into<String>,
        warn_after: Duration,
        critical_after: Duration,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            lock: Mutex::new(ConnectionState::Disconnected),
            mirror: AtomicU8::new(ConnectionState::Disconnected as u8),
            conn_id: conn_id.into(),
            warn_after,
            critical_after,
            metrics,
        }
    }

    /// Acquire the state lock; hold time is measured until the guard drops
    pub(crate) async fn lock(&self) -> StateGuard<'_> {
        let guard = self.lock.lock().await;
        StateGuard {
            guard,
            cell: self,
            acquired: Instant::now(),
        }
    }

    /// Last state written, without taking the lock
    pub(crate) fn snapshot(&self) -> ConnectionState {
        ConnectionState::from_u8(self.mirror.load(Ordering::Acquire))
    }
}

/// Held state lock
pub(crate) struct StateGuard<'a> {
    guard: MutexGuard<'a, ConnectionState>,
    cell: &'a StateCell,
    acquired: Instant,
}

impl StateGuard<'_> {
    /// Move to `next`, recording the transition when it changes anything
    pub(crate) fn set(&mut self, next: ConnectionState) {
        let prev = *self.guard;
        if prev == next {
            return;
        }
        *self.guard = next;
        self.cell.mirror.store(next as u8, Ordering::Release);
        self.cell.metrics.increment(
            CONNECTION_STATE_TRANSITION,
            &[("from", prev.as_str()), ("to", next.as_str())],
        );
        tracing::debug!(connection = %self.cell.conn_id, from = %prev, to = %next, "state transition");
    }
}

impl Deref for StateGuard<'_> {
    type Target = ConnectionState;

    fn deref(&self) -> &ConnectionState {
        &self.guard
    }
}

impl Drop for StateGuard<'_> {
    fn drop(&mut self) {
        let held = self.acquired.elapsed();
        let held_ms = held.as_secs_f64() * 1000.0;
        self.cell
            .metrics
            .observe(CONNECTION_STATE_LOCK_HOLD_MS, held_ms, &[]);

        if held > self.cell.critical_after {
            error!(
                connection = %self.cell.conn_id,
                held_ms,
                "state lock held past critical threshold; possible deadlock"
            );
        } else if held > self.cell.warn_after {
            warn!(connection = %self.cell.conn_id, held_ms, "slow state lock hold");
        }
    }
}
