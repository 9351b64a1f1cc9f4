//! Retry and timeout configuration.

use rand::Rng;
use std::time::Duration;

/// Exponential backoff policy for handshakes and reconnects
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    /// Attempts before giving up
    pub max_attempts: u32,
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Upper bound on any single delay
    pub max_delay: Duration,
    /// Growth factor per retry
    pub multiplier: f64,
    /// Random spread as a fraction of the delay (0.1 = ±10%)
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    /// Delay to wait before retry number `retry` (0-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exp = self.multiplier.powi(retry.min(i32::MAX as u32) as i32);
        let raw = self.base_delay.as_secs_f64() * exp;
        let capped = raw.min(self.max_delay.as_secs_f64());

        let spread = if self.jitter > 0.0 {
            1.0 + rand::thread_rng().gen_range(-self.jitter..=self.jitter)
        } else {
            1.0
        };

        Duration::from_secs_f64((capped * spread).max(0.0))
    }
}

/// Bounded waits used across the connection stack
#[derive(Clone, Debug, PartialEq)]
pub struct TimeoutConfig {
    /// Wait for HELLO_ACK after sending the handshake
    pub handshake: Duration,
    /// Bounded socket read inside the packet router
    pub read: Duration,
    /// Bound on a single socket write
    pub write: Duration,
    /// Interval between outgoing heartbeats
    pub heartbeat_interval: Duration,
    /// Time an unanswered heartbeat may stay outstanding
    pub heartbeat_timeout: Duration,
    /// Default wait for a data ACK
    pub ack: Duration,
    /// Send timeout for the mesh query
    pub mesh_send: Duration,
    /// Collection window for status broadcasts after a mesh query
    pub mesh_collection: Duration,
    /// State-lock hold time that is logged as slow
    pub lock_hold_warn: Duration,
    /// State-lock hold time that signals a deadlock risk
    pub lock_hold_critical: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            handshake: Duration::from_secs(10),
            read: Duration::from_secs(1),
            write: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(10),
            ack: Duration::from_secs(5),
            mesh_send: Duration::from_secs(2),
            mesh_collection: Duration::from_secs(10),
            lock_hold_warn: Duration::from_millis(1),
            lock_hold_critical: Duration::from_millis(100),
        }
    }
}

/// Configuration for one [`ConnectionManager`](crate::ConnectionManager)
#[derive(Clone, Debug, Default)]
pub struct ConnectionConfig {
    /// Handshake and reconnect backoff
    pub retry: RetryPolicy,
    /// Bounded waits
    pub timeouts: TimeoutConfig,
    /// Capacity of the data-frame queue (0 selects the default)
    pub data_queue_capacity: usize,
}

/// Data-frame queue capacity used when none is configured
pub const DEFAULT_DATA_QUEUE_CAPACITY: usize = 256;

impl ConnectionConfig {
    pub(crate) fn queue_capacity(&self) -> usize {
        if self.data_queue_capacity == 0 {
            DEFAULT_DATA_QUEUE_CAPACITY
        } else {
            self.data_queue_capacity
        }
    }
}
