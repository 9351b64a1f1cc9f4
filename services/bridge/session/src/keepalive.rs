//! Heartbeat scheduling and RTT measurement.
//!
//! The router sends a `0xD3` heartbeat every interval and expects `0xD8`
//! back within the heartbeat timeout. Only one heartbeat is outstanding at a
//! time; an expired one ends the router and triggers a reconnect.

use std::time::Duration;
use tokio::time::Instant;

/// Heartbeat bookkeeping for one live link
#[derive(Debug, Clone)]
pub struct HeartbeatState {
    interval: Duration,
    timeout: Duration,
    last_sent: Instant,
    awaiting_since: Option<Instant>,
    last_rtt: Option<Duration>,
}

impl HeartbeatState {
    /// Start the schedule; the first heartbeat is due one interval from now
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self {
            interval,
            timeout,
            last_sent: Instant::now(),
            awaiting_since: None,
            last_rtt: None,
        }
    }

    /// Whether a heartbeat should go out now
    pub fn due(&self) -> bool {
        self.awaiting_since.is_none() && self.last_sent.elapsed() >= self.interval
    }

    /// Mark a heartbeat as written
    pub fn record_sent(&mut self) {
        let now = Instant::now();
        self.last_sent = now;
        self.awaiting_since = Some(now);
    }

    /// Clear the outstanding heartbeat; returns its RTT if one was outstanding
    pub fn acked(&mut self) -> Option<Duration> {
        let sent = self.awaiting_since.take()?;
        let rtt = sent.elapsed();
        self.last_rtt = Some(rtt);
        Some(rtt)
    }

    /// Whether the outstanding heartbeat has gone unanswered too long
    pub fn expired(&self) -> bool {
        self.awaiting_since
            .map(|sent| sent.elapsed() > self.timeout)
            .unwrap_or(false)
    }

    /// Whether a heartbeat is waiting for its ACK
    pub fn awaiting_ack(&self) -> bool {
        self.awaiting_since.is_some()
    }

    /// Most recent round trip
    pub fn last_rtt(&self) -> Option<Duration> {
        self.last_rtt
    }
}
