//! Outstanding requests waiting for an acknowledgment frame.
//!
//! ACK frames carry no correlation field, so completion is FIFO per expected
//! type: an inbound ACK resolves the oldest entry waiting for that type.

use bridge_wire::{Frame, PacketType};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::error::ConnectionError;

/// A request waiting for its ACK
#[derive(Debug)]
pub struct PendingMessage {
    /// Locally unique id
    pub msg_id: u64,
    /// Correlation id of the request, for logs
    pub correlation_id: String,
    /// ACK type that completes this entry
    pub expected: PacketType,
    /// Registration time
    pub sent_at: Instant,
    /// Retry counter carried by the caller
    pub retry_count: u32,
    ack_tx: oneshot::Sender<Frame>,
}

/// Receiving side of a registration
#[derive(Debug)]
pub struct PendingTicket {
    /// Id of the registered entry
    pub msg_id: u64,
    /// ACK type being waited for
    pub expected: PacketType,
    rx: oneshot::Receiver<Frame>,
}

/// FIFO queue of outstanding requests
#[derive(Debug, Default)]
pub struct PendingQueue {
    entries: Mutex<VecDeque<PendingMessage>>,
    next_id: AtomicU64,
}

impl PendingQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, VecDeque<PendingMessage>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a request before its bytes go on the wire
    pub fn register(
        &self,
        expected: PacketType,
        correlation_id: impl Into<String>,
        retry_count: u32,
    ) -> PendingTicket {
        let msg_id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (ack_tx, rx) = oneshot::channel();
        let message = PendingMessage {
            msg_id,
            correlation_id: correlation_id.into(),
            expected,
            sent_at: Instant::now(),
            retry_count,
            ack_tx,
        };
        trace!(msg_id, ?expected, correlation_id = %message.correlation_id, "pending registered");
        self.entries().push_back(message);
        PendingTicket { msg_id, expected, rx }
    }

    /// Resolve the oldest entry expecting `frame`'s type.
    ///
    /// Returns false when nothing was waiting for it.
    pub fn complete(&self, frame: &Frame) -> bool {
        let message = {
            let mut entries = self.entries();
            let Some(pos) = entries.iter().position(|m| m.expected == frame.packet_type) else {
                return false;
            };
            entries.remove(pos)
        };

        match message {
            Some(message) => {
                debug!(
                    msg_id = message.msg_id,
                    correlation_id = %message.correlation_id,
                    waited_ms = message.sent_at.elapsed().as_millis() as u64,
                    "ack matched"
                );
                // A dropped receiver means the waiter already gave up.
                let _ = message.ack_tx.send(frame.clone());
                true
            }
            None => false,
        }
    }

    /// Drop one entry, e.g. after its send failed
    pub fn remove(&self, msg_id: u64) -> bool {
        let mut entries = self.entries();
        match entries.iter().position(|m| m.msg_id == msg_id) {
            Some(pos) => {
                entries.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Drop every entry; their waiters observe [`ConnectionError::Closed`]
    pub fn clear(&self) -> usize {
        let drained: Vec<_> = self.entries().drain(..).collect();
        if !drained.is_empty() {
            debug!(count = drained.len(), "cleared pending acks");
        }
        drained.len()
    }

    /// Number of outstanding entries
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    /// Whether nothing is outstanding
    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    /// Wait for `ticket`'s ACK for at most `timeout`.
    ///
    /// The entry is removed when the wait ends without an ACK, including when
    /// the returned future is dropped.
    pub async fn wait(
        &self,
        ticket: PendingTicket,
        timeout: Duration,
    ) -> Result<Frame, ConnectionError> {
        let cleanup = RemoveOnDrop {
            queue: self,
            msg_id: ticket.msg_id,
        };
        let result = match tokio::time::timeout(timeout, ticket.rx).await {
            Ok(Ok(frame)) => Ok(frame),
            Ok(Err(_)) => Err(ConnectionError::Closed),
            Err(_) => Err(ConnectionError::Timeout("acknowledgment")),
        };
        drop(cleanup);
        result
    }
}

struct RemoveOnDrop<'a> {
    queue: &'a PendingQueue,
    msg_id: u64,
}

impl Drop for RemoveOnDrop<'_> {
    fn drop(&mut self) {
        self.queue.remove(self.msg_id);
    }
}
