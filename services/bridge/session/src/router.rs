//! Packet router: the single reader of a live socket.
//!
//! Each iteration sends a heartbeat when one is due, performs a bounded read,
//! and dispatches every complete frame: ACKs resolve pending waiters, data
//! frames go to the bounded queue, everything else is queued as unknown.
//! When the router stops it asks the manager for a reconnect.

use bridge_wire::{decode_packet, encode_heartbeat, encode_heartbeat_ack, Frame, PacketFramer, PacketType};
use bytes::{Bytes, BytesMut};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::Ordering;
use tokio::io::{AsyncReadExt, ReadHalf};
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::{debug, error, trace, warn};

use crate::error::ConnectionError;
use crate::keepalive::HeartbeatState;
use crate::manager::ConnectionManager;
use crate::metrics::{
    CONNECTION_DATA_QUEUE_DROPPED, CONNECTION_DECODE_ERROR, CONNECTION_HEARTBEAT,
    CONNECTION_HEARTBEAT_RTT_MS,
};
use crate::transport::BoxedStream;

/// Frame handed to the layer above the connection
#[derive(Debug, Clone, PartialEq)]
pub enum RoutedFrame {
    /// Data-channel or status-broadcast frame
    Data(Frame),
    /// Any other non-ACK frame
    Unknown(Frame),
}

impl RoutedFrame {
    /// The wrapped frame
    pub fn frame(&self) -> &Frame {
        match self {
            RoutedFrame::Data(frame) | RoutedFrame::Unknown(frame) => frame,
        }
    }

    /// Unwrap into the frame
    pub fn into_frame(self) -> Frame {
        match self {
            RoutedFrame::Data(frame) | RoutedFrame::Unknown(frame) => frame,
        }
    }
}

enum RouterExit {
    HeartbeatTimeout,
    PeerClosed,
}

pub(crate) fn spawn(
    manager: ConnectionManager,
    reader: ReadHalf<BoxedStream>,
    framer: PacketFramer,
    backlog: Vec<Bytes>,
    epoch: u64,
) -> JoinHandle<Result<(), ConnectionError>> {
    tokio::spawn(run(manager, reader, framer, backlog, epoch))
}

async fn run(
    manager: ConnectionManager,
    reader: ReadHalf<BoxedStream>,
    framer: PacketFramer,
    backlog: Vec<Bytes>,
    epoch: u64,
) -> Result<(), ConnectionError> {
    let conn = manager.id().to_string();
    debug!(connection = %conn, "packet router started");

    let outcome = AssertUnwindSafe(route_packets(&manager, reader, framer, backlog))
        .catch_unwind()
        .await;

    let (reason, failure) = match outcome {
        Ok(Ok(RouterExit::HeartbeatTimeout)) => ("heartbeat_timeout", None),
        Ok(Ok(RouterExit::PeerClosed)) => ("connection_closed", None),
        Ok(Err(e @ (ConnectionError::Io(_) | ConnectionError::Timeout(_) | ConnectionError::Closed))) => {
            ("io_error", Some(e))
        }
        Ok(Err(e)) => ("packet_router_crash", Some(e)),
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            ("packet_router_crash", Some(ConnectionError::RouterCrashed(message)))
        }
    };

    match &failure {
        Some(e) => error!(connection = %conn, reason, error = %e, "packet router stopped"),
        None => warn!(connection = %conn, reason, "packet router stopped"),
    }

    if let Err(e) = manager.spawn_reconnect(reason, epoch) {
        error!(connection = %conn, error = %e, "could not schedule reconnect");
    }

    match failure {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

async fn route_packets(
    manager: &ConnectionManager,
    mut reader: ReadHalf<BoxedStream>,
    mut framer: PacketFramer,
    mut backlog: Vec<Bytes>,
) -> Result<RouterExit, ConnectionError> {
    let shared = &manager.shared;
    let timeouts = &shared.config.timeouts;
    let mut heartbeat = HeartbeatState::new(timeouts.heartbeat_interval, timeouts.heartbeat_timeout);
    let mut buf = BytesMut::with_capacity(4096);

    loop {
        for raw in backlog.drain(..) {
            dispatch(manager, &raw, &mut heartbeat).await?;
        }

        if heartbeat.expired() {
            shared
                .metrics
                .increment(CONNECTION_HEARTBEAT, &[("outcome", "timeout")]);
            return Ok(RouterExit::HeartbeatTimeout);
        }

        if heartbeat.due() {
            manager.write_frame(&encode_heartbeat()).await?;
            heartbeat.record_sent();
            shared
                .metrics
                .increment(CONNECTION_HEARTBEAT, &[("outcome", "sent")]);
            trace!(connection = %shared.id, "heartbeat sent");
        }

        buf.clear();
        match tokio::time::timeout(timeouts.read, reader.read_buf(&mut buf)).await {
            Err(_) => continue,
            Ok(Ok(0)) => return Ok(RouterExit::PeerClosed),
            Ok(Ok(n)) => {
                shared.stats.bytes_in.fetch_add(n as u64, Ordering::Relaxed);
                backlog = framer.feed(&buf);
            }
            Ok(Err(e)) => return Err(e.into()),
        }
    }
}

async fn dispatch(
    manager: &ConnectionManager,
    raw: &[u8],
    heartbeat: &mut HeartbeatState,
) -> Result<(), ConnectionError> {
    let shared = &manager.shared;
    let frame = match decode_packet(raw) {
        Ok(frame) => frame,
        Err(e) => {
            warn!(connection = %shared.id, error = %e, len = raw.len(), "skipping malformed frame");
            shared.stats.decode_errors.fetch_add(1, Ordering::Relaxed);
            shared.metrics.increment(CONNECTION_DECODE_ERROR, &[]);
            return Ok(());
        }
    };
    shared.stats.frames_in.fetch_add(1, Ordering::Relaxed);

    match frame.packet_type {
        PacketType::HeartbeatAck => {
            if let Some(rtt) = heartbeat.acked() {
                shared
                    .stats
                    .last_rtt_us
                    .store((rtt.as_micros() as u64).max(1), Ordering::Relaxed);
                shared
                    .metrics
                    .observe(CONNECTION_HEARTBEAT_RTT_MS, rtt.as_secs_f64() * 1000.0, &[]);
                shared
                    .metrics
                    .increment(CONNECTION_HEARTBEAT, &[("outcome", "acked")]);
            }
            shared.pending.complete(&frame);
        }
        PacketType::Heartbeat => {
            manager.write_frame(&encode_heartbeat_ack()).await?;
            shared
                .metrics
                .increment(CONNECTION_HEARTBEAT, &[("outcome", "peer_ping")]);
        }
        t if t.is_data() => enqueue(manager, RoutedFrame::Data(frame)),
        t if t.is_ack() => {
            if !shared.pending.complete(&frame) {
                debug!(connection = %shared.id, packet_type = ?t, "unsolicited ack");
            }
        }
        _ => enqueue(manager, RoutedFrame::Unknown(frame)),
    }
    Ok(())
}

fn enqueue(manager: &ConnectionManager, routed: RoutedFrame) {
    let shared = &manager.shared;
    match shared.data_tx.try_send(routed) {
        Ok(()) => {}
        Err(TrySendError::Full(dropped)) => {
            warn!(
                connection = %shared.id,
                packet_type = ?dropped.frame().packet_type,
                "data queue full; dropping frame"
            );
            shared.metrics.increment(CONNECTION_DATA_QUEUE_DROPPED, &[]);
        }
        Err(TrySendError::Closed(_)) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConnectionConfig, RetryPolicy};
    use crate::metrics::InMemoryMetrics;
    use crate::test_support::{accept, read_frame, ScriptedConnector};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::io::{AsyncWriteExt, DuplexStream};

    async fn connected(
        queue: usize,
    ) -> (ConnectionManager, DuplexStream, Arc<InMemoryMetrics>) {
        let (connector, mut peers) = ScriptedConnector::new(1);
        let metrics = Arc::new(InMemoryMetrics::new());
        let config = ConnectionConfig {
            retry: RetryPolicy {
                jitter: 0.0,
                ..RetryPolicy::default()
            },
            data_queue_capacity: queue,
            ..ConnectionConfig::default()
        };
        let manager = ConnectionManager::new("router", Arc::new(connector), config, metrics.clone());
        let mut peer = peers.remove(0);
        let peer_task = tokio::spawn(async move {
            accept(&mut peer).await;
            peer
        });
        assert!(manager.connect([1, 2, 3, 4], &b"auth"[..]).await.unwrap());
        (manager, peer_task.await.unwrap(), metrics)
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_frame_is_skipped() {
        let (manager, mut peer, metrics) = connected(16).await;

        // 0x83 with an inner struct whose checksum is wrong, then a valid one
        let bad = [0x83, 0, 0, 0, 12, 1, 2, 3, 4, 0, 1, 0, 0x7E, 0x01, 0x02, 0xFF, 0x7E];
        let good = [0x83, 0, 0, 0, 12, 1, 2, 3, 4, 0, 2, 0, 0x7E, 0x01, 0x02, 0x03, 0x7E];
        peer.write_all(&bad).await.unwrap();
        peer.write_all(&good).await.unwrap();

        let routed = manager.next_frame().await.unwrap();
        assert!(matches!(routed, RoutedFrame::Data(_)));
        assert_eq!(routed.frame().payload[5], 2);
        assert_eq!(manager.stats().decode_errors, 1);
        assert_eq!(metrics.counter(CONNECTION_DECODE_ERROR), 1);
        assert!(manager.is_connected());

        manager.disconnect().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_acks_resolve_pending_in_order() {
        let (manager, mut peer, _metrics) = connected(16).await;
        let pending = manager.pending();

        let first = pending.register(PacketType::DataAck, "one", 0);
        let second = pending.register(PacketType::DataAck, "two", 0);
        peer.write_all(&[0x7B, 0, 0, 0, 1, 0xA1, 0x7B, 0, 0, 0, 1, 0xA2])
            .await
            .unwrap();

        let a = pending.wait(first, Duration::from_secs(5)).await.unwrap();
        let b = pending.wait(second, Duration::from_secs(5)).await.unwrap();
        assert_eq!(a.payload.as_ref(), &[0xA1]);
        assert_eq!(b.payload.as_ref(), &[0xA2]);

        manager.disconnect().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_peer_heartbeat_is_answered() {
        let (manager, mut peer, metrics) = connected(16).await;

        peer.write_all(&[0xD3, 0, 0, 0, 0]).await.unwrap();
        let reply = read_frame(&mut peer).await;
        assert_eq!(reply.packet_type, PacketType::HeartbeatAck);
        assert_eq!(
            metrics.counter_with(CONNECTION_HEARTBEAT, &[("outcome", "peer_ping")]),
            1
        );

        manager.disconnect().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_ack_records_rtt() {
        let (manager, mut peer, metrics) = connected(16).await;

        let heartbeat = read_frame(&mut peer).await;
        assert_eq!(heartbeat.packet_type, PacketType::Heartbeat);
        tokio::time::sleep(Duration::from_millis(20)).await;
        peer.write_all(&[0xD8, 0, 0, 0, 0]).await.unwrap();

        let m = metrics.clone();
        assert!(
            crate::test_support::wait_until(Duration::from_secs(5), move || {
                m.histogram(CONNECTION_HEARTBEAT_RTT_MS).is_some()
            })
            .await
        );
        assert!(manager.stats().last_heartbeat_rtt.is_some());
        assert!(manager.is_connected());

        manager.disconnect().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_frames_are_queued() {
        let (manager, mut peer, _metrics) = connected(16).await;

        peer.write_all(&[0x43, 0, 0, 0, 2, 0xAA, 0xBB]).await.unwrap();
        let routed = manager.next_frame().await.unwrap();
        assert!(matches!(routed, RoutedFrame::Unknown(_)));
        assert_eq!(routed.into_frame().packet_type, PacketType::DeviceInfo);

        manager.disconnect().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_queue_drops_and_counts() {
        let (manager, mut peer, metrics) = connected(1).await;

        peer.write_all(&[0x73, 0, 0, 0, 1, 0x01, 0x73, 0, 0, 0, 1, 0x02])
            .await
            .unwrap();
        let m = metrics.clone();
        assert!(
            crate::test_support::wait_until(Duration::from_secs(5), move || {
                m.counter(CONNECTION_DATA_QUEUE_DROPPED) == 1
            })
            .await
        );
        let kept = manager.next_frame().await.unwrap();
        assert_eq!(kept.frame().payload.as_ref(), &[0x01]);

        manager.disconnect().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_peer_close_triggers_reconnect() {
        let (manager, peer, metrics) = connected(16).await;
        drop(peer);

        let m = metrics.clone();
        assert!(
            crate::test_support::wait_until(Duration::from_secs(120), move || {
                m.counter_with(
                    crate::metrics::CONNECTION_RECONNECT,
                    &[("reason", "connection_closed"), ("outcome", "exhausted")],
                ) == 1
            })
            .await
        );
        assert_eq!(manager.state(), crate::state::ConnectionState::Disconnected);
    }
}
