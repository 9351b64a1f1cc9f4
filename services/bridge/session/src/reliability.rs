//! Reliable request/response over a managed connection.
//!
//! A send registers a DATA_ACK waiter, writes the data-channel frame through
//! the connection's state check, and waits for the ACK. Missing ACKs are an
//! ordinary outcome reported in [`SendReport`], not an error.

use async_trait::async_trait;
use bridge_wire::{encode_data_channel, InnerStruct, PacketType};
use serde::Serialize;
use std::fmt::Debug;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::ConnectionError;
use crate::manager::ConnectionManager;
use crate::metrics::{MetricsSink, TRANSPORT_ACK_LATENCY_MS, TRANSPORT_SEND};
use crate::pending::PendingQueue;
use crate::router::RoutedFrame;

/// What the reliable layer needs from a connection
#[async_trait]
pub trait PacketLink: Send + Sync + Debug {
    /// Identifier for logs
    fn link_id(&self) -> &str;

    /// Endpoint id the link authenticated as
    fn endpoint(&self) -> Option<[u8; 4]>;

    /// ACK waiters fed by the link's router
    fn pending(&self) -> &PendingQueue;

    /// Write an encoded frame if the link is connected
    async fn send_checked(&self, operation: &str, frame: &[u8]) -> Result<(), ConnectionError>;

    /// Next data or unknown frame from the router
    async fn next_frame(&self) -> Option<RoutedFrame>;
}

#[async_trait]
impl PacketLink for ConnectionManager {
    fn link_id(&self) -> &str {
        self.id()
    }

    fn endpoint(&self) -> Option<[u8; 4]> {
        ConnectionManager::endpoint(self)
    }

    fn pending(&self) -> &PendingQueue {
        ConnectionManager::pending(self)
    }

    async fn send_checked(&self, operation: &str, frame: &[u8]) -> Result<(), ConnectionError> {
        self.send(operation, frame).await
    }

    async fn next_frame(&self) -> Option<RoutedFrame> {
        ConnectionManager::next_frame(self).await
    }
}

/// Why a reliable send did not complete
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SendFailure {
    /// No ACK within the timeout
    Timeout,
    /// The link was torn down while waiting
    Closed,
}

impl SendFailure {
    /// Label used in logs and metrics
    pub fn as_str(self) -> &'static str {
        match self {
            SendFailure::Timeout => "timeout",
            SendFailure::Closed => "closed",
        }
    }
}

/// Outcome of [`ReliableTransport::send_reliable`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SendReport {
    /// True when the ACK arrived
    pub success: bool,
    /// Set when `success` is false
    pub reason: Option<SendFailure>,
    /// Correlation id attached to this request in logs
    pub correlation_id: String,
    /// Time from send to ACK or give-up
    pub latency: Duration,
}

/// What device operations need from the reliable layer
#[async_trait]
pub trait ReliableChannel: Send + Sync + Debug {
    /// Send `inner` and wait up to `timeout` for its ACK
    async fn send_reliable(
        &self,
        inner: &InnerStruct,
        timeout: Duration,
    ) -> Result<SendReport, ConnectionError>;

    /// Next inbound data or unknown frame
    async fn recv_reliable(&self) -> Option<RoutedFrame>;
}

/// ACK-matched sends over a [`PacketLink`]
#[derive(Debug)]
pub struct ReliableTransport {
    link: Arc<dyn PacketLink>,
    seq: AtomicU16,
    metrics: Arc<dyn MetricsSink>,
}

impl ReliableTransport {
    /// Wrap `link`
    pub fn new(link: Arc<dyn PacketLink>, metrics: Arc<dyn MetricsSink>) -> Self {
        Self {
            link,
            seq: AtomicU16::new(0),
            metrics,
        }
    }

    /// Underlying link
    pub fn link(&self) -> &Arc<dyn PacketLink> {
        &self.link
    }

    /// Send `inner` on the data channel and wait up to `timeout` for DATA_ACK.
    ///
    /// Returns `Err` only when the frame could not be written (not connected,
    /// socket failure, encoding failure). A missing ACK yields
    /// `success == false`.
    pub async fn send_reliable(
        &self,
        inner: &InnerStruct,
        timeout: Duration,
    ) -> Result<SendReport, ConnectionError> {
        let endpoint = self.link.endpoint().unwrap_or_default();
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let frame = encode_data_channel(endpoint, seq, inner)?;
        let correlation_id = Uuid::new_v4().to_string();

        let pending = self.link.pending();
        let ticket = pending.register(PacketType::DataAck, correlation_id.clone(), 0);
        let started = Instant::now();

        if let Err(e) = self.link.send_checked("send_reliable", &frame).await {
            pending.remove(ticket.msg_id);
            self.metrics
                .increment(TRANSPORT_SEND, &[("outcome", e.kind())]);
            warn!(
                connection = %self.link.link_id(),
                correlation_id = %correlation_id,
                error = %e,
                "reliable send failed"
            );
            return Err(e);
        }

        let (success, reason) = match pending.wait(ticket, timeout).await {
            Ok(_) => (true, None),
            Err(ConnectionError::Timeout(_)) => (false, Some(SendFailure::Timeout)),
            Err(ConnectionError::Closed) => (false, Some(SendFailure::Closed)),
            Err(e) => return Err(e),
        };
        let latency = started.elapsed();

        let outcome = reason.map(SendFailure::as_str).unwrap_or("success");
        self.metrics.increment(TRANSPORT_SEND, &[("outcome", outcome)]);
        if success {
            self.metrics
                .observe(TRANSPORT_ACK_LATENCY_MS, latency.as_secs_f64() * 1000.0, &[]);
        }
        debug!(
            connection = %self.link.link_id(),
            correlation_id = %correlation_id,
            seq,
            outcome,
            latency_ms = latency.as_millis() as u64,
            "reliable send finished"
        );

        Ok(SendReport {
            success,
            reason,
            correlation_id,
            latency,
        })
    }

    /// Next data or unknown frame queued by the router
    pub async fn recv_reliable(&self) -> Option<RoutedFrame> {
        self.link.next_frame().await
    }
}

#[async_trait]
impl ReliableChannel for ReliableTransport {
    async fn send_reliable(
        &self,
        inner: &InnerStruct,
        timeout: Duration,
    ) -> Result<SendReport, ConnectionError> {
        ReliableTransport::send_reliable(self, inner, timeout).await
    }

    async fn recv_reliable(&self) -> Option<RoutedFrame> {
        ReliableTransport::recv_reliable(self).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionConfig;
    use crate::metrics::InMemoryMetrics;
    use crate::test_support::{accept, read_frame, ScriptedConnector};
    use bridge_wire::{mesh_query_struct, DATA_PREFIX_LEN};
    use tokio::io::{AsyncWriteExt, DuplexStream};

    const ENDPOINT: [u8; 4] = [0x39, 0x87, 0xC8, 0x57];

    async fn transport() -> (ReliableTransport, ConnectionManager, DuplexStream, Arc<InMemoryMetrics>) {
        let (connector, mut peers) = ScriptedConnector::new(1);
        let metrics = Arc::new(InMemoryMetrics::new());
        let manager = ConnectionManager::new(
            "reliable",
            Arc::new(connector),
            ConnectionConfig::default(),
            metrics.clone(),
        );
        let mut peer = peers.remove(0);
        let peer_task = tokio::spawn(async move {
            accept(&mut peer).await;
            peer
        });
        assert!(manager.connect(ENDPOINT, &b"auth"[..]).await.unwrap());
        let peer = peer_task.await.unwrap();
        let transport = ReliableTransport::new(Arc::new(manager.clone()), metrics.clone());
        (transport, manager, peer, metrics)
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_is_acknowledged() {
        let (transport, manager, mut peer, metrics) = transport().await;

        let peer_task = tokio::spawn(async move {
            let frame = read_frame(&mut peer).await;
            peer.write_all(&[0x7B, 0, 0, 0, 0]).await.unwrap();
            (frame, peer)
        });

        let report = transport
            .send_reliable(&mesh_query_struct(), Duration::from_secs(2))
            .await
            .unwrap();
        let (frame, _peer) = peer_task.await.unwrap();

        assert!(report.success);
        assert_eq!(report.reason, None);
        assert!(Uuid::parse_str(&report.correlation_id).is_ok());
        assert_eq!(frame.packet_type, PacketType::DataChannel);
        assert_eq!(&frame.payload[..4], &ENDPOINT);
        assert_eq!(frame.inner_struct(), Some(mesh_query_struct()));
        assert_eq!(frame.payload.len(), DATA_PREFIX_LEN + mesh_query_struct().encoded_len());
        assert_eq!(metrics.counter_with(TRANSPORT_SEND, &[("outcome", "success")]), 1);
        assert!(manager.pending().is_empty());

        manager.disconnect().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_ack_reports_timeout() {
        let (transport, manager, _peer, metrics) = transport().await;

        let report = transport
            .send_reliable(&mesh_query_struct(), Duration::from_millis(500))
            .await
            .unwrap();

        assert!(!report.success);
        assert_eq!(report.reason, Some(SendFailure::Timeout));
        assert!(report.latency >= Duration::from_millis(500));
        assert!(manager.pending().is_empty());
        assert_eq!(metrics.counter_with(TRANSPORT_SEND, &[("outcome", "timeout")]), 1);

        manager.disconnect().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_acks_complete_sends_in_order() {
        let (transport, manager, mut peer, _metrics) = transport().await;
        let transport = Arc::new(transport);

        let peer_task = tokio::spawn(async move {
            let first = read_frame(&mut peer).await;
            let second = read_frame(&mut peer).await;
            peer.write_all(&[0x7B, 0, 0, 0, 0, 0x7B, 0, 0, 0, 0]).await.unwrap();
            (first, second, peer)
        });

        let a = {
            let t = transport.clone();
            tokio::spawn(async move { t.send_reliable(&mesh_query_struct(), Duration::from_secs(2)).await })
        };
        tokio::task::yield_now().await;
        let b = {
            let t = transport.clone();
            tokio::spawn(async move { t.send_reliable(&mesh_query_struct(), Duration::from_secs(2)).await })
        };

        assert!(a.await.unwrap().unwrap().success);
        assert!(b.await.unwrap().unwrap().success);
        let (first, second, _peer) = peer_task.await.unwrap();
        // sequence numbers follow send order
        assert_ne!(first.payload[4..6], second.payload[4..6]);
        assert!(manager.pending().is_empty());

        manager.disconnect().await;
    }

    #[tokio::test]
    async fn test_send_without_connection_fails_fast() {
        let (connector, _peers) = ScriptedConnector::new(0);
        let manager = ConnectionManager::new(
            "idle",
            Arc::new(connector),
            ConnectionConfig::default(),
            crate::metrics::noop(),
        );
        let transport = ReliableTransport::new(Arc::new(manager.clone()), crate::metrics::noop());

        let err = transport
            .send_reliable(&mesh_query_struct(), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectionError::NotConnected { .. }));
        assert!(manager.pending().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_recv_reliable_returns_queued_data() {
        let (transport, manager, mut peer, _metrics) = transport().await;

        peer.write_all(&[0x83, 0, 0, 0, 3, 0x01, 0x02, 0x03]).await.unwrap();
        let routed = transport.recv_reliable().await.unwrap();
        assert!(matches!(routed, RoutedFrame::Data(_)));
        assert_eq!(routed.frame().packet_type, PacketType::StatusBroadcast);

        manager.disconnect().await;
    }
}
