//! Connection lifecycle and reliable transport for the device bridge.
//!
//! This crate owns one physical link per [`ConnectionManager`]: dialing,
//! the handshake with retry, the packet router with heartbeat, and a single
//! coalesced reconnect task. [`ReliableTransport`] layers ACK-matched
//! request/response on top.
//!
//! ## Features
//!
//! - **Transport**: plain TCP, or TLS behind the `tls` feature
//! - **Handshake**: `0x23` → `0x28`, bounded, retried with backoff
//! - **Heartbeat**: `0xD3` → `0xD8` with RTT measurement
//! - **Packet router**: ACK dispatch, bounded data queue, malformed-frame skip
//! - **Reconnect**: triggered by heartbeat loss or router exit, coalesced
//!
//! ## Example
//!
//! ```rust,no_run
//! use bridge_session::{
//!     ConnectionConfig, ConnectionManager, ReliableTransport, TcpConnector, TracingMetrics,
//! };
//! use bridge_wire::mesh_query_struct;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let metrics = Arc::new(TracingMetrics);
//! let manager = ConnectionManager::new(
//!     "living-room",
//!     Arc::new(TcpConnector::new("192.168.1.40:23778")),
//!     ConnectionConfig::default(),
//!     metrics.clone(),
//! );
//!
//! if manager.connect([0x39, 0x87, 0xC8, 0x57], &b"0123456789abcdef"[..]).await? {
//!     let transport = ReliableTransport::new(Arc::new(manager.clone()), metrics);
//!     let report = transport
//!         .send_reliable(&mesh_query_struct(), Duration::from_secs(2))
//!         .await?;
//!     println!("acked: {}", report.success);
//! }
//!
//! manager.disconnect().await;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
mod handshake;
pub mod keepalive;
pub mod manager;
pub mod metrics;
pub mod pending;
pub mod reliability;
mod router;
pub mod state;
pub mod transport;

#[cfg(test)]
mod test_support;

// Re-export main types
pub use config::{ConnectionConfig, RetryPolicy, TimeoutConfig, DEFAULT_DATA_QUEUE_CAPACITY};
pub use error::ConnectionError;
pub use keepalive::HeartbeatState;
pub use manager::{ConnectionManager, ConnectionStats, ReconnectHandle};
pub use metrics::{
    HistogramSummary, InMemoryMetrics, MetricsSink, MetricsSnapshot, NoopMetrics, TracingMetrics,
};
pub use pending::{PendingMessage, PendingQueue, PendingTicket};
pub use reliability::{PacketLink, ReliableChannel, ReliableTransport, SendFailure, SendReport};
pub use router::RoutedFrame;
pub use state::ConnectionState;
pub use transport::{AsyncStream, BoxedStream, Connector, IoStream, TcpConnector};

// Re-export TLS functionality when available
#[cfg(feature = "tls")]
pub use transport::tls::{connect_tls, make_client_config, ClientIdentity};
#[cfg(feature = "tls")]
pub use transport::TlsSettings;
