//! Mesh-wide and single-device queries.
//!
//! [`DeviceOperations`] sits on top of a [`ReliableChannel`]. Mesh queries are
//! reserved for the connection elected primary so that N bridges on the same
//! mesh do not each republish the same broadcast. Every device struct parsed
//! on the way through lands in the LRU [`DeviceCache`].

use bridge_session::metrics::{
    DEVICES_CACHE_EVICTION, DEVICES_DEVICE_REQUEST, DEVICES_DEVICE_REQUEST_LATENCY_MS,
    DEVICES_MESH_REQUEST, DEVICES_MESH_REQUEST_LATENCY_MS,
};
use bridge_session::{MetricsSink, ReliableChannel, TimeoutConfig};
use bridge_wire::{device_query_struct, mesh_query_struct, Frame, PacketType};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::cache::{DeviceCache, DEFAULT_CACHE_CAPACITY};
use crate::error::DeviceError;
use crate::info::{hex, parse_status_packet, validate_correlation_id, DeviceInfo, DEVICE_ID_LEN};

/// Tunables for [`DeviceOperations`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceOpsConfig {
    /// Maximum number of cached devices
    pub cache_capacity: usize,
    /// How long the mesh query may wait for its ACK
    pub mesh_send: Duration,
    /// Length of the status-broadcast collection window
    pub mesh_collection: Duration,
}

impl Default for DeviceOpsConfig {
    fn default() -> Self {
        Self::from_timeouts(&TimeoutConfig::default())
    }
}

impl DeviceOpsConfig {
    /// Take the mesh timeouts from a connection's timeout table
    pub fn from_timeouts(timeouts: &TimeoutConfig) -> Self {
        Self {
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            mesh_send: timeouts.mesh_send,
            mesh_collection: timeouts.mesh_collection,
        }
    }
}

/// Result of a mesh query, in arrival order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MeshResponse {
    /// Devices parsed from every status broadcast
    Parsed(Vec<DeviceInfo>),
    /// Status broadcasts as received
    Raw(Vec<Frame>),
}

impl MeshResponse {
    /// Number of devices or frames
    pub fn len(&self) -> usize {
        match self {
            MeshResponse::Parsed(devices) => devices.len(),
            MeshResponse::Raw(frames) => frames.len(),
        }
    }

    /// Whether nothing was collected
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Device queries over one reliable channel
#[derive(Debug)]
pub struct DeviceOperations {
    channel: Arc<dyn ReliableChannel>,
    is_primary: AtomicBool,
    cache: Mutex<DeviceCache>,
    config: DeviceOpsConfig,
    metrics: Arc<dyn MetricsSink>,
}

impl DeviceOperations {
    /// Create an instance that starts out non-primary
    pub fn new(
        channel: Arc<dyn ReliableChannel>,
        config: DeviceOpsConfig,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            channel,
            is_primary: AtomicBool::new(false),
            cache: Mutex::new(DeviceCache::new(config.cache_capacity)),
            config,
            metrics,
        }
    }

    /// Elect or demote this instance as the mesh primary
    pub fn set_primary(&self, primary: bool) {
        let previous = self.is_primary.swap(primary, Ordering::SeqCst);
        if previous != primary {
            info!(primary, "primary designation changed");
        }
    }

    /// Whether this instance may issue mesh queries
    pub fn is_primary(&self) -> bool {
        self.is_primary.load(Ordering::SeqCst)
    }

    /// Active configuration
    pub fn config(&self) -> &DeviceOpsConfig {
        &self.config
    }

    /// Broadcast a mesh status query and collect status broadcasts until the
    /// collection window closes.
    ///
    /// Fails with [`DeviceError::NotPrimary`] before any I/O unless this
    /// instance is primary. `refresh_id` becomes the correlation id of the
    /// parsed records when given; it must be a UUID.
    pub async fn ask_for_mesh_info(
        &self,
        parse: bool,
        refresh_id: Option<&str>,
    ) -> Result<MeshResponse, DeviceError> {
        if !self.is_primary() {
            self.metrics
                .increment(DEVICES_MESH_REQUEST, &[("outcome", "not_primary")]);
            return Err(DeviceError::NotPrimary);
        }
        if let Some(id) = refresh_id {
            validate_correlation_id(id)?;
        }

        let started = Instant::now();
        let report = match self
            .channel
            .send_reliable(&mesh_query_struct(), self.config.mesh_send)
            .await
        {
            Ok(report) => report,
            Err(e) => {
                self.metrics
                    .increment(DEVICES_MESH_REQUEST, &[("outcome", e.kind())]);
                warn!(error = %e, "mesh query send failed");
                return Err(e.into());
            }
        };
        let correlation_id = refresh_id
            .map(str::to_string)
            .unwrap_or_else(|| report.correlation_id.clone());

        if !report.success {
            let reason = report.reason.map(|r| r.as_str()).unwrap_or("unknown");
            self.metrics
                .increment(DEVICES_MESH_REQUEST, &[("outcome", "not_acknowledged")]);
            warn!(correlation_id = %correlation_id, reason, "mesh query not acknowledged");
            return Err(DeviceError::QueryNotAcknowledged {
                correlation_id,
                reason,
            });
        }

        let deadline = Instant::now() + self.config.mesh_collection;
        let mut devices = Vec::new();
        let mut frames = Vec::new();

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            let routed = match tokio::time::timeout(remaining, self.channel.recv_reliable()).await
            {
                Ok(Some(routed)) => routed,
                Ok(None) => {
                    debug!(correlation_id = %correlation_id, "channel closed during collection");
                    break;
                }
                Err(_) => break,
            };

            let frame = routed.into_frame();
            if frame.packet_type != PacketType::StatusBroadcast {
                debug!(packet_type = ?frame.packet_type, "ignoring frame during mesh collection");
                continue;
            }
            if !parse {
                frames.push(frame);
                continue;
            }
            match parse_status_packet(&frame, &correlation_id) {
                Ok(parsed) => {
                    self.cache_all(&parsed);
                    devices.extend(parsed);
                }
                Err(e) => warn!(error = %e, "skipping unparseable status broadcast"),
            }
        }

        let elapsed = started.elapsed();
        self.metrics
            .increment(DEVICES_MESH_REQUEST, &[("outcome", "success")]);
        self.metrics.observe(
            DEVICES_MESH_REQUEST_LATENCY_MS,
            elapsed.as_secs_f64() * 1000.0,
            &[],
        );

        let response = if parse {
            MeshResponse::Parsed(devices)
        } else {
            MeshResponse::Raw(frames)
        };
        info!(
            correlation_id = %correlation_id,
            parsed = parse,
            collected = response.len(),
            elapsed_ms = elapsed.as_millis() as u64,
            "mesh query complete"
        );
        Ok(response)
    }

    /// Query one device and wait up to `timeout` for its status.
    ///
    /// `Ok(None)` means the device did not answer in time. An error is
    /// returned for misuse or when the query could not be sent at all.
    pub async fn request_device_info(
        &self,
        device_id: &[u8],
        timeout: Duration,
    ) -> Result<Option<DeviceInfo>, DeviceError> {
        let id: [u8; DEVICE_ID_LEN] = device_id
            .try_into()
            .map_err(|_| DeviceError::InvalidDeviceId(device_id.len()))?;
        if timeout.is_zero() {
            return Err(DeviceError::InvalidTimeout);
        }

        let wanted = hex(&id);
        let started = Instant::now();
        let deadline = started + timeout;

        let report = match self
            .channel
            .send_reliable(&device_query_struct(id), timeout)
            .await
        {
            Ok(report) => report,
            Err(e) => {
                self.metrics
                    .increment(DEVICES_DEVICE_REQUEST, &[("outcome", e.kind())]);
                warn!(device = %wanted, error = %e, "device query send failed");
                return Err(e.into());
            }
        };
        if !report.success {
            self.metrics
                .increment(DEVICES_DEVICE_REQUEST, &[("outcome", "timeout")]);
            debug!(device = %wanted, "device query not acknowledged");
            return Ok(None);
        }

        let found = loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break None;
            }
            let frame = match tokio::time::timeout(remaining, self.channel.recv_reliable()).await {
                Ok(Some(routed)) => routed.into_frame(),
                Ok(None) | Err(_) => break None,
            };
            if !matches!(
                frame.packet_type,
                PacketType::DeviceInfo | PacketType::StatusBroadcast
            ) {
                continue;
            }
            let parsed = match parse_status_packet(&frame, &report.correlation_id) {
                Ok(parsed) => parsed,
                Err(e) => {
                    warn!(error = %e, "skipping unparseable device frame");
                    continue;
                }
            };
            self.cache_all(&parsed);
            if let Some(info) = parsed.into_iter().find(|d| d.device_id() == id) {
                break Some(info);
            }
        };

        let outcome = if found.is_some() { "success" } else { "timeout" };
        self.metrics
            .increment(DEVICES_DEVICE_REQUEST, &[("outcome", outcome)]);
        if found.is_some() {
            self.metrics.observe(
                DEVICES_DEVICE_REQUEST_LATENCY_MS,
                started.elapsed().as_secs_f64() * 1000.0,
                &[],
            );
        }
        debug!(device = %wanted, outcome, "device query finished");
        Ok(found)
    }

    /// Cached record for a hex device id, marking it recently used
    pub fn cached_device(&self, hex_id: &str) -> Option<DeviceInfo> {
        self.cache().get(&hex_id.to_ascii_lowercase()).cloned()
    }

    /// Every cached record, most recently used first
    pub fn cached_devices(&self) -> Vec<DeviceInfo> {
        self.cache().devices()
    }

    /// Number of cached records
    pub fn cache_len(&self) -> usize {
        self.cache().len()
    }

    fn cache(&self) -> MutexGuard<'_, DeviceCache> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn cache_all(&self, devices: &[DeviceInfo]) {
        let mut cache = self.cache();
        for device in devices {
            if let Some(evicted) = cache.insert(device.clone()) {
                self.metrics.increment(DEVICES_CACHE_EVICTION, &[]);
                debug!(device = %evicted.hex_id(), "evicted device from cache");
            }
        }
    }
}
