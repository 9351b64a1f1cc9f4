//! Device records and the 24-byte struct parser.
//!
//! ```text
//! | id (4) | capabilities u32 BE (4) | on | bri | ct | online | r | g | b | reserved (9) |
//!            ^ top byte = device type
//! ```

use bitflags::bitflags;
use bridge_wire::Frame;
use bytes::Bytes;
use serde::{Deserialize, Serialize, Serializer};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::error::DeviceError;

/// Length of one device struct
pub const DEVICE_STRUCT_LEN: usize = 24;

/// Length of a device id
pub const DEVICE_ID_LEN: usize = 4;

/// State keys present on every device
pub const STATE_ON: &str = "on";
/// Brightness, 0-255
pub const STATE_BRIGHTNESS: &str = "brightness";
/// Colour temperature step
pub const STATE_COLOR_TEMP: &str = "color_temp";
/// Reachability flag
pub const STATE_ONLINE: &str = "online";

bitflags! {
    /// Capability bits in the low 24 bits of the capability word
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct Capabilities: u32 {
        /// Can be switched on and off
        const ON_OFF = 1 << 0;
        /// Supports brightness
        const DIMMABLE = 1 << 1;
        /// Supports colour temperature
        const COLOR_TEMP = 1 << 2;
        /// Supports RGB colour
        const RGB = 1 << 3;
        /// Relays mesh traffic
        const MESH_RELAY = 1 << 4;
    }
}

/// Device family selected by the type byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceClass {
    /// 0x01-0x1F
    Light,
    /// 0x20-0x2F
    Switch,
    /// 0x30-0x3F
    Plug,
    /// 0x40-0x4F
    Bridge,
    /// Anything else
    Unknown,
}

impl DeviceClass {
    /// Classify a device type byte
    pub fn from_type(device_type: u8) -> Self {
        match device_type {
            0x01..=0x1F => DeviceClass::Light,
            0x20..=0x2F => DeviceClass::Switch,
            0x30..=0x3F => DeviceClass::Plug,
            0x40..=0x4F => DeviceClass::Bridge,
            _ => DeviceClass::Unknown,
        }
    }
}

fn as_hex<T: AsRef<[u8]>, S: Serializer>(bytes: &T, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&hex(bytes.as_ref()))
}

pub(crate) fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// One parsed device struct
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceInfo {
    #[serde(serialize_with = "as_hex")]
    device_id: [u8; DEVICE_ID_LEN],
    device_type: u8,
    class: DeviceClass,
    capabilities: u32,
    state: BTreeMap<String, u8>,
    #[serde(serialize_with = "as_hex")]
    raw_bytes: [u8; DEVICE_STRUCT_LEN],
    correlation_id: String,
}

impl DeviceInfo {
    /// Parse exactly one 24-byte struct
    pub fn from_struct(raw: &[u8], correlation_id: &str) -> Result<Self, DeviceError> {
        let raw_bytes: [u8; DEVICE_STRUCT_LEN] = raw
            .try_into()
            .map_err(|_| DeviceError::InvalidStructLength(raw.len()))?;
        validate_correlation_id(correlation_id)?;

        let device_id = [raw_bytes[0], raw_bytes[1], raw_bytes[2], raw_bytes[3]];
        let capabilities = u32::from_be_bytes([raw_bytes[4], raw_bytes[5], raw_bytes[6], raw_bytes[7]]);
        let device_type = raw_bytes[4];

        let mut state = BTreeMap::new();
        state.insert(STATE_ON.to_string(), raw_bytes[8]);
        state.insert(STATE_BRIGHTNESS.to_string(), raw_bytes[9]);
        state.insert(STATE_COLOR_TEMP.to_string(), raw_bytes[10]);
        state.insert(STATE_ONLINE.to_string(), raw_bytes[11]);

        let flags = Capabilities::from_bits_truncate(capabilities & 0x00FF_FFFF);
        if flags.contains(Capabilities::RGB) {
            state.insert("red".to_string(), raw_bytes[12]);
            state.insert("green".to_string(), raw_bytes[13]);
            state.insert("blue".to_string(), raw_bytes[14]);
        }

        Ok(Self {
            device_id,
            device_type,
            class: DeviceClass::from_type(device_type),
            capabilities,
            state,
            raw_bytes,
            correlation_id: correlation_id.to_string(),
        })
    }

    /// Four-byte device id
    pub fn device_id(&self) -> [u8; DEVICE_ID_LEN] {
        self.device_id
    }

    /// Lowercase hex id, the cache key
    pub fn hex_id(&self) -> String {
        hex(&self.device_id)
    }

    /// Type byte (top byte of the capability word)
    pub fn device_type(&self) -> u8 {
        self.device_type
    }

    /// Device family
    pub fn class(&self) -> DeviceClass {
        self.class
    }

    /// Full capability word
    pub fn capabilities(&self) -> u32 {
        self.capabilities
    }

    /// Known capability bits
    pub fn capability_flags(&self) -> Capabilities {
        Capabilities::from_bits_truncate(self.capabilities & 0x00FF_FFFF)
    }

    /// State values by key
    pub fn state(&self) -> &BTreeMap<String, u8> {
        &self.state
    }

    /// One state value
    pub fn state_value(&self, key: &str) -> Option<u8> {
        self.state.get(key).copied()
    }

    /// Whether the device reports itself switched on
    pub fn is_on(&self) -> bool {
        self.state_value(STATE_ON).unwrap_or(0) != 0
    }

    /// Whether this device is a bridge
    pub fn is_bridge(&self) -> bool {
        self.class == DeviceClass::Bridge
    }

    /// The struct as received
    pub fn raw_bytes(&self) -> &[u8; DEVICE_STRUCT_LEN] {
        &self.raw_bytes
    }

    /// Correlation id of the query that produced this record
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }
}

pub(crate) fn validate_correlation_id(correlation_id: &str) -> Result<(), DeviceError> {
    Uuid::parse_str(correlation_id)
        .map(|_| ())
        .map_err(|_| DeviceError::InvalidCorrelationId(correlation_id.to_string()))
}

/// Parse one 24-byte device struct.
pub fn parse_device_struct(raw: &[u8], correlation_id: &str) -> Result<DeviceInfo, DeviceError> {
    DeviceInfo::from_struct(raw, correlation_id)
}

/// Bytes holding device structs: the inner-struct body when present, else the payload
pub fn struct_region(frame: &Frame) -> Bytes {
    match frame.inner_struct() {
        Some(inner) => inner.body().clone(),
        None => frame.payload.clone(),
    }
}

/// Parse every whole device struct in a status frame.
///
/// The region is walked in 24-byte strides; a shorter tail is dropped.
pub fn parse_status_packet(frame: &Frame, correlation_id: &str) -> Result<Vec<DeviceInfo>, DeviceError> {
    validate_correlation_id(correlation_id)?;
    let region = struct_region(frame);
    let tail = region.len() % DEVICE_STRUCT_LEN;
    if tail != 0 {
        tracing::debug!(
            packet_type = ?frame.packet_type,
            tail,
            "dropping short trailing device struct"
        );
    }
    region
        .chunks_exact(DEVICE_STRUCT_LEN)
        .map(|chunk| DeviceInfo::from_struct(chunk, correlation_id))
        .collect()
}
