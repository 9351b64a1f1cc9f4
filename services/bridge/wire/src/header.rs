//! Frame header and packet type definitions.
//!
//! Every frame starts with a 5-byte big-endian header:
//!
//! ```text
//! +--------+-----------+------------+-------------+
//! | byte 0 | bytes 1-2 | byte 3     | byte 4      |
//! | type   | reserved  | multiplier | length low  |
//! +--------+-----------+------------+-------------+
//! ```
//!
//! The payload length is `multiplier * 256 + length_low`.

use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};

/// Header size in bytes
pub const HEADER_SIZE: usize = 5;

/// Largest payload the length field can express
pub const MAX_PAYLOAD_LEN: usize = u16::MAX as usize;

/// Packet types known to the protocol.
///
/// Unrecognised type bytes decode to [`PacketType::Unknown`] instead of
/// failing, so the router can queue them for inspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PacketType {
    /// Connection handshake carrying endpoint and auth code
    Handshake,
    /// Handshake acknowledgment
    HelloAck,
    /// Single device information
    DeviceInfo,
    /// Device information acknowledgment
    InfoAck,
    /// Bidirectional data channel
    DataChannel,
    /// Device keepalive
    Keepalive,
    /// Data channel acknowledgment
    DataAck,
    /// Mesh status broadcast
    StatusBroadcast,
    /// Status broadcast acknowledgment
    StatusAck,
    /// Heartbeat ping
    Heartbeat,
    /// Heartbeat acknowledgment
    HeartbeatAck,
    /// Any other type byte
    Unknown(u8),
}

impl PacketType {
    /// Wire value of this type
    pub fn as_u8(self) -> u8 {
        match self {
            PacketType::Handshake => 0x23,
            PacketType::HelloAck => 0x28,
            PacketType::DeviceInfo => 0x43,
            PacketType::InfoAck => 0x48,
            PacketType::DataChannel => 0x73,
            PacketType::Keepalive => 0x78,
            PacketType::DataAck => 0x7B,
            PacketType::StatusBroadcast => 0x83,
            PacketType::StatusAck => 0x88,
            PacketType::Heartbeat => 0xD3,
            PacketType::HeartbeatAck => 0xD8,
            PacketType::Unknown(value) => value,
        }
    }

    /// Acknowledgment frames that complete a pending request
    pub fn is_ack(self) -> bool {
        matches!(
            self,
            PacketType::HelloAck
                | PacketType::InfoAck
                | PacketType::DataAck
                | PacketType::StatusAck
                | PacketType::HeartbeatAck
        )
    }

    /// Frames handed to the higher layer as data
    pub fn is_data(self) -> bool {
        matches!(self, PacketType::DataChannel | PacketType::StatusBroadcast)
    }

    /// Frames whose payload may embed a marker-delimited inner struct
    pub fn carries_inner_struct(self) -> bool {
        self.is_data()
    }
}

impl From<u8> for PacketType {
    fn from(value: u8) -> Self {
        match value {
            0x23 => PacketType::Handshake,
            0x28 => PacketType::HelloAck,
            0x43 => PacketType::DeviceInfo,
            0x48 => PacketType::InfoAck,
            0x73 => PacketType::DataChannel,
            0x78 => PacketType::Keepalive,
            0x7B => PacketType::DataAck,
            0x83 => PacketType::StatusBroadcast,
            0x88 => PacketType::StatusAck,
            0xD3 => PacketType::Heartbeat,
            0xD8 => PacketType::HeartbeatAck,
            other => PacketType::Unknown(other),
        }
    }
}

impl From<PacketType> for u8 {
    fn from(value: PacketType) -> Self {
        value.as_u8()
    }
}

/// Read the declared payload length from a header.
///
/// Callers must ensure `header` holds at least [`HEADER_SIZE`] bytes.
pub fn declared_len(header: &[u8]) -> usize {
    (header[3] as usize) * 256 + header[4] as usize
}

/// Write a header for `packet_type` with `payload_len` bytes following.
pub(crate) fn put_header(buf: &mut BytesMut, packet_type: PacketType, payload_len: usize) {
    debug_assert!(payload_len <= MAX_PAYLOAD_LEN);
    buf.put_u8(packet_type.as_u8());
    buf.put_u8(0);
    buf.put_u8(0);
    buf.put_u16(payload_len as u16);
}
