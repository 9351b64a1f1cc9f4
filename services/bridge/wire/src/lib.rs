//! Binary frame codec, inner-struct checksums, and stream framing for the device bridge.
//!
//! This crate implements the lowest layer of the bridge: turning raw TCP
//! bytes into typed frames and back. It knows framing boundaries and
//! checksums, nothing about connection state or device semantics.
//!
//! ## Wire Format
//!
//! ```text
//! +----------+-----------------+--------------------------------+
//! | u8 type  | 2 bytes reserved| u16 payload length (BE)        |
//! +----------+-----------------+--------------------------------+
//! | payload (0..65535 bytes)                                    |
//! +-------------------------------------------------------------+
//! ```
//!
//! Data-class payloads (`0x73`, `0x83`) may carry an inner struct after a
//! 7-byte routing prefix:
//!
//! ```text
//! | endpoint (4) | seq (2) | 0x00 | 0x7E | body … | checksum | 0x7E |
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod codec;
pub mod error;
pub mod frame;
pub mod header;
pub mod inner;

// Re-export main types
pub use codec::{
    decode_packet, device_query_struct, encode_data_channel, encode_handshake, encode_heartbeat,
    encode_heartbeat_ack, hello_ack_status, mesh_query_struct, ENDPOINT_LEN,
};
pub use error::{EncodeError, PacketDecodeError};
pub use frame::{Frame, PacketFramer, DATA_PREFIX_LEN};
pub use header::{PacketType, HEADER_SIZE, MAX_PAYLOAD_LEN};
pub use inner::{calculate_checksum, InnerStruct, MARKER};
