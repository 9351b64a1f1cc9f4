//! Encoding and decoding of whole frames.
//!
//! This module builds the frames the bridge sends (handshake, heartbeat,
//! data channel) and decodes raw frames produced by the
//! [`PacketFramer`](crate::PacketFramer).

use bytes::{BufMut, Bytes, BytesMut};
use tracing::trace;

use crate::error::{EncodeError, PacketDecodeError};
use crate::frame::{locate_inner, Frame, DATA_PREFIX_LEN};
use crate::header::{declared_len, put_header, PacketType, HEADER_SIZE};
use crate::inner::InnerStruct;

/// Length of a device or endpoint identifier
pub const ENDPOINT_LEN: usize = 4;

/// Leading byte of the handshake payload
const HANDSHAKE_VERSION: u8 = 0x03;

/// Bytes between endpoint and auth code in the handshake payload
const HANDSHAKE_AUTH_TAG: [u8; 2] = [0x00, 0x10];

/// Trailer closing the handshake payload
const HANDSHAKE_TRAILER: [u8; 3] = [0x00, 0x00, 0xB4];

/// Mesh-wide query command body
const MESH_QUERY_BODY: [u8; 10] = [0xF8, 0x52, 0x06, 0x00, 0x00, 0x00, 0xFF, 0xFF, 0x00, 0x00];

/// Command byte of a single-device query
const DEVICE_QUERY_CMD: u8 = 0x53;

/// Encode the handshake frame announcing `endpoint` with `auth_code`.
pub fn encode_handshake(endpoint: [u8; ENDPOINT_LEN], auth_code: &[u8]) -> Result<Bytes, EncodeError> {
    let mut payload = BytesMut::with_capacity(
        1 + ENDPOINT_LEN + HANDSHAKE_AUTH_TAG.len() + auth_code.len() + HANDSHAKE_TRAILER.len(),
    );
    payload.put_u8(HANDSHAKE_VERSION);
    payload.put_slice(&endpoint);
    payload.put_slice(&HANDSHAKE_AUTH_TAG);
    payload.put_slice(auth_code);
    payload.put_slice(&HANDSHAKE_TRAILER);

    Frame::new(PacketType::Handshake, payload.freeze()).encode()
}

/// Encode an empty heartbeat frame.
pub fn encode_heartbeat() -> Bytes {
    empty_frame(PacketType::Heartbeat)
}

/// Encode an empty heartbeat acknowledgment.
pub fn encode_heartbeat_ack() -> Bytes {
    empty_frame(PacketType::HeartbeatAck)
}

fn empty_frame(packet_type: PacketType) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_SIZE);
    put_header(&mut buf, packet_type, 0);
    buf.freeze()
}

/// Encode a data-channel frame: routing prefix followed by `inner`.
pub fn encode_data_channel(
    endpoint: [u8; ENDPOINT_LEN],
    seq: u16,
    inner: &InnerStruct,
) -> Result<Bytes, EncodeError> {
    let mut payload = BytesMut::with_capacity(DATA_PREFIX_LEN + inner.encoded_len());
    payload.put_slice(&endpoint);
    payload.put_u16(seq);
    payload.put_u8(0);
    inner.encode_into(&mut payload);

    Frame::new(PacketType::DataChannel, payload.freeze()).encode()
}

/// Decode one complete raw frame.
///
/// Fails when `raw` is shorter than the header, when the declared length
/// disagrees with the payload present, or when an embedded inner struct
/// does not validate.
pub fn decode_packet(raw: &[u8]) -> Result<Frame, PacketDecodeError> {
    if raw.len() < HEADER_SIZE {
        return Err(PacketDecodeError::Truncated {
            needed: HEADER_SIZE,
            got: raw.len(),
        });
    }

    let declared = declared_len(raw);
    let actual = raw.len() - HEADER_SIZE;
    if declared != actual {
        return Err(PacketDecodeError::LengthMismatch { declared, actual });
    }

    let packet_type = PacketType::from(raw[0]);
    let payload = &raw[HEADER_SIZE..];

    if packet_type.carries_inner_struct() {
        if let Some(region) = locate_inner(payload) {
            InnerStruct::decode(region)?;
        }
    }

    trace!(packet_type = ?packet_type, len = actual, "decoded frame");
    Ok(Frame::new(packet_type, Bytes::copy_from_slice(payload)))
}

/// Inner struct asking every reachable device to broadcast its status.
pub fn mesh_query_struct() -> InnerStruct {
    InnerStruct::new(Bytes::from_static(&MESH_QUERY_BODY))
}

/// Inner struct asking a single device for its status.
pub fn device_query_struct(device_id: [u8; ENDPOINT_LEN]) -> InnerStruct {
    let mut body = BytesMut::with_capacity(3 + ENDPOINT_LEN);
    body.put_u8(0xF8);
    body.put_u8(DEVICE_QUERY_CMD);
    body.put_u8(ENDPOINT_LEN as u8);
    body.put_slice(&device_id);
    InnerStruct::new(body.freeze())
}

/// Status byte of a HELLO_ACK payload; zero means accepted.
pub fn hello_ack_status(frame: &Frame) -> u8 {
    frame.payload.first().copied().unwrap_or(0)
}
