//! Marker-delimited, checksummed inner structs.
//!
//! Data-channel and status-broadcast payloads embed a struct framed as:
//!
//! ```text
//! +------+----------------+----------+------+
//! | 0x7E | body (N bytes) | checksum | 0x7E |
//! +------+----------------+----------+------+
//! ```
//!
//! The checksum is the sum, modulo 256, of the body bytes.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::PacketDecodeError;

/// Marker byte delimiting an inner struct
pub const MARKER: u8 = 0x7E;

/// Marker + checksum + marker
pub const INNER_OVERHEAD: usize = 3;

/// Sum of `region` modulo 256.
///
/// `region` is the body strictly between the markers, excluding the
/// checksum byte itself.
pub fn calculate_checksum(region: &[u8]) -> u8 {
    region.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}

/// A validated inner struct.
///
/// Only the body is stored; the checksum is recomputed on every encode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InnerStruct {
    body: Bytes,
}

impl InnerStruct {
    /// Wrap a body
    pub fn new(body: impl Into<Bytes>) -> Self {
        Self { body: body.into() }
    }

    /// Body bytes between the markers, without the checksum
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Checksum of the body
    pub fn checksum(&self) -> u8 {
        calculate_checksum(&self.body)
    }

    /// Encoded length including markers and checksum
    pub fn encoded_len(&self) -> usize {
        self.body.len() + INNER_OVERHEAD
    }

    /// Encode with markers and a freshly computed checksum
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode_into(&mut buf);
        buf.freeze()
    }

    /// Append the encoded struct to `buf`
    pub fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_u8(MARKER);
        buf.put_slice(&self.body);
        buf.put_u8(self.checksum());
        buf.put_u8(MARKER);
    }

    /// Decode a struct spanning all of `raw`, validating markers and checksum
    pub fn decode(raw: &[u8]) -> Result<Self, PacketDecodeError> {
        if raw.len() < INNER_OVERHEAD {
            return Err(PacketDecodeError::StructTooShort(raw.len()));
        }
        if raw[0] != MARKER || raw[raw.len() - 1] != MARKER {
            return Err(PacketDecodeError::MissingMarker);
        }

        let body = &raw[1..raw.len() - 2];
        let found = raw[raw.len() - 2];
        let expected = calculate_checksum(body);
        if expected != found {
            return Err(PacketDecodeError::ChecksumMismatch { expected, found });
        }

        Ok(Self {
            body: Bytes::copy_from_slice(body),
        })
    }
}
