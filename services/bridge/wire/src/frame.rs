//! Frames and stream framing.
//!
//! [`Frame`] is one decoded protocol message. [`PacketFramer`] splits an
//! arbitrarily chunked byte stream into complete raw frames.

use bytes::{Bytes, BytesMut};

use crate::error::EncodeError;
use crate::header::{declared_len, put_header, PacketType, HEADER_SIZE, MAX_PAYLOAD_LEN};
use crate::inner::{InnerStruct, INNER_OVERHEAD, MARKER};

/// Routing prefix ahead of the inner struct in data-class payloads:
/// endpoint (4), sequence (2), reserved (1)
pub const DATA_PREFIX_LEN: usize = 7;

/// Complete protocol frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Packet type from header byte 0
    pub packet_type: PacketType,
    /// Payload following the header
    pub payload: Bytes,
}

impl Frame {
    /// Create a frame
    pub fn new(packet_type: PacketType, payload: impl Into<Bytes>) -> Self {
        Self {
            packet_type,
            payload: payload.into(),
        }
    }

    /// Total size when encoded
    pub fn encoded_size(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }

    /// Encode header and payload into a contiguous buffer
    pub fn encode(&self) -> Result<Bytes, EncodeError> {
        if self.payload.len() > MAX_PAYLOAD_LEN {
            return Err(EncodeError::PayloadTooLarge(self.payload.len()));
        }

        let mut buf = BytesMut::with_capacity(self.encoded_size());
        put_header(&mut buf, self.packet_type, self.payload.len());
        buf.extend_from_slice(&self.payload);
        Ok(buf.freeze())
    }

    /// Raw inner struct bytes (markers included), if this frame carries one
    pub fn inner_region(&self) -> Option<&[u8]> {
        if !self.packet_type.carries_inner_struct() {
            return None;
        }
        locate_inner(&self.payload)
    }

    /// Decoded inner struct, if present and valid
    pub fn inner_struct(&self) -> Option<InnerStruct> {
        self.inner_region()
            .and_then(|raw| InnerStruct::decode(raw).ok())
    }
}

/// Find a marker-delimited struct after the routing prefix.
pub(crate) fn locate_inner(payload: &[u8]) -> Option<&[u8]> {
    if payload.len() < DATA_PREFIX_LEN + INNER_OVERHEAD {
        return None;
    }
    let region = &payload[DATA_PREFIX_LEN..];
    if region[0] == MARKER && region[region.len() - 1] == MARKER {
        Some(region)
    } else {
        None
    }
}

/// Stateful byte-stream de-multiplexer.
///
/// One instance per physical connection. Bytes are never dropped: an
/// incomplete trailing frame stays buffered until the next [`feed`].
///
/// [`feed`]: PacketFramer::feed
#[derive(Debug)]
pub struct PacketFramer {
    buffer: BytesMut,
}

impl PacketFramer {
    /// Create an empty framer
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(4 * 1024),
        }
    }

    /// Append `chunk` and extract every complete frame now available
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Bytes> {
        self.buffer.extend_from_slice(chunk);

        let mut frames = Vec::new();
        while self.buffer.len() >= HEADER_SIZE {
            let total = HEADER_SIZE + declared_len(&self.buffer);
            if self.buffer.len() < total {
                break;
            }
            frames.push(self.buffer.split_to(total).freeze());
        }
        frames
    }

    /// Bytes held back waiting for the rest of a frame
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Discard buffered bytes
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

impl Default for PacketFramer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_stream() -> Vec<u8> {
        let frames = [
            Frame::new(PacketType::HelloAck, vec![0x00]),
            Frame::new(PacketType::HeartbeatAck, Bytes::new()),
            Frame::new(PacketType::StatusBroadcast, vec![0xAB; 300]),
            Frame::new(PacketType::DataAck, vec![0x01, 0x02, 0x03]),
        ];
        frames
            .iter()
            .flat_map(|f| f.encode().unwrap().to_vec())
            .collect()
    }

    #[test]
    fn test_feed_whole_stream() {
        let mut framer = PacketFramer::new();
        let frames = framer.feed(&sample_stream());

        assert_eq!(frames.len(), 4);
        assert_eq!(frames[2].len(), HEADER_SIZE + 300);
        assert_eq!(framer.buffered(), 0);
    }

    #[test]
    fn test_chunking_invariance() {
        let stream = sample_stream();
        let expected = PacketFramer::new().feed(&stream);

        for chunk_size in [1, 2, 3, 5, 7, 64, 301] {
            let mut framer = PacketFramer::new();
            let mut collected = Vec::new();
            for chunk in stream.chunks(chunk_size) {
                collected.extend(framer.feed(chunk));
            }
            assert_eq!(collected, expected, "chunk size {}", chunk_size);
            assert_eq!(framer.buffered(), 0);
        }
    }

    #[test]
    fn test_partial_frame_is_retained() {
        let mut framer = PacketFramer::new();
        assert!(framer.feed(&[0x83, 0x00, 0x00]).is_empty());
        assert!(framer.feed(&[0x00, 0x02, 0xAA]).is_empty());
        assert_eq!(framer.buffered(), 6);

        let frames = framer.feed(&[0xBB, 0xD8]);
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0][..], &[0x83, 0x00, 0x00, 0x00, 0x02, 0xAA, 0xBB]);
        assert_eq!(framer.buffered(), 1);
    }

    #[test]
    fn test_inner_region_requires_prefix_and_markers() {
        let inner = InnerStruct::new(vec![0x01, 0x02]).encode();
        let mut payload = vec![0u8; DATA_PREFIX_LEN];
        payload.extend_from_slice(&inner);

        let frame = Frame::new(PacketType::DataChannel, payload.clone());
        assert_eq!(frame.inner_region(), Some(&inner[..]));
        assert_eq!(frame.inner_struct().unwrap().body().as_ref(), &[0x01, 0x02]);

        // Same bytes on a non-data type are opaque
        let frame = Frame::new(PacketType::DeviceInfo, payload);
        assert!(frame.inner_region().is_none());

        let frame = Frame::new(PacketType::StatusBroadcast, vec![0x7E; 4]);
        assert!(frame.inner_region().is_none());
    }

    #[test]
    fn test_encode_rejects_oversized_payload() {
        let frame = Frame::new(PacketType::DataChannel, vec![0u8; MAX_PAYLOAD_LEN + 1]);
        assert_eq!(
            frame.encode(),
            Err(EncodeError::PayloadTooLarge(MAX_PAYLOAD_LEN + 1))
        );
    }
}
