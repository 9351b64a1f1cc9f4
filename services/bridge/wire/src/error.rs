//! Wire protocol error types.

use thiserror::Error;

/// Errors produced while decoding a frame or an inner struct.
///
/// Decoding never fails in any other way: a decode call either returns a
/// value or one of these variants.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PacketDecodeError {
    /// Fewer bytes than the fixed frame header
    #[error("truncated frame: need at least {needed} bytes, got {got}")]
    Truncated {
        /// Minimum number of bytes required
        needed: usize,
        /// Number of bytes present
        got: usize,
    },

    /// Declared payload length disagrees with the bytes present
    #[error("length mismatch: header declares {declared} payload bytes, {actual} present")]
    LengthMismatch {
        /// Length decoded from the header
        declared: usize,
        /// Payload bytes actually present
        actual: usize,
    },

    /// Inner struct is not delimited by the marker byte at both ends
    #[error("inner struct marker missing")]
    MissingMarker,

    /// Inner struct too short to hold markers and a checksum
    #[error("inner struct too short: {0} bytes")]
    StructTooShort(usize),

    /// Inner struct checksum did not validate
    #[error("inner struct checksum mismatch: expected {expected:#04x}, found {found:#04x}")]
    ChecksumMismatch {
        /// Checksum computed over the body
        expected: u8,
        /// Checksum byte carried on the wire
        found: u8,
    },
}

/// Errors produced while encoding a frame.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EncodeError {
    /// Payload does not fit the 16-bit length field
    #[error("payload too large: {0} bytes")]
    PayloadTooLarge(usize),
}
