//! Device operation errors.

use bridge_session::ConnectionError;
use thiserror::Error;

/// Errors raised by device queries and struct parsing
#[derive(Error, Debug)]
pub enum DeviceError {
    /// Device ids are exactly four bytes
    #[error("device id must be 4 bytes, got {0}")]
    InvalidDeviceId(usize),

    /// Query timeouts must be positive
    #[error("timeout must be positive")]
    InvalidTimeout,

    /// Mesh-wide queries are reserved for the primary connection
    #[error("mesh queries are only issued by the primary connection")]
    NotPrimary,

    /// A device struct is exactly 24 bytes
    #[error("device struct must be 24 bytes, got {0}")]
    InvalidStructLength(usize),

    /// Correlation ids are UUID strings
    #[error("invalid correlation id {0:?}")]
    InvalidCorrelationId(String),

    /// The underlying link failed
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// The mesh query was sent but never acknowledged
    #[error("mesh query {correlation_id} not acknowledged ({reason})")]
    QueryNotAcknowledged {
        /// Correlation id of the query
        correlation_id: String,
        /// Failure label from the transport
        reason: &'static str,
    },
}

impl DeviceError {
    /// True for caller mistakes detected before any I/O
    pub fn is_misuse(&self) -> bool {
        matches!(
            self,
            DeviceError::InvalidDeviceId(_)
                | DeviceError::InvalidTimeout
                | DeviceError::NotPrimary
                | DeviceError::InvalidCorrelationId(_)
        )
    }

    /// Short label used for metrics
    pub fn kind(&self) -> &'static str {
        match self {
            DeviceError::InvalidDeviceId(_) => "invalid_device_id",
            DeviceError::InvalidTimeout => "invalid_timeout",
            DeviceError::NotPrimary => "not_primary",
            DeviceError::InvalidStructLength(_) => "invalid_struct_length",
            DeviceError::InvalidCorrelationId(_) => "invalid_correlation_id",
            DeviceError::Connection(e) => e.kind(),
            DeviceError::QueryNotAcknowledged { .. } => "not_acknowledged",
        }
    }
}
