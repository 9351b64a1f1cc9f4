//! Connection error types.

use bridge_wire::{EncodeError, PacketDecodeError};
use thiserror::Error;

use crate::state::ConnectionState;

/// Errors raised by the connection and transport layers
#[derive(Error, Debug)]
pub enum ConnectionError {
    /// Operation attempted while the connection was not established
    #[error("{operation} requires a connected link (state: {state})")]
    NotConnected {
        /// Operation that was refused
        operation: String,
        /// State observed under the state lock
        state: ConnectionState,
    },

    /// Socket-level failure
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Dialing the remote endpoint failed
    #[error("dial {target} failed: {reason}")]
    Dial {
        /// Address or description of the target
        target: String,
        /// Underlying failure
        reason: String,
    },

    /// Malformed frame
    #[error("decode error: {0}")]
    Decode(#[from] PacketDecodeError),

    /// Outgoing frame could not be encoded
    #[error("encode error: {0}")]
    Encode(#[from] EncodeError),

    /// The peer rejected the auth code
    #[error("handshake rejected: authentication failed (status {0:#04x})")]
    AuthenticationFailed(u8),

    /// The peer answered with something other than what the protocol requires
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// A bounded wait expired
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    /// `reconnect` called before `connect` stored credentials
    #[error("reconnect requested before connect() stored credentials")]
    NoCredentials,

    /// The packet router failed unexpectedly
    #[error("packet router crashed: {0}")]
    RouterCrashed(String),

    /// The link was closed while the operation was in flight
    #[error("connection closed")]
    Closed,
}

impl ConnectionError {
    /// Whether the handshake/reconnect path should try again after this error.
    ///
    /// Authentication failures and caller errors are final; network,
    /// decode, protocol and timeout failures are transient.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            ConnectionError::AuthenticationFailed(_)
                | ConnectionError::NoCredentials
                | ConnectionError::Encode(_)
        )
    }

    /// Short label used for metrics and logs
    pub fn kind(&self) -> &'static str {
        match self {
            ConnectionError::NotConnected { .. } => "not_connected",
            ConnectionError::Io(_) => "io",
            ConnectionError::Dial { .. } => "dial",
            ConnectionError::Decode(_) => "decode",
            ConnectionError::Encode(_) => "encode",
            ConnectionError::AuthenticationFailed(_) => "auth_failed",
            ConnectionError::Protocol(_) => "protocol",
            ConnectionError::Timeout(_) => "timeout",
            ConnectionError::NoCredentials => "no_credentials",
            ConnectionError::RouterCrashed(_) => "router_crashed",
            ConnectionError::Closed => "closed",
        }
    }
}
