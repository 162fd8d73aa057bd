//! Error types for transports, framing and the LGW codec.
//!
//! Errors never cross the per-command boundary: [`crate::session::Session::send`]
//! folds every [`EngineError`] into a failed
//! [`ResponseEnvelope`](crate::session::ResponseEnvelope) using
//! [`EngineError::error_code`].

use thiserror::Error;

use crate::session::ErrorCode;

/// Errors that can occur while talking to a device.
#[derive(Error, Debug)]
pub enum EngineError {
    /// The host could not be reached or refused the session.
    ///
    /// Fatal for the whole command sequence of that host.
    #[error("cannot connect to {addr}: {reason}")]
    Connect { addr: String, reason: String },

    /// The delimiter was not observed within the read window.
    ///
    /// `partial` holds whatever arrived before the window closed.
    #[error("timeout waiting for delimiter ({} bytes received)", partial.len())]
    Timeout { partial: Vec<u8> },

    /// Data arrived but did not match the protocol expectation.
    #[error("protocol mismatch: {0}")]
    ProtocolMismatch(String),

    /// No connection handle is held.
    #[error("not connected")]
    NotConnected,

    /// The remote side closed the stream while a read was pending.
    #[error("channel disconnect on read")]
    ChannelDisconnect,

    #[error("invalid mac address: {0}")]
    InvalidMac(String),

    #[error("invalid target id: {0}")]
    InvalidTargetId(String),

    /// An LGW frame failed strict decoding.
    #[error("invalid lgw frame: {0}")]
    InvalidFrame(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// An error occurred in the async-ssh2-tokio library.
    #[error("async ssh2 error: {0}")]
    Ssh2Error(#[from] async_ssh2_tokio::Error),

    /// An error occurred in the russh library.
    #[error("russh error: {0}")]
    RusshError(#[from] russh::Error),
}

impl EngineError {
    /// Maps the error onto the response error-code taxonomy.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            EngineError::Timeout { partial } if partial.is_empty() => ErrorCode::NoData,
            EngineError::Timeout { .. }
            | EngineError::ProtocolMismatch(_)
            | EngineError::InvalidFrame(_) => ErrorCode::ExpectMissing,
            EngineError::Connect { .. } => ErrorCode::CannotConnect,
            _ => ErrorCode::Unexpected,
        }
    }
}
