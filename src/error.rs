//! Error types
//!
//! Only failures the caller can act on surface here: bind and connect
//! timeouts, request timeouts and rejections, and transport I/O. Unknown
//! channels, late replies and malformed frames are logged and absorbed by the
//! layer that notices them.

use std::time::Duration;

use crate::client::IpcBusEvent;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Transport I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Wire-level problem
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// A request did not complete successfully
    #[error("Request error: {0}")]
    Request(#[from] RequestError),

    /// Bus address could not be parsed
    #[error("Invalid bus address: '{0}'")]
    InvalidAddress(String),

    /// Broker did not start listening in time
    #[error("Broker did not start listening within {0:?}")]
    ListenTimeout(Duration),

    /// Client could not reach the broker in time
    #[error("Could not connect to broker within {0:?}")]
    ConnectTimeout(Duration),

    /// Client has been closed or lost its broker connection
    #[error("Client is not connected")]
    NotConnected,

    /// Broker connection dropped while waiting for a reply
    #[error("Connection closed")]
    ConnectionClosed,
}

/// Wire-level errors
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// A reply payload did not have the expected shape
    #[error("Invalid payload: {0}")]
    InvalidPayload(#[source] serde_json::Error),

    /// Address kind not available on this platform
    #[error("Unsupported address on this platform: {0}")]
    UnsupportedAddress(String),
}

/// Request/reply failures
#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    /// No reply arrived before the deadline
    #[error("Request on '{channel}' timed out after {timeout:?}")]
    Timeout {
        /// Channel the request was sent on
        channel: String,
        /// Deadline that elapsed
        timeout: Duration,
    },

    /// The responder rejected the request
    #[error("Request on '{}' rejected by {}: {reason}", .event.channel, .event.sender.peer_name)]
    Rejected {
        /// Reply envelope, channel set back to the request channel
        event: IpcBusEvent,
        /// Rejection reason supplied by the responder
        reason: String,
    },
}

impl Error {
    /// Whether this error is a request timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Request(RequestError::Timeout { .. }))
    }

    /// Whether this error is a request rejection
    pub fn is_rejected(&self) -> bool {
        matches!(self, Error::Request(RequestError::Rejected { .. }))
    }
}
