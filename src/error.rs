//! Error types and result definitions for the orvibo crate.
//! Protocol failures are reported per exchange kind; malformed datagrams are
//! never surfaced here, they are filtered out by the frame codec.

use std::net::SocketAddr;
use thiserror::Error;

/// Represents all possible errors that can occur when talking to a plug.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OrviboError {
    /// Standard IO error (socket send/receive)
    #[error("IO error: {0}")]
    Io(String),

    /// Configuration could not be parsed
    #[error("JSON error: {0}")]
    Json(String),

    /// The protocol port could not be bound
    #[error("Failed to bind {addr}: {reason}")]
    Bind { addr: SocketAddr, reason: String },

    /// A host name did not resolve to an address
    #[error("Could not resolve host '{0}'")]
    Resolve(String),

    /// A MAC address string was not 6 hex-encoded bytes
    #[error("Invalid MAC address '{0}'")]
    InvalidMac(String),

    /// MAC discovery got no answer within the retry budget
    #[error("Couldn't discover {0}")]
    Discovery(String),

    /// No valid subscribe response within the retry budget; state is unknown
    #[error("No status could be found for {0}")]
    Subscription(String),

    /// No matching acknowledgement within the retry budget; state change unconfirmed
    #[error("Device didn't acknowledge control request: {0}")]
    ControlAck(String),

    /// The transport has shut down
    #[error("Transport closed")]
    Closed,
}

/// A specialized Result type for plug operations.
pub type Result<T> = std::result::Result<T, OrviboError>;

impl From<std::io::Error> for OrviboError {
    fn from(err: std::io::Error) -> Self {
        OrviboError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for OrviboError {
    fn from(err: serde_json::Error) -> Self {
        OrviboError::Json(err.to_string())
    }
}

impl OrviboError {
    /// Whether repeating the whole operation can succeed.
    ///
    /// Subscribe and control exchanges are idempotent, so callers may simply
    /// retry them. A failed discovery means the session was never built and
    /// has to be opened again; setup errors need operator attention.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            OrviboError::Io(_) | OrviboError::Subscription(_) | OrviboError::ControlAck(_)
        )
    }
}
