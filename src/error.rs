//! Typed errors for the transport and the control protocol

use thiserror::Error;

/// Errors surfaced by [`crate::transport::Transport`] to its callers.
///
/// Socket errors never show up here: they are recovered by reconnecting.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The configured endpoint could not be resolved. Fatal at startup.
    #[error("failed to resolve {endpoint}: {reason}")]
    Resolve { endpoint: String, reason: String },

    /// A queue capacity is configured and has been reached.
    #[error("outbound queue full ({0} items)")]
    QueueFull(usize),

    #[error("transport closed")]
    Closed,

    #[error("failed to start transport thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Errors produced while framing, decoding or validating control messages.
///
/// Handlers convert these into negative acknowledgments; they never escape
/// the dispatcher.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid frame: {0}")]
    Frame(String),

    #[error("malformed message: {0}")]
    Json(#[from] serde_json::Error),

    #[error("missing field {0:?}")]
    MissingField(&'static str),

    #[error("invalid field {field:?}: {reason}")]
    InvalidField { field: &'static str, reason: String },

    #[error("field {field:?} out of range: {value}")]
    OutOfRange { field: &'static str, value: f64 },

    #[error("firmware version {0} is already installed")]
    SameVersion(String),
}
