//! Error types for the transport module.

use thiserror::Error;

/// Errors that can occur when issuing service calls.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The transport refused the call.
    #[error("Call failed: {0}")]
    CallFailed(String),

    /// Streaming endpoint is not an absolute URL.
    #[error("Invalid streaming endpoint: {0}")]
    InvalidUrl(String),

    /// The outbound call queue is full.
    #[error("Call queue full")]
    QueueFull,

    /// Channel disconnected.
    #[error("Channel disconnected")]
    ChannelDisconnected,
}

impl From<url::ParseError> for TransportError {
    fn from(e: url::ParseError) -> Self {
        Self::InvalidUrl(e.to_string())
    }
}
