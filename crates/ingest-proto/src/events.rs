//! Notifications emitted by the core.

use serde::{Deserialize, Serialize};

use crate::result::ServiceCallResult;
use crate::state::StreamState;
use crate::types::{FragmentAck, Timestamp, UploadHandle};

/// Best-effort notifications. They are queued while the stream lock is held
/// and consumed by the caller on its own thread.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StreamEvent {
    /// Control-plane state has changed.
    StateChanged {
        stream: String,
        previous: StreamState,
        current: StreamState,
    },

    /// The stream has a token and endpoint and can upload.
    StreamReady { stream: String },

    /// The stream fully drained after a stop. Emitted exactly once.
    StreamClosed { stream: String },

    /// New bytes are available for an upload handle.
    DataAvailable {
        stream: String,
        upload_handle: UploadHandle,
        duration_available: Timestamp,
        bytes_available: u64,
    },

    /// Free content store space fell below the notification threshold.
    StoragePressure { stream: String, remaining_bytes: u64 },

    /// Un-sent buffer duration exceeded the configured latency.
    LatencyPressure {
        stream: String,
        buffer_duration: Timestamp,
    },

    /// No buffering ack arrived within the staleness window.
    ConnectionStale {
        stream: String,
        since_last_buffering_ack: Timestamp,
    },

    /// A frame was dropped before it could be uploaded.
    DroppedFrame { stream: String, timestamp: Timestamp },

    /// A whole fragment was evicted.
    DroppedFragment { stream: String, timestamp: Timestamp },

    /// An ack was applied.
    FragmentAcked {
        stream: String,
        upload_handle: UploadHandle,
        ack: FragmentAck,
    },

    /// An error occurred.
    StreamError {
        stream: String,
        upload_handle: Option<UploadHandle>,
        result: ServiceCallResult,
        message: String,
        recoverable: bool,
    },
}

impl StreamEvent {
    /// Name of the stream the event belongs to.
    pub fn stream(&self) -> &str {
        match self {
            Self::StateChanged { stream, .. }
            | Self::StreamReady { stream }
            | Self::StreamClosed { stream }
            | Self::DataAvailable { stream, .. }
            | Self::StoragePressure { stream, .. }
            | Self::LatencyPressure { stream, .. }
            | Self::ConnectionStale { stream, .. }
            | Self::DroppedFrame { stream, .. }
            | Self::DroppedFragment { stream, .. }
            | Self::FragmentAcked { stream, .. }
            | Self::StreamError { stream, .. } => stream,
        }
    }
}
