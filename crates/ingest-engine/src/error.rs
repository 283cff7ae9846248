//! Error types for the engine.

use thiserror::Error;

use ingest_encoder::EncoderError;
use ingest_proto::{ConfigError, ServiceCallResult, StreamState, Timestamp, UploadHandle};
use ingest_transport::TransportError;
use ingest_view::ViewError;

/// Errors returned by stream and client operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StreamError {
    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Content view or store error.
    #[error("Content view error: {0}")]
    View(#[from] ViewError),

    /// Frame packaging error.
    #[error("Encoder error: {0}")]
    Encoder(#[from] EncoderError),

    /// The transport refused a call.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Unknown or retired upload handle.
    #[error("Invalid upload handle: {0}")]
    InvalidUploadHandle(UploadHandle),

    /// Frame references a track the stream does not carry.
    #[error("Invalid track id: {0}")]
    InvalidTrack(u64),

    /// The target state does not accept the current one.
    #[error("Invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    /// Operation not allowed in the current state.
    #[error("Operation not allowed in state {0}")]
    NotAcceptedInState(StreamState),

    /// Result does not match the call in flight.
    #[error("No call in flight with correlation id {0}")]
    UnexpectedCorrelationId(u64),

    /// Put before the stream is ready while nothing would be retained remotely.
    #[error("Offline stream with zero retention cannot buffer before it is ready")]
    OfflineModeWithZeroRetention,

    /// Token lifetime below the allowed minimum.
    #[error("Token expiration {expiration} is too close to now ({now})")]
    InvalidTokenExpiration { expiration: Timestamp, now: Timestamp },

    /// Streaming endpoint is unusable.
    #[error("Invalid streaming endpoint: {0}")]
    InvalidStreamingEndpoint(String),

    /// Client stream limit reached.
    #[error("Maximum stream count of {0} reached")]
    MaxStreamCount(usize),

    /// A stream with this name is already registered.
    #[error("Duplicate stream name: {0}")]
    DuplicateStreamName(String),

    /// No stream with this name.
    #[error("Stream not found: {0}")]
    StreamNotFound(String),

    /// Too many fragment metadata entries pending.
    #[error("Maximum fragment metadata count of {0} reached")]
    MaxFragmentMetadataCount(usize),

    /// Two end-of-fragment markers in a row.
    #[error("Multiple consecutive end-of-fragment markers")]
    MultipleConsecutiveEofr,

    /// A fragment closed by a marker must restart on a key frame.
    #[error("Frame after an end-of-fragment marker must be a key frame")]
    KeyFrameRequiredAfterEofr,

    /// Decoding timestamps went backwards within a track.
    #[error("Track {track_id} timestamp {current} is before {previous}")]
    TimestampNotMonotonic {
        track_id: u64,
        previous: Timestamp,
        current: Timestamp,
    },

    /// An error ack arrived for a handle that already failed.
    #[error("Duplicate error ack for {0}")]
    DuplicateErrorAck(UploadHandle),

    /// Rollback would need content older than the replay window.
    #[error("Rollback to {requested} is outside the replay window starting at {oldest}")]
    RollbackOutsideReplayWindow { requested: Timestamp, oldest: Timestamp },

    /// The handle's unread content was evicted.
    #[error("Upload handle {0} aborted")]
    UploadHandleAborted(UploadHandle),

    /// The handle was terminated and the stream does not recover.
    #[error("Upload handle {handle} terminated with {result:?}")]
    UploadHandleTerminated {
        handle: UploadHandle,
        result: ServiceCallResult,
    },

    /// A control-plane call failed for good.
    #[error("{phase} call failed with {result:?}")]
    CallFailed {
        phase: StreamState,
        result: ServiceCallResult,
    },

    /// Token refused by the service.
    #[error("Stream authorization failed")]
    StreamAuthFailed,

    /// The remote stream is being deleted.
    #[error("Stream is being deleted")]
    StreamIsBeingDeleted,

    /// Handles did not drain within the stop timeout.
    #[error("Stream stop timed out")]
    StopStreamTimeout,

    /// A producer blocked on storage pressure for too long.
    #[error("Blocked put timed out")]
    BlockedPutTimeout,

    /// The stream is stopping and accepts no more frames.
    #[error("Stream is stopping")]
    StreamStopped,

    /// The stream was freed or failed.
    #[error("Stream terminated")]
    StreamTerminated,
}

impl StreamError {
    /// Whether the stream can carry on after this error.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::CallFailed { result, .. } => result.is_retryable(),
            Self::Transport(TransportError::QueueFull) => true,
            Self::View(ViewError::StoreOutOfMemory { .. }) => true,
            Self::UploadHandleAborted(_) | Self::BlockedPutTimeout => true,
            _ => false,
        }
    }

    /// Result code reported with a stream error notification.
    pub fn service_call_result(&self) -> ServiceCallResult {
        match self {
            Self::CallFailed { result, .. } | Self::UploadHandleTerminated { result, .. } => {
                *result
            }
            Self::StreamAuthFailed => ServiceCallResult::NotAuthorized,
            Self::StreamIsBeingDeleted => ServiceCallResult::ResourceDeleted,
            _ => ServiceCallResult::Unknown,
        }
    }
}
