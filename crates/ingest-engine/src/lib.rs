//! Ingestion engine core.
//!
//! Drives the control plane of each stream, buffers frames in a content view,
//! hands bytes to upload handles and applies fragment acks. Service calls go
//! out through [`ServiceCallbacks`](ingest_transport::ServiceCallbacks);
//! notifications are delivered on a bounded channel.

mod ack;
mod client;
mod control_plane;
mod error;
mod fsm;
mod metrics;
mod ordering;
mod platform;
mod session;
mod stream;

pub use ack::{AckOutcome, AckProcessor};
pub use client::IngestClient;
pub use control_plane::{call_outcome, termination_reentry, CallKind, CallOutcome, ResultClass};
pub use error::StreamError;
pub use fsm::{MachineState, StateDef, StateMachine, INFINITE_RETRY_COUNT_SENTINEL};
pub use metrics::MetricsCollector;
pub use ordering::FrameOrderCoordinator;
pub use platform::{ManualPlatform, Platform, SystemPlatform};
pub use session::{
    MAX_FINISHED_UPLOAD_HANDLES, MAX_LIVE_UPLOAD_HANDLES, MAX_TOKEN_EXPIRATION_JITTER,
    MIN_STREAMING_TOKEN_EXPIRATION_DURATION, STREAMING_TOKEN_EXPIRATION_GRACE_PERIOD,
};
pub use stream::{
    DataStatus, Stream, StreamData, UploadHandleInfo, STORAGE_PRESSURE_NOTIFICATION_THRESHOLD,
};

/// Result type for engine operations.
pub type StreamResult<T> = Result<T, StreamError>;
