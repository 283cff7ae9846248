//! Service call boundary for the ingestion core.
//!
//! The core performs no network I/O. Control-plane requests go out through
//! [`ServiceCallbacks`], which only has to accept the call; the response is
//! fed back into the stream through its `*_result` entry points using the
//! correlation id carried by the [`CallContext`].

mod callbacks;
mod connection;
mod error;

pub use callbacks::{
    AuthInfo, CallContext, ChannelServiceCallbacks, CreateStreamRequest, PutStreamRequest,
    ServiceCall, ServiceCallbacks, TagStreamRequest,
};
pub use connection::{parse_endpoint, UploadState};
pub use error::TransportError;

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// Channel capacity for queued service calls.
pub const SERVICE_CALL_CHANNEL_CAPACITY: usize = 30;

/// Maximum retries of a control-plane call before it fails the stream.
pub const SERVICE_CALL_MAX_RETRY_COUNT: u32 = 5;

/// Timeout handed to the transport with every call, in 100ns units.
pub const SERVICE_CALL_DEFAULT_TIMEOUT: u64 = 5 * ingest_proto::HUNDREDS_OF_NANOS_IN_A_SECOND;
