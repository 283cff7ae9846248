//! Typed configuration, events and result codes for the ingestion core.
//!
//! This crate defines the values that cross the boundary between the
//! producer/transport code owned by the caller and the engine core.

mod config;
mod events;
mod result;
mod state;
mod types;

pub use config::{
    ClientConfig, ConfigError, FrameOrderMode, StoragePressurePolicy, StreamConfig,
    StreamingType, TrackInfo, ViewOverflowPolicy,
};
pub use events::StreamEvent;
pub use result::{ServiceCallResult, StreamDescription, StreamStatus};
pub use state::{StateSet, StreamState};
pub use types::{
    AckKind, AckState, ClientMetrics, FragmentAck, Frame, FrameFlags, StreamMetrics, Timestamp,
    UploadHandle, HUNDREDS_OF_NANOS_IN_A_MILLISECOND, HUNDREDS_OF_NANOS_IN_A_SECOND,
};

use crossbeam_channel::{Receiver, Sender};

/// Channel capacity for notifications (core → caller).
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Creates a bounded notification channel.
pub fn event_channel() -> (Sender<StreamEvent>, Receiver<StreamEvent>) {
    crossbeam_channel::bounded(EVENT_CHANNEL_CAPACITY)
}
