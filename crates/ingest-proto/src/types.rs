//! Common value types shared by the view, the encoder and the engine.

use std::fmt;

use bitflags::bitflags;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::result::ServiceCallResult;

/// Timestamps and durations are expressed in 100ns units throughout the core.
pub type Timestamp = u64;

pub const HUNDREDS_OF_NANOS_IN_A_MILLISECOND: u64 = 10_000;
pub const HUNDREDS_OF_NANOS_IN_A_SECOND: u64 = 1_000 * HUNDREDS_OF_NANOS_IN_A_MILLISECOND;

bitflags! {
    /// Producer supplied frame flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct FrameFlags: u32 {
        const KEY_FRAME = 1 << 0;
        const DISCONTINUITY = 1 << 1;
        /// Pseudo frame closing the current fragment. Carries no payload.
        const END_OF_FRAGMENT = 1 << 2;
    }
}

/// An encoded frame handed to the core by the producer.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Caller assigned sequence number.
    pub index: u64,

    /// Track this frame belongs to.
    pub track_id: u64,

    pub flags: FrameFlags,

    /// Decoding timestamp in 100ns units.
    pub decoding_ts: Timestamp,

    /// Presentation timestamp in 100ns units.
    pub presentation_ts: Timestamp,

    /// Frame duration in 100ns units.
    pub duration: Timestamp,

    /// Encoded payload.
    pub payload: Bytes,
}

impl Frame {
    /// Create a new frame.
    pub fn new(
        index: u64,
        track_id: u64,
        flags: FrameFlags,
        decoding_ts: Timestamp,
        presentation_ts: Timestamp,
        duration: Timestamp,
        payload: Bytes,
    ) -> Self {
        Self {
            index,
            track_id,
            flags,
            decoding_ts,
            presentation_ts,
            duration,
            payload,
        }
    }

    /// Create an end-of-fragment pseudo frame for the given track.
    pub fn end_of_fragment(track_id: u64, timestamp: Timestamp) -> Self {
        Self {
            index: 0,
            track_id,
            flags: FrameFlags::END_OF_FRAGMENT,
            decoding_ts: timestamp,
            presentation_ts: timestamp,
            duration: 0,
            payload: Bytes::new(),
        }
    }

    pub fn is_key_frame(&self) -> bool {
        self.flags.contains(FrameFlags::KEY_FRAME)
    }

    pub fn is_end_of_fragment(&self) -> bool {
        self.flags.contains(FrameFlags::END_OF_FRAGMENT)
    }
}

/// Opaque identifier of one streaming session.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct UploadHandle(pub u64);

impl fmt::Display for UploadHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "upload-{}", self.0)
    }
}

/// Kind of a fragment acknowledgment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AckKind {
    Buffering,
    Received,
    Persisted,
    Error,
}

/// Acknowledgment state of a view item, ordered by progress.
///
/// A later state implicitly satisfies every earlier one.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum AckState {
    #[default]
    Unacked,
    Buffering,
    Received,
    Persisted,
    Error,
}

impl From<AckKind> for AckState {
    fn from(kind: AckKind) -> Self {
        match kind {
            AckKind::Buffering => Self::Buffering,
            AckKind::Received => Self::Received,
            AckKind::Persisted => Self::Persisted,
            AckKind::Error => Self::Error,
        }
    }
}

/// A fragment acknowledgment parsed from the upload response stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FragmentAck {
    pub kind: AckKind,

    /// Fragment timecode the ack refers to. Error acks may omit it.
    pub timestamp: Option<Timestamp>,

    /// Service result carried by error acks.
    pub result: ServiceCallResult,

    /// Service assigned fragment sequence number.
    pub sequence_number: Option<String>,
}

impl FragmentAck {
    fn with_kind(kind: AckKind, timestamp: Timestamp) -> Self {
        Self {
            kind,
            timestamp: Some(timestamp),
            result: ServiceCallResult::Ok,
            sequence_number: None,
        }
    }

    pub fn buffering(timestamp: Timestamp) -> Self {
        Self::with_kind(AckKind::Buffering, timestamp)
    }

    pub fn received(timestamp: Timestamp) -> Self {
        Self::with_kind(AckKind::Received, timestamp)
    }

    pub fn persisted(timestamp: Timestamp) -> Self {
        Self::with_kind(AckKind::Persisted, timestamp)
    }

    /// Create an error ack. `timestamp` may be absent for connection level errors.
    pub fn error(timestamp: Option<Timestamp>, result: ServiceCallResult) -> Self {
        Self {
            kind: AckKind::Error,
            timestamp,
            result,
            sequence_number: None,
        }
    }

    /// Attach a service sequence number.
    pub fn with_sequence_number(mut self, sequence_number: impl Into<String>) -> Self {
        self.sequence_number = Some(sequence_number.into());
        self
    }
}

/// Point-in-time stream metrics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamMetrics {
    /// Duration between the oldest un-sent item and the head.
    pub current_view_duration: Timestamp,

    /// Duration between the tail and the head of the view.
    pub overall_view_duration: Timestamp,

    /// Bytes not yet handed to any upload handle.
    pub current_view_size: u64,

    /// Bytes held by the content store.
    pub overall_view_size: u64,

    /// Frames per second accepted since the last snapshot.
    pub current_frame_rate: f64,

    /// Bytes per second handed to consumers since the last snapshot.
    pub current_transfer_rate: u64,

    /// Frames dropped by eviction or pressure policy.
    pub dropped_frames: u64,

    /// Whole fragments dropped by eviction.
    pub dropped_fragments: u64,

    /// Error acks received.
    pub error_acks: u64,

    /// Persisted acks received.
    pub persisted_acks: u64,

    /// Upload handles created since the stream started.
    pub upload_handles_created: u64,

    /// Upload handles currently alive.
    pub live_upload_handles: u32,
}

/// Aggregated metrics across every stream of a client.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientMetrics {
    pub stream_count: u32,
    pub content_store_size: u64,
    pub content_store_allocated: u64,
    pub total_dropped_frames: u64,
}
