//! View item types.

use bitflags::bitflags;
use bytes::Bytes;
use ingest_proto::{AckState, Timestamp};

use crate::store::AllocationHandle;

bitflags! {
    /// Per-item fragment bookkeeping.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ItemFlags: u32 {
        const FRAGMENT_START = 1 << 0;
        const FRAGMENT_END = 1 << 1;
        /// First item of an upload session.
        const STREAM_START = 1 << 2;
        /// Never handed to readers.
        const SKIP_ITEM = 1 << 3;
    }
}

/// Input to [`crate::ContentView::append`].
#[derive(Debug, Clone)]
pub struct ViewEntry {
    /// Encoded bytes owned by the store once appended.
    pub data: Bytes,

    /// Decoding timestamp.
    pub timestamp: Timestamp,

    /// Timestamp used to correlate acks.
    pub ack_timestamp: Timestamp,

    pub duration: Timestamp,

    pub track_id: u64,

    pub flags: ItemFlags,
}

/// One slot of the view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewItem {
    /// Monotonic, never reused.
    pub index: u64,

    pub allocation: AllocationHandle,

    /// Encoded length in bytes.
    pub length: usize,

    pub timestamp: Timestamp,

    pub ack_timestamp: Timestamp,

    pub duration: Timestamp,

    pub track_id: u64,

    pub flags: ItemFlags,

    pub ack_state: AckState,
}

impl ViewItem {
    pub fn is_fragment_start(&self) -> bool {
        self.flags.contains(ItemFlags::FRAGMENT_START)
    }

    pub fn is_fragment_end(&self) -> bool {
        self.flags.contains(ItemFlags::FRAGMENT_END)
    }

    pub fn is_skipped(&self) -> bool {
        self.flags.contains(ItemFlags::SKIP_ITEM)
    }

    /// Timestamp just past this item.
    pub fn end_timestamp(&self) -> Timestamp {
        self.ack_timestamp.saturating_add(self.duration)
    }
}
