//! Error types for the content view.

use ingest_proto::Timestamp;
use thiserror::Error;

use crate::store::AllocationHandle;
use crate::view::CursorKey;

/// Errors that can occur during view and store operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ViewError {
    /// The content store cannot fit the allocation.
    #[error("Content store out of memory: requested {requested} bytes, {available} available")]
    StoreOutOfMemory { requested: u64, available: u64 },

    /// The allocation is larger than the whole store.
    #[error("Item of {size} bytes can never fit a store of {capacity} bytes")]
    ItemTooLarge { size: u64, capacity: u64 },

    /// Unknown or already freed allocation.
    #[error("Invalid allocation handle: {0:?}")]
    InvalidAllocation(AllocationHandle),

    /// Index outside the live range.
    #[error("Content view item not found: index {0}")]
    ItemNotFound(u64),

    /// No such cursor.
    #[error("Cursor not found: {0:?}")]
    CursorNotFound(CursorKey),

    /// A cursor cannot be moved behind the oldest live item.
    #[error("Index {index} is behind the view tail {tail}")]
    CursorBehindTail { index: u64, tail: u64 },

    /// An ack refers to content outside the valid window.
    #[error("Ack timestamp {0} is not in the view window")]
    AckTimestampNotInViewWindow(Timestamp),

    /// Content must open with a fragment start.
    #[error("Item at index {0} does not belong to any fragment")]
    MissingFragmentStart(u64),

    /// A fragment end marker was appended to an already closed fragment.
    #[error("Fragment already ended before index {0}")]
    FragmentAlreadyEnded(u64),
}
