//! Fragment-aware content view.
//!
//! The view is an arena of [`ViewItem`]s addressed by a monotonic index.
//! Payloads live in a [`ContentStore`]; readers hold independent cursors.

mod error;
mod item;
mod store;
mod view;

pub use error::ViewError;
pub use item::{ItemFlags, ViewEntry, ViewItem};
pub use store::{AllocationHandle, ContentStore, MemoryContentStore};
pub use view::{AppendOutcome, ContentView, Cursor, CursorKey, EvictedItem, ReadOutcome, ViewConfig};

/// Result type for view operations.
pub type ViewResult<T> = Result<T, ViewError>;
