//! Backing storage for view payloads.

use std::collections::HashMap;

use bytes::Bytes;
use tracing::trace;

use crate::error::ViewError;
use crate::ViewResult;

/// Handle to a payload held by a [`ContentStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AllocationHandle(pub u64);

/// Byte storage for encoded frames.
///
/// Implementations may spill to disk; the view only needs put/get/free and
/// the byte accounting.
pub trait ContentStore: Send {
    /// Store a payload. Fails when the payload does not fit.
    fn put(&mut self, data: Bytes) -> ViewResult<AllocationHandle>;

    /// Fetch a payload.
    fn get(&self, handle: AllocationHandle) -> ViewResult<Bytes>;

    /// Release a payload.
    fn free(&mut self, handle: AllocationHandle) -> ViewResult<()>;

    /// Total bytes the store may hold.
    fn capacity(&self) -> u64;

    /// Bytes currently held.
    fn allocated(&self) -> u64;

    /// Bytes still available.
    fn available(&self) -> u64 {
        self.capacity().saturating_sub(self.allocated())
    }
}

/// Heap backed content store with a fixed byte budget.
#[derive(Debug)]
pub struct MemoryContentStore {
    capacity: u64,
    allocated: u64,
    next_handle: u64,
    payloads: HashMap<u64, Bytes>,
}

impl MemoryContentStore {
    /// Create a store holding at most `capacity` bytes.
    pub fn new(capacity: u64) -> Self {
        Self {
            capacity,
            allocated: 0,
            next_handle: 1,
            payloads: HashMap::new(),
        }
    }

    /// Number of live payloads.
    pub fn len(&self) -> usize {
        self.payloads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payloads.is_empty()
    }
}

impl ContentStore for MemoryContentStore {
    fn put(&mut self, data: Bytes) -> ViewResult<AllocationHandle> {
        let size = data.len() as u64;
        if size > self.capacity {
            return Err(ViewError::ItemTooLarge {
                size,
                capacity: self.capacity,
            });
        }

        if size > self.available() {
            return Err(ViewError::StoreOutOfMemory {
                requested: size,
                available: self.available(),
            });
        }

        let handle = self.next_handle;
        self.next_handle += 1;
        self.allocated += size;
        self.payloads.insert(handle, data);

        trace!(handle, size, allocated = self.allocated, "Stored payload");
        Ok(AllocationHandle(handle))
    }

    fn get(&self, handle: AllocationHandle) -> ViewResult<Bytes> {
        self.payloads
            .get(&handle.0)
            .cloned()
            .ok_or(ViewError::InvalidAllocation(handle))
    }

    fn free(&mut self, handle: AllocationHandle) -> ViewResult<()> {
        let data = self
            .payloads
            .remove(&handle.0)
            .ok_or(ViewError::InvalidAllocation(handle))?;
        self.allocated -= data.len() as u64;
        Ok(())
    }

    fn capacity(&self) -> u64 {
        self.capacity
    }

    fn allocated(&self) -> u64 {
        self.allocated
    }
}
