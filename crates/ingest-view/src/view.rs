//! The content view ring.

use std::collections::{HashMap, VecDeque};
use std::ops::Range;

use bytes::Bytes;
use tracing::{debug, trace, warn};

use ingest_proto::{
    AckState, StoragePressurePolicy, StreamConfig, Timestamp, UploadHandle, ViewOverflowPolicy,
};

use crate::error::ViewError;
use crate::item::{ItemFlags, ViewEntry, ViewItem};
use crate::store::{AllocationHandle, ContentStore};
use crate::ViewResult;

/// Identifies a read cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CursorKey {
    /// Start point of the next upload handle.
    Pending,

    /// Cursor owned by a live upload handle.
    Handle(UploadHandle),
}

/// Read position: item index plus byte offset into that item.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Cursor {
    pub index: u64,
    pub offset: usize,

    /// Set when eviction moved the cursor forward over unread content.
    pub overrun: bool,
}

/// View sizing and eviction policy.
#[derive(Debug, Clone)]
pub struct ViewConfig {
    /// Maximum number of live items.
    pub capacity: usize,

    /// Maximum duration between the tail and the newest item.
    pub buffer_duration: Timestamp,

    pub overflow_policy: ViewOverflowPolicy,

    pub storage_policy: StoragePressurePolicy,
}

impl ViewConfig {
    pub fn from_stream_config(config: &StreamConfig) -> Self {
        Self {
            capacity: config.view_capacity(),
            buffer_duration: config.buffer_duration(),
            overflow_policy: config.view_overflow_policy,
            storage_policy: config.storage_pressure_policy,
        }
    }
}

/// An item removed from the tail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvictedItem {
    pub index: u64,
    pub timestamp: Timestamp,
    pub ack_timestamp: Timestamp,
    pub flags: ItemFlags,
    pub ack_state: AckState,

    /// Whether every cursor had already read past the item.
    pub delivered: bool,
}

/// Result of a successful append.
#[derive(Debug, Clone, Default)]
pub struct AppendOutcome {
    /// Index assigned to the new item.
    pub index: u64,

    /// Items evicted to make room, oldest first.
    pub evicted: Vec<EvictedItem>,

    /// Cursors moved forward by the eviction.
    pub overrun: Vec<CursorKey>,
}

/// Result of a read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadOutcome {
    /// Bytes written into the caller buffer.
    pub filled: usize,

    /// The cursor reached the requested limit or the head.
    pub exhausted: bool,
}

/// Ordered, fragment-aware arena of frame records.
pub struct ContentView {
    config: ViewConfig,
    store: Box<dyn ContentStore>,
    items: VecDeque<ViewItem>,
    head: u64,
    cursors: HashMap<CursorKey, Cursor>,
    fragment_open: bool,
    open_fragment_start: Option<u64>,
    open_fragment_orphaned: bool,
}

impl ContentView {
    /// Create an empty view over the given store.
    pub fn new(config: ViewConfig, store: Box<dyn ContentStore>) -> Self {
        debug!(
            capacity = config.capacity,
            store_bytes = store.capacity(),
            "Creating content view"
        );

        Self {
            config,
            store,
            items: VecDeque::new(),
            head: 0,
            cursors: HashMap::new(),
            fragment_open: false,
            open_fragment_start: None,
            open_fragment_orphaned: false,
        }
    }

    /// Append an item, evicting per policy when needed.
    pub fn append(&mut self, entry: ViewEntry) -> ViewResult<AppendOutcome> {
        let starts = entry.flags.contains(ItemFlags::FRAGMENT_START);
        if !starts && !self.fragment_open {
            if entry.flags.contains(ItemFlags::FRAGMENT_END) && self.head > 0 {
                return Err(ViewError::FragmentAlreadyEnded(self.head));
            }
            return Err(ViewError::MissingFragmentStart(self.head));
        }

        let mut evicted = Vec::new();
        let allocation = self.allocate(entry.data.clone(), &mut evicted)?;

        while self.items.len() >= self.config.capacity && !self.items.is_empty() {
            self.evict_unit(&mut evicted);
        }

        while let Some(front) = self.items.front() {
            if entry.timestamp > front.timestamp.saturating_add(self.config.buffer_duration) {
                self.evict_unit(&mut evicted);
            } else {
                break;
            }
        }

        let index = self.head;
        let mut flags = entry.flags;

        if starts {
            if self.fragment_open {
                if let Some(previous) = self.items.back_mut() {
                    previous.flags |= ItemFlags::FRAGMENT_END;
                }
            }
            self.fragment_open = true;
            self.open_fragment_start = Some(index);
            self.open_fragment_orphaned = false;
        } else if self.open_fragment_orphaned {
            flags |= ItemFlags::SKIP_ITEM;
        }

        if flags.contains(ItemFlags::FRAGMENT_END) {
            self.fragment_open = false;
        }

        self.items.push_back(ViewItem {
            index,
            allocation,
            length: entry.data.len(),
            timestamp: entry.timestamp,
            ack_timestamp: entry.ack_timestamp,
            duration: entry.duration,
            track_id: entry.track_id,
            flags,
            ack_state: AckState::Unacked,
        });
        self.head += 1;

        let overrun = self.advance_overrun_cursors();

        trace!(index, length = entry.data.len(), ?flags, "Appended view item");

        Ok(AppendOutcome {
            index,
            evicted,
            overrun,
        })
    }

    fn allocate(
        &mut self,
        data: Bytes,
        evicted: &mut Vec<EvictedItem>,
    ) -> ViewResult<AllocationHandle> {
        match self.store.put(data.clone()) {
            Ok(handle) => Ok(handle),
            Err(ViewError::StoreOutOfMemory { requested, .. })
                if self.config.storage_policy == StoragePressurePolicy::DropTail =>
            {
                while self.store.available() < requested && !self.items.is_empty() {
                    self.evict_unit(evicted);
                }
                self.store.put(data)
            }
            Err(e) => Err(e),
        }
    }

    /// Evict one unit according to the overflow policy.
    fn evict_unit(&mut self, evicted: &mut Vec<EvictedItem>) {
        match self.config.overflow_policy {
            ViewOverflowPolicy::DropTailViewItem => {
                let was_start = self
                    .items
                    .front()
                    .map(|item| item.is_fragment_start())
                    .unwrap_or(false);
                self.evict_front(evicted);

                if was_start {
                    // The rest of that fragment can no longer be decoded.
                    for item in self.items.iter_mut() {
                        if item.is_fragment_start() {
                            break;
                        }
                        item.flags |= ItemFlags::SKIP_ITEM;
                    }
                }
            }
            ViewOverflowPolicy::DropUntilFragmentStart => {
                self.evict_front(evicted);
                while self
                    .items
                    .front()
                    .map(|item| !item.is_fragment_start())
                    .unwrap_or(false)
                {
                    self.evict_front(evicted);
                }
            }
        }
    }

    fn evict_front(&mut self, evicted: &mut Vec<EvictedItem>) {
        let min_cursor = self.min_cursor_index();
        let Some(item) = self.items.pop_front() else {
            return;
        };

        if let Err(e) = self.store.free(item.allocation) {
            warn!(index = item.index, "Failed to free evicted item: {}", e);
        }

        if self.open_fragment_start == Some(item.index) {
            self.open_fragment_orphaned = true;
        }

        trace!(index = item.index, "Evicted view item");

        evicted.push(EvictedItem {
            index: item.index,
            timestamp: item.timestamp,
            ack_timestamp: item.ack_timestamp,
            flags: item.flags,
            ack_state: item.ack_state,
            delivered: min_cursor.map(|min| item.index < min).unwrap_or(false),
        });
    }

    fn advance_overrun_cursors(&mut self) -> Vec<CursorKey> {
        let tail = self.tail_index();
        let mut overrun = Vec::new();

        for (key, cursor) in self.cursors.iter_mut() {
            if cursor.index < tail {
                debug!(?key, from = cursor.index, to = tail, "Cursor overrun by eviction");
                cursor.index = tail;
                cursor.offset = 0;
                cursor.overrun = true;
                overrun.push(*key);
            }
        }

        overrun
    }

    /// Release items before `upto`, never passing any cursor.
    ///
    /// Returns the number of items released.
    pub fn trim_tail(&mut self, upto: u64) -> usize {
        let limit = self
            .min_cursor_index()
            .map(|min| min.min(upto))
            .unwrap_or(upto);

        let mut released = 0;
        while let Some(front) = self.items.front() {
            if front.index >= limit {
                break;
            }
            let item = self.items.pop_front();
            if let Some(item) = item {
                if let Err(e) = self.store.free(item.allocation) {
                    warn!(index = item.index, "Failed to free trimmed item: {}", e);
                }
                if self.open_fragment_start == Some(item.index) {
                    self.open_fragment_orphaned = true;
                }
            }
            released += 1;
        }

        if released > 0 {
            trace!(released, tail = self.tail_index(), "Trimmed view tail");
        }
        released
    }

    /// Release every item and cursor.
    pub fn remove_all(&mut self) {
        while let Some(item) = self.items.pop_front() {
            let _ = self.store.free(item.allocation);
        }
        self.cursors.clear();
        self.fragment_open = false;
        self.open_fragment_start = None;
        self.open_fragment_orphaned = false;
    }

    /// Copy bytes at the cursor into `buf`, stopping at `limit` (exclusive index) or the head.
    pub fn read(
        &mut self,
        key: CursorKey,
        buf: &mut [u8],
        limit: Option<u64>,
    ) -> ViewResult<ReadOutcome> {
        let mut cursor = self.cursor(key)?;
        let end = limit.map_or(self.head, |limit| limit.min(self.head));
        let mut filled = 0;

        while filled < buf.len() && cursor.index < end {
            let item = self.item_at(cursor.index)?;
            if item.is_skipped() || cursor.offset >= item.length {
                cursor.index += 1;
                cursor.offset = 0;
                continue;
            }

            let data = self.store.get(item.allocation)?;
            let count = (buf.len() - filled).min(item.length - cursor.offset);
            buf[filled..filled + count]
                .copy_from_slice(&data[cursor.offset..cursor.offset + count]);
            filled += count;
            cursor.offset += count;

            if cursor.offset == item.length {
                cursor.index += 1;
                cursor.offset = 0;
            }
        }

        // Step over trailing empty or skipped items so exhaustion is reported promptly.
        while cursor.index < end {
            let item = self.item_at(cursor.index)?;
            if item.is_skipped() || item.length == 0 {
                cursor.index += 1;
                cursor.offset = 0;
            } else {
                break;
            }
        }

        self.cursors.insert(key, cursor);

        Ok(ReadOutcome {
            filled,
            exhausted: cursor.index >= end,
        })
    }

    // --- Cursors ---------------------------------------------------------

    /// Register a cursor at `index`.
    pub fn add_cursor(&mut self, key: CursorKey, index: u64) -> ViewResult<()> {
        self.check_cursor_index(index)?;
        self.cursors.insert(
            key,
            Cursor {
                index,
                offset: 0,
                overrun: false,
            },
        );
        Ok(())
    }

    pub fn remove_cursor(&mut self, key: CursorKey) -> Option<Cursor> {
        self.cursors.remove(&key)
    }

    pub fn cursor(&self, key: CursorKey) -> ViewResult<Cursor> {
        self.cursors
            .get(&key)
            .copied()
            .ok_or(ViewError::CursorNotFound(key))
    }

    /// Current item index of a cursor.
    pub fn current_index(&self, key: CursorKey) -> ViewResult<u64> {
        self.cursor(key).map(|cursor| cursor.index)
    }

    /// Position a cursor at the start of `index`.
    pub fn set_current_index(&mut self, key: CursorKey, index: u64) -> ViewResult<()> {
        self.check_cursor_index(index)?;
        let cursor = self
            .cursors
            .get_mut(&key)
            .ok_or(ViewError::CursorNotFound(key))?;
        cursor.index = index;
        cursor.offset = 0;
        cursor.overrun = false;
        Ok(())
    }

    /// Reposition a cursor for recovery.
    ///
    /// Lands on the oldest live fragment start at or after `index`, or the
    /// head when no such fragment exists. Returns the new index.
    pub fn rollback_current_index(&mut self, key: CursorKey, index: u64) -> ViewResult<u64> {
        let requested = index.max(self.tail_index());
        let target = self
            .fragment_start_at_or_after(requested)
            .unwrap_or(self.head);
        let cursor = self
            .cursors
            .get_mut(&key)
            .ok_or(ViewError::CursorNotFound(key))?;

        debug!(?key, from = cursor.index, to = target, "Rolling back cursor");
        cursor.index = target;
        cursor.offset = 0;
        cursor.overrun = false;
        Ok(target)
    }

    fn check_cursor_index(&self, index: u64) -> ViewResult<()> {
        let tail = self.tail_index();
        if index < tail {
            return Err(ViewError::CursorBehindTail { index, tail });
        }
        if index > self.head {
            return Err(ViewError::ItemNotFound(index));
        }
        Ok(())
    }

    /// Oldest index still referenced by any cursor.
    pub fn min_cursor_index(&self) -> Option<u64> {
        self.cursors.values().map(|cursor| cursor.index).min()
    }

    // --- Lookup ----------------------------------------------------------

    /// Index of the oldest live item (equals the head when empty).
    pub fn tail_index(&self) -> u64 {
        self.items.front().map(|item| item.index).unwrap_or(self.head)
    }

    /// Index the next appended item will receive.
    pub fn head_index(&self) -> u64 {
        self.head
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn item_at(&self, index: u64) -> ViewResult<&ViewItem> {
        let tail = self.tail_index();
        if index < tail || index >= self.head {
            return Err(ViewError::ItemNotFound(index));
        }
        self.items
            .get((index - tail) as usize)
            .ok_or(ViewError::ItemNotFound(index))
    }

    pub fn item_at_mut(&mut self, index: u64) -> ViewResult<&mut ViewItem> {
        let tail = self.tail_index();
        if index < tail || index >= self.head {
            return Err(ViewError::ItemNotFound(index));
        }
        self.items
            .get_mut((index - tail) as usize)
            .ok_or(ViewError::ItemNotFound(index))
    }

    /// Newest live item.
    pub fn last_item(&self) -> Option<&ViewItem> {
        self.items.back()
    }

    /// Payload of a live item.
    pub fn payload(&self, index: u64) -> ViewResult<Bytes> {
        let item = self.item_at(index)?;
        self.store.get(item.allocation)
    }

    /// Oldest fragment start at or after `index`.
    pub fn fragment_start_at_or_after(&self, index: u64) -> Option<u64> {
        let from = index.max(self.tail_index());
        self.items
            .iter()
            .skip((from - self.tail_index()) as usize)
            .find(|item| item.is_fragment_start())
            .map(|item| item.index)
    }

    /// Newest fragment start at or before `index`.
    pub fn fragment_start_at_or_before(&self, index: u64) -> Option<u64> {
        if index < self.tail_index() || self.items.is_empty() {
            return None;
        }
        let last = index.min(self.head - 1);
        let take = (last - self.tail_index() + 1) as usize;
        self.items
            .iter()
            .take(take)
            .rev()
            .find(|item| item.is_fragment_start())
            .map(|item| item.index)
    }

    /// Exclusive end index of the fragment starting at `start`.
    pub fn fragment_end(&self, start: u64) -> u64 {
        self.fragment_start_at_or_after(start + 1)
            .unwrap_or(self.head)
    }

    /// Fragment starts in `window`, oldest first.
    pub fn fragment_starts(&self, window: Range<u64>) -> Vec<u64> {
        let tail = self.tail_index();
        let from = window.start.max(tail);
        let to = window.end.min(self.head);
        if from >= to {
            return Vec::new();
        }
        self.items
            .iter()
            .skip((from - tail) as usize)
            .take((to - from) as usize)
            .filter(|item| item.is_fragment_start())
            .map(|item| item.index)
            .collect()
    }

    /// Find the fragment start whose content covers `ack_timestamp`, within `window`.
    pub fn fragment_for_timestamp(
        &self,
        ack_timestamp: Timestamp,
        window: Range<u64>,
    ) -> ViewResult<u64> {
        let starts = self.fragment_starts(window.clone());
        let mut found = None;
        for start in starts {
            let item = self.item_at(start)?;
            if item.ack_timestamp <= ack_timestamp {
                found = Some(start);
            } else {
                break;
            }
        }

        let start = found.ok_or(ViewError::AckTimestampNotInViewWindow(ack_timestamp))?;
        let end = self.fragment_end(start).min(window.end.min(self.head));
        let last = self.item_at(end.saturating_sub(1).max(start))?;

        if ack_timestamp > last.end_timestamp() {
            return Err(ViewError::AckTimestampNotInViewWindow(ack_timestamp));
        }

        Ok(start)
    }

    // --- Ack state -------------------------------------------------------

    /// Apply an ack state to every item of the fragment starting at `start`.
    ///
    /// States only move forward; a persisted item stays persisted.
    pub fn apply_fragment_ack_state(&mut self, start: u64, state: AckState) -> ViewResult<()> {
        let end = self.fragment_end(start);
        for index in start..end {
            let item = self.item_at_mut(index)?;
            if item.ack_state != AckState::Persisted && state > item.ack_state {
                item.ack_state = state;
            }
        }
        Ok(())
    }

    /// Ack state of the fragment starting at `start`.
    pub fn fragment_ack_state(&self, start: u64) -> ViewResult<AckState> {
        self.item_at(start).map(|item| item.ack_state)
    }

    /// Clear non-persisted ack states from `from` onwards so content can be re-acked.
    pub fn reset_ack_state(&mut self, from: u64) {
        let tail = self.tail_index();
        let skip = from.saturating_sub(tail) as usize;
        for item in self.items.iter_mut().skip(skip) {
            if item.ack_state != AckState::Persisted {
                item.ack_state = AckState::Unacked;
            }
        }
    }

    /// Flag `index` as the first item of an upload session.
    pub fn mark_stream_start(&mut self, index: u64) -> ViewResult<()> {
        let item = self.item_at_mut(index)?;
        item.flags |= ItemFlags::STREAM_START;
        Ok(())
    }

    // --- Statistics ------------------------------------------------------

    /// Bytes held by items in `[from, to)`, skipped items excluded.
    pub fn bytes_between(&self, from: u64, to: u64) -> u64 {
        let tail = self.tail_index();
        let from = from.max(tail);
        let to = to.min(self.head);
        if from >= to {
            return 0;
        }
        self.items
            .iter()
            .skip((from - tail) as usize)
            .take((to - from) as usize)
            .filter(|item| !item.is_skipped())
            .map(|item| item.length as u64)
            .sum()
    }

    /// Duration covered by items in `[from, to)`.
    pub fn duration_between(&self, from: u64, to: u64) -> Timestamp {
        let to = to.min(self.head);
        if from >= to {
            return 0;
        }
        match (self.item_at(from.max(self.tail_index())), self.item_at(to - 1)) {
            (Ok(first), Ok(last)) => last
                .timestamp
                .saturating_add(last.duration)
                .saturating_sub(first.timestamp),
            _ => 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.config.capacity
    }

    pub fn config(&self) -> &ViewConfig {
        &self.config
    }

    pub fn store_capacity(&self) -> u64 {
        self.store.capacity()
    }

    pub fn store_allocated(&self) -> u64 {
        self.store.allocated()
    }

    pub fn store_available(&self) -> u64 {
        self.store.available()
    }
}

impl Drop for ContentView {
    fn drop(&mut self) {
        self.remove_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryContentStore;
    use proptest::prelude::*;

    const MS: Timestamp = ingest_proto::HUNDREDS_OF_NANOS_IN_A_MILLISECOND;

    fn config(capacity: usize, policy: ViewOverflowPolicy) -> ViewConfig {
        ViewConfig {
            capacity,
            buffer_duration: 60_000 * MS,
            overflow_policy: policy,
            storage_policy: StoragePressurePolicy::DropTail,
        }
    }

    fn view(capacity: usize, policy: ViewOverflowPolicy) -> ContentView {
        ContentView::new(
            config(capacity, policy),
            Box::new(MemoryContentStore::new(1 << 20)),
        )
    }

    fn entry(ts_ms: u64, key: bool, data: &'static [u8]) -> ViewEntry {
        ViewEntry {
            data: Bytes::from_static(data),
            timestamp: ts_ms * MS,
            ack_timestamp: ts_ms * MS,
            duration: 10 * MS,
            track_id: 1,
            flags: if key {
                ItemFlags::FRAGMENT_START
            } else {
                ItemFlags::empty()
            },
        }
    }

    #[test]
    fn test_first_item_must_start_fragment() {
        let mut view = view(8, ViewOverflowPolicy::DropTailViewItem);
        assert_eq!(
            view.append(entry(0, false, b"a")).unwrap_err(),
            ViewError::MissingFragmentStart(0)
        );
        assert_eq!(view.append(entry(0, true, b"a")).unwrap().index, 0);
    }

    #[test]
    fn test_new_fragment_closes_previous() {
        let mut view = view(8, ViewOverflowPolicy::DropTailViewItem);
        view.append(entry(0, true, b"a")).unwrap();
        view.append(entry(10, false, b"b")).unwrap();
        view.append(entry(20, true, b"c")).unwrap();

        assert!(view.item_at(1).unwrap().is_fragment_end());
        assert!(!view.item_at(0).unwrap().is_fragment_end());
        assert_eq!(view.fragment_end(0), 2);
        assert_eq!(view.fragment_start_at_or_before(1), Some(0));
        assert_eq!(view.fragment_start_at_or_after(1), Some(2));
    }

    #[test]
    fn test_end_marker_requires_open_fragment() {
        let mut view = view(8, ViewOverflowPolicy::DropTailViewItem);
        view.append(entry(0, true, b"a")).unwrap();

        let mut marker = entry(10, false, b"");
        marker.flags = ItemFlags::FRAGMENT_END;
        view.append(marker.clone()).unwrap();

        assert_eq!(
            view.append(marker).unwrap_err(),
            ViewError::FragmentAlreadyEnded(2)
        );
        assert_eq!(
            view.append(entry(20, false, b"x")).unwrap_err(),
            ViewError::MissingFragmentStart(2)
        );
    }

    #[test]
    fn test_item_not_found_outside_window() {
        let mut view = view(2, ViewOverflowPolicy::DropTailViewItem);
        view.append(entry(0, true, b"a")).unwrap();
        view.append(entry(10, true, b"b")).unwrap();
        view.append(entry(20, true, b"c")).unwrap();

        assert_eq!(view.item_at(0), Err(ViewError::ItemNotFound(0)));
        assert_eq!(view.item_at(3), Err(ViewError::ItemNotFound(3)));
        assert_eq!(view.item_at(1).unwrap().index, 1);
    }

    #[test]
    fn test_drop_tail_item_marks_orphans_skipped() {
        let mut view = view(3, ViewOverflowPolicy::DropTailViewItem);
        view.append(entry(0, true, b"a")).unwrap();
        view.append(entry(10, false, b"b")).unwrap();
        view.append(entry(20, false, b"c")).unwrap();

        let outcome = view.append(entry(30, false, b"d")).unwrap();
        assert_eq!(outcome.evicted.len(), 1);
        assert_eq!(outcome.evicted[0].index, 0);
        assert!(view.item_at(1).unwrap().is_skipped());
        assert!(view.item_at(3).unwrap().is_skipped());
    }

    #[test]
    fn test_drop_until_fragment_start_evicts_whole_fragment() {
        let mut view = view(4, ViewOverflowPolicy::DropUntilFragmentStart);
        view.append(entry(0, true, b"a")).unwrap();
        view.append(entry(10, false, b"b")).unwrap();
        view.append(entry(20, true, b"c")).unwrap();
        view.append(entry(30, false, b"d")).unwrap();

        let outcome = view.append(entry(40, true, b"e")).unwrap();
        let evicted: Vec<u64> = outcome.evicted.iter().map(|e| e.index).collect();
        assert_eq!(evicted, vec![0, 1]);
        assert_eq!(view.tail_index(), 2);
        assert!(view.item_at(2).unwrap().is_fragment_start());
    }

    #[test]
    fn test_duration_overflow_evicts() {
        let mut config = config(100, ViewOverflowPolicy::DropUntilFragmentStart);
        config.buffer_duration = 100 * MS;
        let mut view = ContentView::new(config, Box::new(MemoryContentStore::new(1024)));

        view.append(entry(0, true, b"a")).unwrap();
        view.append(entry(50, true, b"b")).unwrap();
        let outcome = view.append(entry(120, true, b"c")).unwrap();

        assert_eq!(outcome.evicted.len(), 1);
        assert_eq!(view.tail_index(), 1);
    }

    #[test]
    fn test_storage_fail_policy_reports_oom_without_eviction() {
        let mut config = config(100, ViewOverflowPolicy::DropTailViewItem);
        config.storage_policy = StoragePressurePolicy::Fail;
        let mut view = ContentView::new(config, Box::new(MemoryContentStore::new(4)));

        view.append(entry(0, true, b"ab")).unwrap();
        view.append(entry(10, true, b"cd")).unwrap();

        assert!(matches!(
            view.append(entry(20, true, b"ef")),
            Err(ViewError::StoreOutOfMemory { .. })
        ));
        assert_eq!(view.len(), 2);
    }

    #[test]
    fn test_storage_drop_tail_policy_evicts_and_retries() {
        let mut view = ContentView::new(
            config(100, ViewOverflowPolicy::DropTailViewItem),
            Box::new(MemoryContentStore::new(4)),
        );

        view.append(entry(0, true, b"ab")).unwrap();
        view.append(entry(10, true, b"cd")).unwrap();
        let outcome = view.append(entry(20, true, b"ef")).unwrap();

        assert_eq!(outcome.evicted.len(), 1);
        assert!(!outcome.evicted[0].delivered);
        assert_eq!(view.store_allocated(), 4);
    }

    #[test]
    fn test_read_across_items_with_offsets() {
        let mut view = view(8, ViewOverflowPolicy::DropTailViewItem);
        view.add_cursor(CursorKey::Pending, 0).unwrap();
        view.append(entry(0, true, b"hello")).unwrap();
        view.append(entry(10, false, b"world")).unwrap();

        let mut buf = [0u8; 3];
        let first = view.read(CursorKey::Pending, &mut buf, None).unwrap();
        assert_eq!(first.filled, 3);
        assert!(!first.exhausted);
        assert_eq!(&buf, b"hel");

        let mut rest = [0u8; 16];
        let second = view.read(CursorKey::Pending, &mut rest, None).unwrap();
        assert_eq!(&rest[..second.filled], b"loworld");
        assert!(second.exhausted);
        assert_eq!(view.current_index(CursorKey::Pending).unwrap(), 2);
    }

    #[test]
    fn test_read_stops_at_limit() {
        let mut view = view(8, ViewOverflowPolicy::DropTailViewItem);
        view.add_cursor(CursorKey::Pending, 0).unwrap();
        view.append(entry(0, true, b"ab")).unwrap();
        view.append(entry(10, true, b"cd")).unwrap();

        let mut buf = [0u8; 8];
        let outcome = view.read(CursorKey::Pending, &mut buf, Some(1)).unwrap();
        assert_eq!(&buf[..outcome.filled], b"ab");
        assert!(outcome.exhausted);
    }

    #[test]
    fn test_eviction_overruns_cursor() {
        let mut view = view(2, ViewOverflowPolicy::DropTailViewItem);
        let key = CursorKey::Handle(UploadHandle(1));
        view.add_cursor(key, 0).unwrap();
        view.append(entry(0, true, b"a")).unwrap();
        view.append(entry(10, true, b"b")).unwrap();

        let outcome = view.append(entry(20, true, b"c")).unwrap();
        assert_eq!(outcome.overrun, vec![key]);
        let cursor = view.cursor(key).unwrap();
        assert!(cursor.overrun);
        assert_eq!(cursor.index, 1);
    }

    #[test]
    fn test_set_current_index_behind_tail_fails() {
        let mut view = view(2, ViewOverflowPolicy::DropTailViewItem);
        view.add_cursor(CursorKey::Pending, 0).unwrap();
        view.append(entry(0, true, b"a")).unwrap();
        view.append(entry(10, true, b"b")).unwrap();
        view.append(entry(20, true, b"c")).unwrap();

        assert_eq!(
            view.set_current_index(CursorKey::Pending, 0),
            Err(ViewError::CursorBehindTail { index: 0, tail: 1 })
        );
        assert_eq!(
            view.rollback_current_index(CursorKey::Pending, 0).unwrap(),
            1
        );
    }

    #[test]
    fn test_rollback_lands_on_fragment_start() {
        let mut view = view(8, ViewOverflowPolicy::DropTailViewItem);
        view.add_cursor(CursorKey::Pending, 0).unwrap();
        view.append(entry(0, true, b"a")).unwrap();
        view.append(entry(10, false, b"b")).unwrap();
        view.append(entry(20, true, b"c")).unwrap();

        assert_eq!(
            view.rollback_current_index(CursorKey::Pending, 1).unwrap(),
            2
        );
    }

    #[test]
    fn test_fragment_for_timestamp() {
        let mut view = view(8, ViewOverflowPolicy::DropTailViewItem);
        view.append(entry(0, true, b"a")).unwrap();
        view.append(entry(10, false, b"b")).unwrap();
        view.append(entry(20, true, b"c")).unwrap();

        assert_eq!(view.fragment_for_timestamp(0, 0..3).unwrap(), 0);
        assert_eq!(view.fragment_for_timestamp(20 * MS, 0..3).unwrap(), 2);
        assert_eq!(
            view.fragment_for_timestamp(1_000 * MS, 0..3),
            Err(ViewError::AckTimestampNotInViewWindow(1_000 * MS))
        );
        assert_eq!(
            view.fragment_for_timestamp(20 * MS, 0..2).unwrap(),
            0,
            "outside the window the covering fragment is the earlier one"
        );
    }

    #[test]
    fn test_ack_state_moves_forward_only() {
        let mut view = view(8, ViewOverflowPolicy::DropTailViewItem);
        view.append(entry(0, true, b"a")).unwrap();
        view.append(entry(10, false, b"b")).unwrap();

        view.apply_fragment_ack_state(0, AckState::Persisted).unwrap();
        view.apply_fragment_ack_state(0, AckState::Received).unwrap();
        view.apply_fragment_ack_state(0, AckState::Error).unwrap();
        assert_eq!(view.item_at(1).unwrap().ack_state, AckState::Persisted);

        view.reset_ack_state(0);
        assert_eq!(view.fragment_ack_state(0).unwrap(), AckState::Persisted);
    }

    #[test]
    fn test_trim_tail_respects_cursors() {
        let mut view = view(8, ViewOverflowPolicy::DropTailViewItem);
        view.add_cursor(CursorKey::Pending, 0).unwrap();
        view.append(entry(0, true, b"a")).unwrap();
        view.append(entry(10, true, b"b")).unwrap();
        view.append(entry(20, true, b"c")).unwrap();

        assert_eq!(view.trim_tail(2), 0);

        view.set_current_index(CursorKey::Pending, 1).unwrap();
        assert_eq!(view.trim_tail(2), 1);
        assert_eq!(view.tail_index(), 1);
        assert_eq!(view.store_allocated(), 2);
    }

    proptest! {
        #[test]
        fn prop_indices_monotonic_and_items_immutable(
            sizes in proptest::collection::vec((1usize..16, any::<bool>()), 1..64),
            capacity in 2usize..16,
        ) {
            let mut view = view(capacity, ViewOverflowPolicy::DropTailViewItem);
            let mut last_head = view.head_index();

            for (i, (size, key)) in sizes.iter().enumerate() {
                let ts = i as u64 * 10 * MS;
                let entry = ViewEntry {
                    data: Bytes::from(vec![i as u8; *size]),
                    timestamp: ts,
                    ack_timestamp: ts,
                    duration: 10 * MS,
                    track_id: 1,
                    flags: if *key || i == 0 { ItemFlags::FRAGMENT_START } else { ItemFlags::empty() },
                };
                let outcome = view.append(entry).unwrap();
                prop_assert_eq!(outcome.index, last_head);
                prop_assert!(view.head_index() > last_head);
                last_head = view.head_index();

                for index in view.tail_index()..view.head_index() {
                    let item = view.item_at(index).unwrap();
                    prop_assert_eq!(item.index, index);
                    prop_assert_eq!(item.ack_timestamp, index * 10 * MS);
                    let payload = view.payload(index).unwrap();
                    prop_assert!(payload.iter().all(|b| *b == index as u8));
                }
            }
        }
    }
}
