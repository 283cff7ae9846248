//! A single ingestion stream.
//!
//! One mutex guards the control plane, the view, the upload sessions and the
//! ack processor. Service calls queued by the control plane are issued only
//! after the lock is released, and notifications go out through a bounded
//! channel, so caller code never runs while the stream is locked.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use crossbeam_channel::Sender;
use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, error, info, instrument, trace, warn};

use ingest_encoder::{create_encoder, EncoderKind, FrameEncoder, MetadataQueue, MAX_FRAGMENT_METADATA_COUNT};
use ingest_proto::{
    AckKind, AckState, FragmentAck, Frame, ServiceCallResult, StoragePressurePolicy, StreamConfig,
    StreamDescription, StreamEvent, StreamMetrics, StreamState, Timestamp, UploadHandle,
};
use ingest_transport::{parse_endpoint, AuthInfo, ServiceCall, ServiceCallbacks, UploadState};
use ingest_view::{
    AppendOutcome, ContentView, CursorKey, EvictedItem, ItemFlags, MemoryContentStore, ViewConfig,
    ViewEntry, ViewError,
};

use crate::ack::{AckOutcome, AckProcessor};
use crate::control_plane::{create_state_machine, CallKind, ControlPlane};
use crate::error::StreamError;
use crate::fsm::StateMachine;
use crate::metrics::{MetricsCollector, ViewUsage};
use crate::ordering::FrameOrderCoordinator;
use crate::platform::Platform;
use crate::session::{jittered_expiration, needs_rotation, SessionManager, UploadSession};
use crate::StreamResult;

/// Free storage percentage below which storage pressure is reported.
pub const STORAGE_PRESSURE_NOTIFICATION_THRESHOLD: u64 = 5;

/// What a consumer should do after a read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataStatus {
    /// The buffer was filled; call again.
    More,

    /// Everything available has been handed out.
    NoMoreData,

    /// The handle is finished. Close the connection.
    EndOfStream,
}

/// Result of [`Stream::get_stream_data`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamData {
    pub filled: usize,
    pub status: DataStatus,
}

impl StreamData {
    fn new(filled: usize, status: DataStatus) -> Self {
        Self { filled, status }
    }
}

/// Snapshot of one upload handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadHandleInfo {
    pub handle: UploadHandle,
    pub state: UploadState,
    pub start_index: Option<u64>,
    pub last_get_stream_data_time: Option<Timestamp>,
}

struct StreamInner {
    config: StreamConfig,
    fsm: StateMachine<StreamState, ControlPlane>,
    control: ControlPlane,
    view: ContentView,
    sessions: SessionManager,
    acks: AckProcessor,
    encoder: Box<dyn FrameEncoder>,
    metadata: MetadataQueue,
    ordering: FrameOrderCoordinator,
    pending_frames: VecDeque<Frame>,

    last_dts: HashMap<u64, Timestamp>,
    needs_fragment_start: bool,
    last_was_eofr: bool,

    storage_pressure_reported: bool,
    latency_pressure_reported: bool,

    /// Failed or freed. Only `free` and read-only queries are served.
    terminal: bool,
    freed: bool,
    closed_reported: bool,
}

impl StreamInner {
    /// Refresh the control-plane view of the session layer.
    fn sync_control(&mut self) {
        let head = self.view.head_index();
        let pending = self.view.current_index(CursorKey::Pending).ok();

        self.control.live_handles = self.sessions.live_count();
        self.control.streaming_handles = self.sessions.streaming_count();
        self.control.has_content = match pending {
            // A handle that has not read yet already owns the pending content.
            Some(index) => index < head && self.sessions.oldest_waiting().is_none(),
            None => self.sessions.current().is_some() && !self.view.is_empty(),
        };
        self.control.start_timestamp = pending
            .and_then(|index| self.view.item_at(index).ok())
            .or_else(|| self.view.last_item())
            .map(|item| item.timestamp)
            .unwrap_or(0);
    }

    /// Oldest index not yet handed to any consumer.
    fn unsent_index(&self) -> u64 {
        if let Some(current) = self.sessions.current() {
            if let Ok(index) = self.view.current_index(CursorKey::Handle(current.handle)) {
                return index;
            }
        }
        self.view
            .current_index(CursorKey::Pending)
            .unwrap_or_else(|_| self.view.head_index())
    }

    /// Move the pending cursor to `index` or earlier, on a fragment start.
    fn set_pending(&mut self, index: u64) -> StreamResult<()> {
        let index = index.clamp(self.view.tail_index(), self.view.head_index());
        let target = match self.view.current_index(CursorKey::Pending) {
            Ok(existing) => existing.min(index),
            Err(_) => {
                self.view.add_cursor(CursorKey::Pending, index)?;
                index
            }
        };
        self.view.rollback_current_index(CursorKey::Pending, target)?;
        Ok(())
    }

    /// Oldest unpersisted fragment a replacement handle must resend.
    fn recovery_point(&self, session: &UploadSession) -> Option<u64> {
        let start = session.start_index?;
        let head = self.view.head_index();
        self.view
            .fragment_starts(start..head)
            .into_iter()
            .find(|index| self.view.fragment_ack_state(*index) != Ok(AckState::Persisted))
            .or(Some(head))
    }
}

/// An ingestion stream.
pub struct Stream {
    name: String,
    inner: Mutex<StreamInner>,
    space: Condvar,
    closed: Condvar,
    callbacks: Arc<dyn ServiceCallbacks>,
    platform: Arc<dyn Platform>,
    events: Sender<StreamEvent>,
    metrics: MetricsCollector,
}

impl Stream {
    /// Create a stream. Nothing is issued until [`Stream::start`].
    pub fn new(
        config: StreamConfig,
        encoder: EncoderKind,
        callbacks: Arc<dyn ServiceCallbacks>,
        platform: Arc<dyn Platform>,
        events: Sender<StreamEvent>,
    ) -> StreamResult<Self> {
        config.validate()?;

        let store = Box::new(MemoryContentStore::new(config.storage_size_bytes));
        let mut view = ContentView::new(ViewConfig::from_stream_config(&config), store);
        view.add_cursor(CursorKey::Pending, 0)?;

        let inner = StreamInner {
            fsm: create_state_machine()?,
            control: ControlPlane::new(&config),
            view,
            sessions: SessionManager::new(),
            acks: AckProcessor::new(config.replay_duration()),
            encoder: create_encoder(encoder, &config.tracks),
            metadata: MetadataQueue::new(),
            ordering: FrameOrderCoordinator::new(config.frame_order_mode, &config.tracks),
            pending_frames: VecDeque::new(),
            last_dts: HashMap::new(),
            needs_fragment_start: true,
            last_was_eofr: false,
            storage_pressure_reported: false,
            latency_pressure_reported: false,
            terminal: false,
            freed: false,
            closed_reported: false,
            config,
        };

        info!(stream = %inner.config.name, "Created stream");

        Ok(Self {
            name: inner.config.name.clone(),
            metrics: MetricsCollector::new(platform.now()),
            inner: Mutex::new(inner),
            space: Condvar::new(),
            closed: Condvar::new(),
            callbacks,
            platform,
            events,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current control-plane state.
    pub fn state(&self) -> StreamState {
        self.inner.lock().fsm.current_state()
    }

    /// Whether the stream failed or was freed.
    pub fn is_terminated(&self) -> bool {
        self.inner.lock().terminal
    }

    /// Start the control plane.
    #[instrument(name = "stream_start", skip(self), fields(stream = %self.name))]
    pub fn start(&self) -> StreamResult<()> {
        self.with_outbox(|inner| {
            if inner.terminal {
                return Err(StreamError::StreamTerminated);
            }
            self.drive(inner)
        })
    }

    // --- Producer ------------------------------------------------------------

    /// Hand a frame to the stream.
    ///
    /// Under the `Block` storage policy this waits for space, bounded by
    /// `max_blocking_put_ms` when set.
    #[instrument(name = "put_frame", skip(self, frame), fields(stream = %self.name, track_id = frame.track_id))]
    pub fn put_frame(&self, frame: Frame) -> StreamResult<()> {
        let mut guard = self.inner.lock();
        self.check_can_put(&guard)?;
        if !guard.config.tracks.iter().any(|t| t.track_id == frame.track_id) {
            return Err(StreamError::InvalidTrack(frame.track_id));
        }

        let ready = guard.ordering.push(frame);
        guard.pending_frames.extend(ready);

        let mut result = Ok(());
        while let Some(frame) = guard.pending_frames.pop_front() {
            if let Err(e) = self.ingest_blocking(&mut guard, frame) {
                result = Err(e);
                break;
            }
        }

        let now = self.platform.now();
        self.check_health(&mut guard, now);
        let driven = self.drive(&mut guard);
        let outbox = guard.control.take_outbox();
        drop(guard);

        self.issue(outbox);
        result.and(driven)
    }

    /// Replace the codec private data of a track.
    #[instrument(name = "format_changed", skip(self, codec_private_data), fields(stream = %self.name))]
    pub fn format_changed(&self, track_id: u64, codec_private_data: Bytes) -> StreamResult<()> {
        let mut inner = self.inner.lock();
        if inner.terminal {
            return Err(StreamError::StreamTerminated);
        }
        if !inner.config.tracks.iter().any(|t| t.track_id == track_id) {
            return Err(StreamError::InvalidTrack(track_id));
        }

        debug!(track_id, size = codec_private_data.len(), "Codec private data changed");
        inner
            .encoder
            .set_codec_private_data(track_id, codec_private_data)?;
        Ok(())
    }

    /// Attach metadata to the next fragment, or to every fragment when `persistent`.
    #[instrument(name = "put_fragment_metadata", skip(self, value), fields(stream = %self.name))]
    pub fn put_fragment_metadata(&self, name: &str, value: &str, persistent: bool) -> StreamResult<()> {
        let mut inner = self.inner.lock();
        if inner.terminal {
            return Err(StreamError::StreamTerminated);
        }
        if !inner.metadata.push(name, value, persistent)? {
            return Err(StreamError::MaxFragmentMetadataCount(
                MAX_FRAGMENT_METADATA_COUNT,
            ));
        }
        Ok(())
    }

    fn check_can_put(&self, inner: &StreamInner) -> StreamResult<()> {
        if inner.terminal {
            return Err(StreamError::StreamTerminated);
        }
        if inner.control.stopping {
            return Err(StreamError::StreamStopped);
        }
        if inner.config.is_offline_with_zero_retention()
            && !inner.fsm.current_state().is_ready_to_upload()
        {
            return Err(StreamError::OfflineModeWithZeroRetention);
        }
        Ok(())
    }

    fn ingest_blocking(&self, guard: &mut MutexGuard<'_, StreamInner>, frame: Frame) -> StreamResult<()> {
        let Some(entry) = self.prepare(guard, &frame)? else {
            return Ok(());
        };
        let flags = entry.flags;
        let deadline = guard
            .config
            .max_blocking_put_ms
            .map(|ms| Instant::now() + Duration::from_millis(ms));

        loop {
            match guard.view.append(entry.clone()) {
                Ok(outcome) => {
                    self.after_append(guard, &frame, flags, outcome);
                    return Ok(());
                }
                Err(ViewError::StoreOutOfMemory { requested, available })
                    if guard.config.storage_pressure_policy == StoragePressurePolicy::Block =>
                {
                    if guard.control.stopping {
                        return Err(StreamError::StreamStopped);
                    }
                    debug!(requested, available, "Blocking put on storage pressure");
                    match deadline {
                        Some(deadline) => {
                            if self.space.wait_until(guard, deadline).timed_out() {
                                warn!("Blocked put timed out");
                                return Err(StreamError::BlockedPutTimeout);
                            }
                        }
                        None => self.space.wait(guard),
                    }
                    if guard.terminal {
                        return Err(StreamError::StreamTerminated);
                    }
                    if guard.control.stopping {
                        return Err(StreamError::StreamStopped);
                    }
                }
                Err(e) => {
                    warn!(timestamp = frame.decoding_ts, "Failed to append frame: {}", e);
                    return Err(e.into());
                }
            }
        }
    }

    /// Validate and package a frame. `None` means the frame is dropped or a no-op.
    fn prepare(&self, inner: &mut StreamInner, frame: &Frame) -> StreamResult<Option<ViewEntry>> {
        if frame.is_end_of_fragment() {
            if inner.last_was_eofr {
                return Err(StreamError::MultipleConsecutiveEofr);
            }
            if inner.needs_fragment_start {
                debug!("End of fragment without an open fragment");
                return Ok(None);
            }
            let data = inner
                .encoder
                .encode_end_of_fragment(frame.track_id, frame.decoding_ts);
            return Ok(Some(ViewEntry {
                data,
                timestamp: frame.decoding_ts,
                ack_timestamp: frame.presentation_ts,
                duration: 0,
                track_id: frame.track_id,
                flags: ItemFlags::FRAGMENT_END,
            }));
        }

        if inner.last_was_eofr && !frame.is_key_frame() {
            return Err(StreamError::KeyFrameRequiredAfterEofr);
        }

        if let Some(previous) = inner.last_dts.get(&frame.track_id) {
            if frame.decoding_ts < *previous {
                return Err(StreamError::TimestampNotMonotonic {
                    track_id: frame.track_id,
                    previous: *previous,
                    current: frame.decoding_ts,
                });
            }
        }

        if inner.needs_fragment_start && !frame.is_key_frame() {
            debug!(timestamp = frame.decoding_ts, "Dropping frame before the first key frame");
            self.metrics.record_dropped_frame();
            self.emit(StreamEvent::DroppedFrame {
                stream: self.name.clone(),
                timestamp: frame.decoding_ts,
            });
            return Ok(None);
        }

        let starts = frame.is_key_frame()
            && (inner.config.key_frame_fragmentation || inner.needs_fragment_start);
        let metadata = if starts {
            inner.metadata.take_for_fragment()
        } else {
            Vec::new()
        };
        let data = inner.encoder.encode_frame(frame, &metadata)?;

        Ok(Some(ViewEntry {
            data,
            timestamp: frame.decoding_ts,
            ack_timestamp: frame.presentation_ts,
            duration: frame.duration,
            track_id: frame.track_id,
            flags: if starts {
                ItemFlags::FRAGMENT_START
            } else {
                ItemFlags::empty()
            },
        }))
    }

    fn after_append(&self, inner: &mut StreamInner, frame: &Frame, flags: ItemFlags, outcome: AppendOutcome) {
        inner.last_dts.insert(frame.track_id, frame.decoding_ts);
        if frame.is_end_of_fragment() {
            inner.last_was_eofr = true;
            inner.needs_fragment_start = true;
        } else {
            inner.last_was_eofr = false;
            if flags.contains(ItemFlags::FRAGMENT_START) {
                inner.needs_fragment_start = false;
            }
            self.metrics.record_frame();
        }

        trace!(index = outcome.index, ?flags, "Frame appended");
        self.handle_evictions(inner, &outcome.evicted);
        self.handle_overruns(inner, &outcome.overrun);
        self.notify_data(inner);
    }

    fn handle_evictions(&self, inner: &mut StreamInner, evicted: &[EvictedItem]) {
        for item in evicted.iter().filter(|item| !item.delivered) {
            debug!(index = item.index, timestamp = item.timestamp, "Dropped unsent frame");
            self.metrics.record_dropped_frame();
            self.emit(StreamEvent::DroppedFrame {
                stream: self.name.clone(),
                timestamp: item.timestamp,
            });
            if item.flags.contains(ItemFlags::FRAGMENT_START) {
                self.metrics.record_dropped_fragment();
                self.emit(StreamEvent::DroppedFragment {
                    stream: self.name.clone(),
                    timestamp: item.timestamp,
                });
            }
        }

        if evicted.iter().any(|item| item.ack_state == AckState::Unacked && item.delivered) {
            trace!(stream = %inner.config.name, "Evicted content that was sent but not acked");
        }
    }

    fn handle_overruns(&self, inner: &mut StreamInner, overrun: &[CursorKey]) {
        for key in overrun {
            let CursorKey::Handle(handle) = *key else {
                continue;
            };
            let Ok(session) = inner.sessions.get_mut(handle) else {
                continue;
            };

            if !session.state.is_draining() {
                warn!(upload_handle = %handle, "Upload handle overrun by eviction");
                continue;
            }

            warn!(upload_handle = %handle, "Draining upload handle lost unsent content, aborting");
            session.state = UploadState::Aborted;
            let resume = inner.view.remove_cursor(*key).map(|cursor| cursor.index);
            if let Some(index) = resume {
                if let Err(e) = inner.set_pending(index) {
                    warn!("Failed to reposition pending cursor: {}", e);
                }
            }
            self.emit(StreamEvent::StreamError {
                stream: self.name.clone(),
                upload_handle: Some(handle),
                result: ServiceCallResult::Unknown,
                message: StreamError::UploadHandleAborted(handle).to_string(),
                recoverable: true,
            });
        }
    }

    /// Data availability and pressure notifications after an append.
    fn notify_data(&self, inner: &mut StreamInner) {
        let head = inner.view.head_index();
        let from = inner.unsent_index();
        let duration = inner.view.duration_between(from, head);

        if let Some(current) = inner.sessions.current() {
            self.emit(StreamEvent::DataAvailable {
                stream: self.name.clone(),
                upload_handle: current.handle,
                duration_available: duration,
                bytes_available: inner.view.bytes_between(from, head),
            });
        }

        let capacity = inner.view.store_capacity();
        let available = inner.view.store_available();
        if available.saturating_mul(100) < capacity.saturating_mul(STORAGE_PRESSURE_NOTIFICATION_THRESHOLD) {
            if !inner.storage_pressure_reported {
                warn!(remaining_bytes = available, "Storage pressure");
                inner.storage_pressure_reported = true;
                self.emit(StreamEvent::StoragePressure {
                    stream: self.name.clone(),
                    remaining_bytes: available,
                });
            }
        } else {
            inner.storage_pressure_reported = false;
        }

        let max_latency = inner.config.max_latency();
        if max_latency > 0 && duration > max_latency {
            if !inner.latency_pressure_reported {
                warn!(buffer_duration = duration, "Latency pressure");
                inner.latency_pressure_reported = true;
                self.emit(StreamEvent::LatencyPressure {
                    stream: self.name.clone(),
                    buffer_duration: duration,
                });
            }
        } else {
            inner.latency_pressure_reported = false;
        }
    }

    // --- Consumer ------------------------------------------------------------

    /// Copy the next bytes for `handle` into `buf`.
    #[instrument(name = "get_stream_data", skip(self, buf), fields(stream = %self.name, upload_handle = %handle))]
    pub fn get_stream_data(&self, handle: UploadHandle, buf: &mut [u8]) -> StreamResult<StreamData> {
        self.with_outbox(|inner| {
            if inner.terminal {
                return Err(StreamError::StreamTerminated);
            }
            let now = self.platform.now();
            self.check_health(inner, now);
            self.read(inner, handle, buf, now)
        })
    }

    fn read(
        &self,
        inner: &mut StreamInner,
        handle: UploadHandle,
        buf: &mut [u8],
        now: Timestamp,
    ) -> StreamResult<StreamData> {
        match inner.sessions.get(handle)?.state {
            UploadState::Aborted => {
                inner.sessions.retire(handle);
                inner.view.remove_cursor(CursorKey::Handle(handle));
                self.drive(inner)?;
                return Err(StreamError::UploadHandleAborted(handle));
            }
            UploadState::Terminated { .. } => {
                inner.sessions.retire(handle);
                inner.view.remove_cursor(CursorKey::Handle(handle));
                self.drive(inner)?;
                return Ok(StreamData::new(0, DataStatus::EndOfStream));
            }
            _ => {}
        }

        if !inner.sessions.get(handle)?.is_active() {
            if inner.sessions.has_older_live(handle) {
                trace!("Waiting for older upload handles to drain");
                return Ok(StreamData::new(0, DataStatus::NoMoreData));
            }
            self.activate(inner, handle)?;
        }

        let session = inner.sessions.get_mut(handle)?;
        let mut filled = session.read_header(buf);
        let draining = session.state.is_draining();
        if filled == buf.len() && !buf.is_empty() {
            session.last_get_stream_data_time = Some(now);
            self.metrics.record_bytes_sent(filled as u64);
            return Ok(StreamData::new(filled, DataStatus::More));
        }

        let key = CursorKey::Handle(handle);
        let limit = if draining {
            self.drain_limit(inner, handle)?
        } else {
            None
        };

        let outcome = inner.view.read(key, &mut buf[filled..], limit)?;
        filled += outcome.filled;

        let session = inner.sessions.get_mut(handle)?;
        if filled > 0 {
            session.last_get_stream_data_time = Some(now);
            self.metrics.record_bytes_sent(filled as u64);
        }

        if let (Some(boundary), true) = (limit, outcome.exhausted) {
            info!(boundary, "Upload handle reached its end");
            session.terminate(ServiceCallResult::Ok);
            inner.view.remove_cursor(key);
            inner.set_pending(boundary)?;
            self.drive(inner)?;
            return Ok(StreamData::new(filled, DataStatus::EndOfStream));
        }

        let status = if outcome.exhausted {
            DataStatus::NoMoreData
        } else {
            DataStatus::More
        };
        Ok(StreamData::new(filled, status))
    }

    /// Place the cursor of a handle that is about to deliver its first bytes.
    fn activate(&self, inner: &mut StreamInner, handle: UploadHandle) -> StreamResult<()> {
        let head = inner.view.head_index();
        let start = match inner.view.remove_cursor(CursorKey::Pending) {
            Some(cursor) => cursor.index,
            None => inner
                .view
                .fragment_start_at_or_after(inner.view.tail_index())
                .unwrap_or(head),
        };

        // Starting at the head of an open fragment would begin mid-fragment.
        let start = match inner.view.last_item() {
            Some(last) if start == head && !last.is_fragment_end() => inner
                .view
                .fragment_start_at_or_before(head - 1)
                .unwrap_or(head),
            _ => start,
        };

        inner.view.add_cursor(CursorKey::Handle(handle), start)?;
        if start < head {
            inner.view.mark_stream_start(start)?;
        }

        let session = inner.sessions.get_mut(handle)?;
        session.start_index = Some(start);
        if session.state == UploadState::New {
            session.state = UploadState::Streaming;
        }
        info!(upload_handle = %handle, start, "Upload handle activated");
        Ok(())
    }

    /// End index of a draining handle, fixed at the first fragment boundary it reaches.
    fn drain_limit(&self, inner: &mut StreamInner, handle: UploadHandle) -> StreamResult<Option<u64>> {
        if let Some(end) = inner.sessions.get(handle)?.end_index {
            return Ok(Some(end));
        }

        let cursor = inner.view.cursor(CursorKey::Handle(handle))?;
        let from = cursor.index + u64::from(cursor.offset > 0);
        let boundary = inner.view.fragment_start_at_or_after(from);
        if let Some(end) = boundary {
            debug!(upload_handle = %handle, end, "Fixed drain boundary");
            inner.sessions.get_mut(handle)?.end_index = Some(end);
        }
        Ok(boundary)
    }

    /// Apply an ack received on `handle`'s connection.
    #[instrument(name = "submit_fragment_ack", skip(self, ack), fields(stream = %self.name, upload_handle = %handle, kind = ?ack.kind))]
    pub fn submit_fragment_ack(&self, handle: UploadHandle, ack: FragmentAck) -> StreamResult<()> {
        self.with_outbox(|inner| {
            if inner.terminal {
                return Err(StreamError::StreamTerminated);
            }
            let now = self.platform.now();
            let session = inner.sessions.get_mut(handle)?;

            let outcome = match inner.acks.apply(&mut inner.view, session, &ack, now) {
                Ok(outcome) => outcome,
                Err(e @ StreamError::RollbackOutsideReplayWindow { .. }) => {
                    self.fail(inner, e.clone());
                    return Err(e);
                }
                Err(e) => return Err(e),
            };

            self.emit(StreamEvent::FragmentAcked {
                stream: self.name.clone(),
                upload_handle: handle,
                ack: ack.clone(),
            });

            match outcome {
                AckOutcome::Applied { released, .. } => {
                    if ack.kind == AckKind::Persisted {
                        self.metrics.record_persisted_ack();
                    }
                    if released > 0 {
                        self.space.notify_all();
                    }
                    Ok(())
                }
                AckOutcome::AlreadyReleased => Ok(()),
                AckOutcome::Rollback { restart, .. } => {
                    self.metrics.record_error_ack();
                    self.terminate_session(inner, handle, ack.result, Some(restart))
                }
            }
        })
    }

    /// The transport lost the connection of `handle`.
    #[instrument(name = "notify_connection_error", skip(self), fields(stream = %self.name, upload_handle = %handle))]
    pub fn notify_connection_error(&self, handle: UploadHandle, result: ServiceCallResult) -> StreamResult<()> {
        self.with_outbox(|inner| {
            if inner.terminal {
                return Err(StreamError::StreamTerminated);
            }
            if !inner.sessions.get(handle)?.state.is_live() {
                return Err(StreamError::InvalidUploadHandle(handle));
            }
            self.terminate_session(inner, handle, result, None)
        })
    }

    /// End every live handle and open a fresh one from the oldest unpersisted fragment.
    #[instrument(name = "reset_connection", skip(self), fields(stream = %self.name))]
    pub fn reset_connection(&self) -> StreamResult<()> {
        self.with_outbox(|inner| {
            if inner.terminal {
                return Err(StreamError::StreamTerminated);
            }

            let live: Vec<UploadHandle> = inner
                .sessions
                .iter()
                .filter(|s| s.state.is_live())
                .map(|s| s.handle)
                .collect();

            for handle in &live {
                let restart = inner
                    .sessions
                    .get(*handle)
                    .ok()
                    .and_then(|session| inner.recovery_point(session));
                inner.sessions.get_mut(*handle)?.terminate(ServiceCallResult::Ok);
                inner.view.remove_cursor(CursorKey::Handle(*handle));
                if let Some(restart) = restart {
                    inner.set_pending(restart)?;
                    inner.view.reset_ack_state(restart);
                }
            }

            if !live.is_empty() {
                info!(handles = live.len(), "Connection reset");
                inner.control.termination = Some(ServiceCallResult::Ok);
            }
            self.drive(inner)
        })
    }

    fn terminate_session(
        &self,
        inner: &mut StreamInner,
        handle: UploadHandle,
        result: ServiceCallResult,
        restart: Option<u64>,
    ) -> StreamResult<()> {
        let restart = match restart {
            Some(restart) => Some(restart),
            None => inner.recovery_point(inner.sessions.get(handle)?),
        };
        inner.sessions.get_mut(handle)?.terminate(result);
        inner.view.remove_cursor(CursorKey::Handle(handle));

        if !inner.config.recover_on_error {
            let e = StreamError::UploadHandleTerminated { handle, result };
            self.fail(inner, e.clone());
            return Err(e);
        }

        if let Some(restart) = restart {
            self.rewind_past(inner, restart, result)?;
            inner.set_pending(restart)?;
            inner.view.reset_ack_state(restart);
        }
        if inner.sessions.live_count() == 0 {
            inner.control.termination = Some(result);
        }

        warn!(upload_handle = %handle, ?result, ?restart, "Upload handle terminated, recovering");
        self.emit(StreamEvent::StreamError {
            stream: self.name.clone(),
            upload_handle: Some(handle),
            result,
            message: format!("Upload handle {} terminated", handle),
            recoverable: true,
        });

        self.drive(inner)
    }

    /// End live handles that already delivered content at or after `restart`.
    ///
    /// They never read from the pending cursor, so they would skip the
    /// rolled back fragments.
    fn rewind_past(&self, inner: &mut StreamInner, restart: u64, result: ServiceCallResult) -> StreamResult<()> {
        let passed: Vec<UploadHandle> = inner
            .sessions
            .iter()
            .filter(|session| session.state.is_live())
            .map(|session| session.handle)
            .filter(|handle| {
                inner
                    .view
                    .cursor(CursorKey::Handle(*handle))
                    .is_ok_and(|cursor| cursor.index + u64::from(cursor.offset > 0) > restart)
            })
            .collect();

        for handle in passed {
            info!(upload_handle = %handle, restart, "Rewinding upload handle");
            inner.sessions.get_mut(handle)?.terminate(result);
            inner.view.remove_cursor(CursorKey::Handle(handle));
            self.emit(StreamEvent::StreamError {
                stream: self.name.clone(),
                upload_handle: Some(handle),
                result,
                message: format!("Upload handle {} rewound to {}", handle, restart),
                recoverable: true,
            });
        }
        Ok(())
    }

    // --- Control-plane results -------------------------------------------------

    pub fn describe_stream_result(
        &self,
        correlation_id: u64,
        result: ServiceCallResult,
        description: Option<StreamDescription>,
    ) -> StreamResult<()> {
        self.complete(CallKind::DescribeStream, correlation_id, result, |inner| {
            if let Some(description) = description {
                inner.control.stream_arn = Some(description.stream_arn.clone());
                inner.control.description = Some(description);
            }
            Ok(())
        })
    }

    pub fn create_stream_result(
        &self,
        correlation_id: u64,
        result: ServiceCallResult,
        stream_arn: Option<&str>,
    ) -> StreamResult<()> {
        self.complete(CallKind::CreateStream, correlation_id, result, |inner| {
            inner.control.stream_arn = stream_arn.map(str::to_string);
            Ok(())
        })
    }

    pub fn tag_stream_result(&self, correlation_id: u64, result: ServiceCallResult) -> StreamResult<()> {
        self.complete(CallKind::TagStream, correlation_id, result, |_| Ok(()))
    }

    /// Record the streaming endpoint. An unusable endpoint is rejected without a state change.
    pub fn get_streaming_endpoint_result(
        &self,
        correlation_id: u64,
        result: ServiceCallResult,
        endpoint: &str,
    ) -> StreamResult<()> {
        self.complete(CallKind::GetStreamingEndpoint, correlation_id, result, |inner| {
            let url = parse_endpoint(endpoint)
                .map_err(|_| StreamError::InvalidStreamingEndpoint(endpoint.to_string()))?;
            inner.control.endpoint = Some(url);
            Ok(())
        })
    }

    /// Record a streaming token. The stored expiration is jittered.
    pub fn get_streaming_token_result(
        &self,
        correlation_id: u64,
        result: ServiceCallResult,
        token: &str,
        expiration: Timestamp,
    ) -> StreamResult<()> {
        self.complete(CallKind::GetStreamingToken, correlation_id, result, |inner| {
            let stored = jittered_expiration(expiration, self.platform.now(), self.platform.random())?;
            debug!(granted = expiration, stored, "Streaming token accepted");
            inner.control.token = Some(AuthInfo {
                token: token.to_string(),
                expiration: stored,
            });
            Ok(())
        })
    }

    /// Complete the put-stream call. Returns the new upload handle on success.
    pub fn put_stream_result(
        &self,
        correlation_id: u64,
        result: ServiceCallResult,
    ) -> StreamResult<Option<UploadHandle>> {
        let mut created = None;
        self.complete(CallKind::PutStream, correlation_id, result, |inner| {
            let now = self.platform.now();
            let expiration = inner
                .control
                .token
                .as_ref()
                .map(|token| token.expiration)
                .unwrap_or(Timestamp::MAX);
            let header = inner.encoder.stream_header();
            let stopping = inner.control.stopping;
            let head = inner.view.head_index();

            for session in inner.sessions.iter_mut() {
                match session.state {
                    UploadState::Streaming => {
                        info!(upload_handle = %session.handle, "Draining rotated upload handle");
                        session.state = UploadState::Draining;
                    }
                    UploadState::New => session.terminate(ServiceCallResult::Ok),
                    _ => {}
                }
            }

            let handle = inner.sessions.create(header, expiration, now);
            if stopping {
                let session = inner.sessions.get_mut(handle)?;
                session.state = UploadState::Draining;
                session.end_index = Some(head);
            }
            inner.control.rotation_pending = false;
            inner.control.termination = None;
            created = Some(handle);

            self.emit(StreamEvent::DataAvailable {
                stream: self.name.clone(),
                upload_handle: handle,
                duration_available: inner.view.duration_between(inner.unsent_index(), head),
                bytes_available: inner.view.bytes_between(inner.unsent_index(), head),
            });
            Ok(())
        })?;
        Ok(created)
    }

    fn complete<F>(
        &self,
        kind: CallKind,
        correlation_id: u64,
        result: ServiceCallResult,
        apply: F,
    ) -> StreamResult<()>
    where
        F: FnOnce(&mut StreamInner) -> StreamResult<()>,
    {
        self.with_outbox(|inner| {
            if inner.terminal {
                return Err(StreamError::StreamTerminated);
            }
            inner.control.check_call(kind, correlation_id)?;
            if result.is_ok() {
                apply(inner)?;
            }
            inner.control.complete_call(kind, correlation_id, result)?;
            self.drive(inner)
        })
    }

    // --- Lifecycle -------------------------------------------------------------

    /// Stop accepting frames and drain live handles.
    ///
    /// Producers blocked on storage wake with `StreamStopped`.
    #[instrument(name = "stream_stop", skip(self), fields(stream = %self.name))]
    pub fn stop(&self) -> StreamResult<()> {
        let mut guard = self.inner.lock();
        if guard.terminal {
            return Err(StreamError::StreamTerminated);
        }
        if guard.control.stopping {
            return Ok(());
        }

        info!("Stopping stream");
        // Set first so neither the flush below nor a blocked producer waits for space.
        guard.control.stopping = true;
        self.space.notify_all();

        let flushed = guard.ordering.flush();
        guard.pending_frames.extend(flushed);
        while let Some(frame) = guard.pending_frames.pop_front() {
            if let Err(e) = self.ingest_blocking(&mut guard, frame) {
                warn!("Dropped frame while flushing on stop: {}", e);
            }
        }

        let inner = &mut *guard;
        let head = inner.view.head_index();
        for session in inner.sessions.iter_mut() {
            if matches!(session.state, UploadState::New | UploadState::Streaming) {
                session.state = UploadState::Draining;
                session.end_index = Some(head);
            }
        }

        let driven = self.drive(inner);
        let outbox = inner.control.take_outbox();
        drop(guard);
        self.issue(outbox);
        driven
    }

    /// Stop and wait until every handle drained, bounded by `stop_timeout_ms`.
    #[instrument(name = "stream_stop_sync", skip(self), fields(stream = %self.name))]
    pub fn stop_sync(&self) -> StreamResult<()> {
        self.stop()?;

        let mut inner = self.inner.lock();
        let deadline = Instant::now() + Duration::from_millis(inner.config.stop_timeout_ms);
        while !inner.closed_reported && !inner.terminal {
            if self.closed.wait_until(&mut inner, deadline).timed_out() {
                warn!("Stream did not drain before the stop timeout");
                return Err(StreamError::StopStreamTimeout);
            }
        }

        if inner.closed_reported {
            Ok(())
        } else {
            Err(StreamError::StreamTerminated)
        }
    }

    /// Release every resource. Blocked producers and waiters wake with `StreamTerminated`.
    #[instrument(name = "stream_free", skip(self), fields(stream = %self.name))]
    pub fn free(&self) {
        let mut inner = self.inner.lock();
        if inner.freed {
            return;
        }

        info!("Freeing stream");
        inner.freed = true;
        inner.terminal = true;
        inner.control.cancel_call();
        for session in inner.sessions.iter_mut() {
            if session.state.is_live() {
                session.state = UploadState::Aborted;
            }
        }
        inner.sessions.clear();
        inner.pending_frames.clear();
        inner.view.remove_all();
        drop(inner);

        self.space.notify_all();
        self.closed.notify_all();
    }

    /// Point-in-time metrics.
    pub fn metrics(&self) -> StreamMetrics {
        let inner = self.inner.lock();
        let head = inner.view.head_index();
        let from = inner.unsent_index();

        let usage = ViewUsage {
            current_duration: inner.view.duration_between(from, head),
            overall_duration: inner.view.duration_between(inner.view.tail_index(), head),
            current_size: inner.view.bytes_between(from, head),
            overall_size: inner.view.store_allocated(),
            upload_handles_created: inner.sessions.created(),
            live_upload_handles: inner.sessions.live_count() as u32,
        };
        self.metrics.snapshot(self.platform.now(), usage)
    }

    /// Handles known to the stream, oldest first.
    pub fn upload_handles(&self) -> Vec<UploadHandleInfo> {
        self.inner
            .lock()
            .sessions
            .iter()
            .map(|session| UploadHandleInfo {
                handle: session.handle,
                state: session.state,
                start_index: session.start_index,
                last_get_stream_data_time: session.last_get_stream_data_time,
            })
            .collect()
    }

    pub(crate) fn store_usage(&self) -> (u64, u64) {
        let inner = self.inner.lock();
        (inner.view.store_capacity(), inner.view.store_allocated())
    }

    pub(crate) fn dropped_frames(&self) -> u64 {
        self.metrics.dropped_frames()
    }

    // --- Internals ---------------------------------------------------------------

    /// Run `f` under the lock, then issue whatever it queued.
    fn with_outbox<T, F>(&self, f: F) -> StreamResult<T>
    where
        F: FnOnce(&mut StreamInner) -> StreamResult<T>,
    {
        let (result, outbox) = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            let result = f(inner);
            (result, inner.control.take_outbox())
        };
        self.issue(outbox);
        result
    }

    /// Step the control plane until it waits on a call or settles.
    fn drive(&self, inner: &mut StreamInner) -> StreamResult<()> {
        inner.sessions.prune_finished();
        while !inner.terminal && !inner.control.call_in_flight() {
            inner.sync_control();
            let before = inner.fsm.current_state();
            let reentering = inner.control.termination.is_some();
            let now = self.platform.now();

            match inner.fsm.step(&mut inner.control, now) {
                Ok(after) if after != before => self.on_state_change(inner, before, after),
                Ok(_) => {
                    // Re-entering the same state consumes the termination; look again.
                    if !inner.control.call_in_flight() && !reentering {
                        break;
                    }
                }
                Err(e) => {
                    self.fail(inner, e.clone());
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    fn on_state_change(&self, inner: &mut StreamInner, previous: StreamState, current: StreamState) {
        debug!(%previous, %current, "Stream state changed");
        self.emit(StreamEvent::StateChanged {
            stream: self.name.clone(),
            previous,
            current,
        });

        match current {
            StreamState::Ready if previous == StreamState::GetToken => {
                info!("Stream ready");
                self.emit(StreamEvent::StreamReady {
                    stream: self.name.clone(),
                });
            }
            StreamState::Stopped if !inner.closed_reported => {
                info!("Stream closed");
                inner.closed_reported = true;
                self.emit(StreamEvent::StreamClosed {
                    stream: self.name.clone(),
                });
                self.closed.notify_all();
            }
            _ => {}
        }
    }

    /// Token rotation and connection staleness.
    fn check_health(&self, inner: &mut StreamInner, now: Timestamp) {
        if inner.terminal {
            return;
        }

        if inner.fsm.current_state() == StreamState::Streaming
            && !inner.control.rotation_pending
            && !inner.control.stopping
        {
            if let Some(current) = inner.sessions.current() {
                if needs_rotation(current.token_expiration, now) {
                    info!(upload_handle = %current.handle, "Token close to expiry, rotating");
                    inner.control.rotation_pending = true;
                    if let Err(e) = self.drive(inner) {
                        warn!("Rotation failed: {}", e);
                        return;
                    }
                }
            }
        }

        let staleness = inner.config.connection_staleness();
        if staleness == 0 {
            return;
        }
        for session in inner.sessions.iter_mut() {
            let silent = now.saturating_sub(session.last_buffering_ack_time);
            if session.state == UploadState::Streaming
                && session.last_get_stream_data_time.is_some()
                && !session.stale_reported
                && silent > staleness
            {
                warn!(upload_handle = %session.handle, silent, "Connection stale");
                session.stale_reported = true;
                self.emit(StreamEvent::ConnectionStale {
                    stream: self.name.clone(),
                    since_last_buffering_ack: silent,
                });
            }
        }
    }

    /// Mark the stream terminal after a fatal error.
    fn fail(&self, inner: &mut StreamInner, e: StreamError) {
        error!(state = %inner.fsm.current_state(), "Stream failed: {}", e);
        inner.terminal = true;
        inner.control.cancel_call();
        self.emit(StreamEvent::StreamError {
            stream: self.name.clone(),
            upload_handle: None,
            result: e.service_call_result(),
            message: e.to_string(),
            recoverable: false,
        });
        self.space.notify_all();
        self.closed.notify_all();
    }

    /// Hand queued calls to the transport. A refused call counts as a failed call.
    fn issue(&self, mut calls: Vec<ServiceCall>) {
        while !calls.is_empty() {
            let mut refused = Vec::new();
            for call in calls.drain(..) {
                let correlation_id = call.context().correlation_id;
                let name = call.name();
                if let Err(e) = call.issue(self.callbacks.as_ref()) {
                    warn!(call = name, correlation_id, "Failed to issue service call: {}", e);
                    refused.push(correlation_id);
                }
            }

            for correlation_id in refused {
                let mut guard = self.inner.lock();
                let inner = &mut *guard;
                let Some((kind, in_flight)) = inner.control.in_flight_call() else {
                    continue;
                };
                if in_flight != correlation_id {
                    continue;
                }
                if inner
                    .control
                    .complete_call(kind, correlation_id, ServiceCallResult::Unknown)
                    .is_ok()
                {
                    if let Err(e) = self.drive(inner) {
                        debug!(correlation_id, "Refused call ended the stream: {}", e);
                    }
                }
                calls.extend(inner.control.take_outbox());
            }
        }
    }

    fn emit(&self, event: StreamEvent) {
        if let Err(e) = self.events.try_send(event) {
            warn!("Failed to send stream event: {}", e);
        }
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        self.free();
    }
}
