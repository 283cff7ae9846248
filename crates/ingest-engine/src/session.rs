//! Upload sessions and token rotation.

use std::collections::BTreeMap;

use bytes::Bytes;
use tracing::debug;

use ingest_proto::{ServiceCallResult, Timestamp, UploadHandle, HUNDREDS_OF_NANOS_IN_A_SECOND};
use ingest_transport::UploadState;

use crate::error::StreamError;
use crate::StreamResult;

/// Shortest token lifetime accepted from the service.
pub const MIN_STREAMING_TOKEN_EXPIRATION_DURATION: Timestamp = 30 * HUNDREDS_OF_NANOS_IN_A_SECOND;

/// Rotate this long before the stored expiration.
pub const STREAMING_TOKEN_EXPIRATION_GRACE_PERIOD: Timestamp = 40 * HUNDREDS_OF_NANOS_IN_A_SECOND;

/// Upper bound of the random amount shaved off a granted expiration.
pub const MAX_TOKEN_EXPIRATION_JITTER: Timestamp = 30 * HUNDREDS_OF_NANOS_IN_A_SECOND;

/// Handles alive at once: one draining, one streaming.
pub const MAX_LIVE_UPLOAD_HANDLES: usize = 2;

/// Ended handles kept so late acks and a final read still resolve.
pub const MAX_FINISHED_UPLOAD_HANDLES: usize = 2;

/// Validate a granted token expiration and apply jitter.
///
/// The stored expiration lies in `(granted - MAX_TOKEN_EXPIRATION_JITTER, granted]`
/// so that many clients granted the same expiration do not rotate together.
pub fn jittered_expiration(
    granted: Timestamp,
    now: Timestamp,
    random: u64,
) -> StreamResult<Timestamp> {
    if granted < now.saturating_add(MIN_STREAMING_TOKEN_EXPIRATION_DURATION) {
        return Err(StreamError::InvalidTokenExpiration {
            expiration: granted,
            now,
        });
    }

    Ok(granted - random % MAX_TOKEN_EXPIRATION_JITTER)
}

/// Whether a handle holding `expiration` must be rotated at `now`.
pub fn needs_rotation(expiration: Timestamp, now: Timestamp) -> bool {
    now.saturating_add(STREAMING_TOKEN_EXPIRATION_GRACE_PERIOD) >= expiration
}

/// One streaming session bound to an upload handle.
#[derive(Debug, Clone)]
pub struct UploadSession {
    pub handle: UploadHandle,
    pub state: UploadState,

    /// First view index the handle delivers. Set on activation.
    pub start_index: Option<u64>,

    /// Exclusive index the handle stops at once draining.
    pub end_index: Option<u64>,

    pub token_expiration: Timestamp,
    pub created_at: Timestamp,

    /// Last time bytes were handed out.
    pub last_get_stream_data_time: Option<Timestamp>,

    pub last_buffering_ack_time: Timestamp,
    pub stale_reported: bool,
    pub error_acked: bool,

    /// Newest fragment start known to be persisted.
    pub last_persisted_fragment: Option<u64>,
    pub last_persisted_timestamp: Option<Timestamp>,

    /// Stream header still owed to the consumer.
    pub header: Bytes,
    pub header_offset: usize,
}

impl UploadSession {
    fn new(handle: UploadHandle, header: Bytes, token_expiration: Timestamp, now: Timestamp) -> Self {
        Self {
            handle,
            state: UploadState::New,
            start_index: None,
            end_index: None,
            token_expiration,
            created_at: now,
            last_get_stream_data_time: None,
            last_buffering_ack_time: now,
            stale_reported: false,
            error_acked: false,
            last_persisted_fragment: None,
            last_persisted_timestamp: None,
            header,
            header_offset: 0,
        }
    }

    pub fn is_active(&self) -> bool {
        self.start_index.is_some()
    }

    /// Whether the handle still has header bytes to send.
    pub fn header_pending(&self) -> bool {
        self.header_offset < self.header.len()
    }

    /// Copy pending header bytes into `buf`. Returns the count written.
    pub fn read_header(&mut self, buf: &mut [u8]) -> usize {
        let remaining = &self.header[self.header_offset..];
        let count = remaining.len().min(buf.len());
        buf[..count].copy_from_slice(&remaining[..count]);
        self.header_offset += count;
        count
    }

    /// End the handle with `result`.
    pub fn terminate(&mut self, result: ServiceCallResult) {
        debug!(upload_handle = %self.handle, ?result, "Terminating upload handle");
        self.state = UploadState::Terminated { result };
    }
}

/// Upload handles of one stream, oldest first.
#[derive(Debug, Default)]
pub struct SessionManager {
    sessions: BTreeMap<UploadHandle, UploadSession>,
    next_handle: u64,
    created: u64,
}

impl SessionManager {
    pub fn new() -> Self {
        Self {
            sessions: BTreeMap::new(),
            next_handle: 1,
            created: 0,
        }
    }

    /// Register a new handle in the `New` state.
    pub fn create(&mut self, header: Bytes, token_expiration: Timestamp, now: Timestamp) -> UploadHandle {
        let handle = UploadHandle(self.next_handle);
        self.next_handle += 1;
        self.created += 1;
        self.sessions
            .insert(handle, UploadSession::new(handle, header, token_expiration, now));
        debug!(upload_handle = %handle, live = self.live_count(), "Created upload handle");
        handle
    }

    pub fn get(&self, handle: UploadHandle) -> StreamResult<&UploadSession> {
        self.sessions
            .get(&handle)
            .ok_or(StreamError::InvalidUploadHandle(handle))
    }

    pub fn get_mut(&mut self, handle: UploadHandle) -> StreamResult<&mut UploadSession> {
        self.sessions
            .get_mut(&handle)
            .ok_or(StreamError::InvalidUploadHandle(handle))
    }

    /// Handles occupying a live slot.
    pub fn live_count(&self) -> usize {
        self.sessions.values().filter(|s| s.state.is_live()).count()
    }

    /// Live handles that are not draining.
    pub fn streaming_count(&self) -> usize {
        self.sessions
            .values()
            .filter(|s| matches!(s.state, UploadState::New | UploadState::Streaming))
            .count()
    }

    /// Newest handle that receives new content.
    pub fn current(&self) -> Option<&UploadSession> {
        self.sessions
            .values()
            .rev()
            .find(|s| matches!(s.state, UploadState::New | UploadState::Streaming))
    }

    /// Whether a live handle older than `handle` exists.
    pub fn has_older_live(&self, handle: UploadHandle) -> bool {
        self.sessions
            .range(..handle)
            .any(|(_, s)| s.state.is_live())
    }

    /// Oldest live handle that is not yet delivering.
    pub fn oldest_waiting(&self) -> Option<UploadHandle> {
        self.sessions
            .values()
            .find(|s| s.state.is_live() && !s.is_active())
            .map(|s| s.handle)
    }

    pub fn iter(&self) -> impl Iterator<Item = &UploadSession> {
        self.sessions.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut UploadSession> {
        self.sessions.values_mut()
    }

    /// Forget a handle.
    pub fn retire(&mut self, handle: UploadHandle) -> Option<UploadSession> {
        let session = self.sessions.remove(&handle);
        if session.is_some() {
            debug!(upload_handle = %handle, "Retired upload handle");
        }
        session
    }

    /// Forget the oldest ended handles beyond [`MAX_FINISHED_UPLOAD_HANDLES`].
    pub fn prune_finished(&mut self) {
        let finished: Vec<UploadHandle> = self
            .sessions
            .values()
            .filter(|s| !s.state.is_live())
            .map(|s| s.handle)
            .collect();
        let excess = finished.len().saturating_sub(MAX_FINISHED_UPLOAD_HANDLES);
        for handle in finished.into_iter().take(excess) {
            self.retire(handle);
        }
    }

    /// Handles created since the stream started.
    pub fn created(&self) -> u64 {
        self.created
    }

    pub fn clear(&mut self) {
        self.sessions.clear();
    }
}
