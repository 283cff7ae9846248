//! Fragment acknowledgment processing.

use std::ops::Range;

use tracing::{debug, trace, warn};

use ingest_proto::{AckKind, AckState, FragmentAck, Timestamp};
use ingest_view::{ContentView, ViewError};

use crate::error::StreamError;
use crate::session::UploadSession;
use crate::StreamResult;

/// Effect of an applied ack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// The fragment starting at `fragment` moved forward. `released` items left the store.
    Applied { fragment: u64, released: usize },

    /// Persisted content that was already released.
    AlreadyReleased,

    /// The handle failed; the next handle restarts at `restart`.
    Rollback { fragment: Option<u64>, restart: u64 },
}

/// Applies acks to the view on behalf of one stream.
#[derive(Debug, Clone)]
pub struct AckProcessor {
    replay_duration: Timestamp,
}

impl AckProcessor {
    pub fn new(replay_duration: Timestamp) -> Self {
        Self { replay_duration }
    }

    /// View range an ack from `session` may refer to.
    fn window(view: &ContentView, session: &UploadSession) -> StreamResult<Range<u64>> {
        let start = session
            .start_index
            .ok_or(StreamError::InvalidUploadHandle(session.handle))?;
        let end = session.end_index.unwrap_or_else(|| view.head_index());
        Ok(start.max(view.tail_index())..end)
    }

    /// Apply `ack` received on `session`'s connection.
    pub fn apply(
        &self,
        view: &mut ContentView,
        session: &mut UploadSession,
        ack: &FragmentAck,
        now: Timestamp,
    ) -> StreamResult<AckOutcome> {
        let window = Self::window(view, session)?;
        trace!(
            upload_handle = %session.handle,
            kind = ?ack.kind,
            timestamp = ?ack.timestamp,
            sequence_number = ?ack.sequence_number,
            "Applying ack"
        );

        if ack.kind == AckKind::Error {
            return self.apply_error(view, session, ack, window);
        }

        let timestamp = ack
            .timestamp
            .ok_or(ViewError::AckTimestampNotInViewWindow(0))?;

        let fragment = match view.fragment_for_timestamp(timestamp, window) {
            Ok(fragment) => fragment,
            Err(ViewError::AckTimestampNotInViewWindow(_))
                if session
                    .last_persisted_timestamp
                    .is_some_and(|persisted| timestamp <= persisted) =>
            {
                trace!(timestamp, "Ack for content already released");
                return Ok(AckOutcome::AlreadyReleased);
            }
            Err(e) => return Err(e.into()),
        };

        let state = match ack.kind {
            AckKind::Buffering => {
                session.last_buffering_ack_time = now;
                session.stale_reported = false;
                AckState::Buffering
            }
            AckKind::Received => AckState::Received,
            AckKind::Persisted => AckState::Persisted,
            AckKind::Error => AckState::Error,
        };
        view.apply_fragment_ack_state(fragment, state)?;

        let mut released = 0;
        if state == AckState::Persisted {
            session.last_persisted_fragment = session.last_persisted_fragment.max(Some(fragment));
            session.last_persisted_timestamp =
                session.last_persisted_timestamp.max(Some(timestamp));
            released = Self::release_persisted(view);
        }

        Ok(AckOutcome::Applied { fragment, released })
    }

    /// Free the contiguous persisted prefix of the view.
    fn release_persisted(view: &mut ContentView) -> usize {
        let mut upto = view.tail_index();
        while let Some(start) = view.fragment_start_at_or_after(upto) {
            if start != upto || view.fragment_ack_state(start) != Ok(AckState::Persisted) {
                break;
            }
            let end = view.fragment_end(start);
            // The open fragment may still grow.
            if end == view.head_index() {
                break;
            }
            upto = end;
        }

        let released = view.trim_tail(upto);
        if released > 0 {
            debug!(released, tail = view.tail_index(), "Released persisted content");
        }
        released
    }

    fn apply_error(
        &self,
        view: &mut ContentView,
        session: &mut UploadSession,
        ack: &FragmentAck,
        window: Range<u64>,
    ) -> StreamResult<AckOutcome> {
        if session.error_acked {
            return Err(StreamError::DuplicateErrorAck(session.handle));
        }

        let fragment = match ack.timestamp {
            Some(timestamp) => Some(view.fragment_for_timestamp(timestamp, window.clone())?),
            None => view
                .fragment_starts(window.clone())
                .into_iter()
                .find(|start| view.fragment_ack_state(*start) != Ok(AckState::Persisted)),
        };

        let restart = match fragment {
            Some(failed) => {
                let persisted_after = view
                    .fragment_starts(failed + 1..window.end)
                    .into_iter()
                    .filter(|start| view.fragment_ack_state(*start) == Ok(AckState::Persisted))
                    .max();
                match persisted_after {
                    Some(persisted) => view.fragment_end(persisted),
                    None => failed,
                }
            }
            None => window.end.min(view.head_index()),
        };

        self.check_replay_window(view, restart)?;

        if let Some(failed) = fragment {
            view.apply_fragment_ack_state(failed, AckState::Error)?;
        }
        session.error_acked = true;
        warn!(
            upload_handle = %session.handle,
            result = ?ack.result,
            ?fragment,
            restart,
            "Error ack, rolling back"
        );

        Ok(AckOutcome::Rollback { fragment, restart })
    }

    /// Reject a restart point older than the replay duration.
    pub fn check_replay_window(&self, view: &ContentView, restart: u64) -> StreamResult<()> {
        let (Ok(item), Some(newest)) = (view.item_at(restart), view.last_item()) else {
            return Ok(());
        };

        let oldest = newest.timestamp.saturating_sub(self.replay_duration);
        if item.timestamp < oldest {
            return Err(StreamError::RollbackOutsideReplayWindow {
                requested: item.timestamp,
                oldest,
            });
        }
        Ok(())
    }
}
