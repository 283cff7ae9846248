//! Multi-track frame ordering.

use std::collections::{BTreeMap, VecDeque};

use tracing::trace;

use ingest_proto::{Frame, FrameOrderMode, Timestamp, TrackInfo, HUNDREDS_OF_NANOS_IN_A_MILLISECOND};

/// Interleaves frames from several tracks by timestamp before they reach the view.
#[derive(Debug)]
pub struct FrameOrderCoordinator {
    mode: FrameOrderMode,
    queues: BTreeMap<u64, VecDeque<Frame>>,
    last_emitted: Option<Timestamp>,
}

impl FrameOrderCoordinator {
    pub fn new(mode: FrameOrderMode, tracks: &[TrackInfo]) -> Self {
        Self {
            mode,
            queues: tracks
                .iter()
                .map(|track| (track.track_id, VecDeque::new()))
                .collect(),
            last_emitted: None,
        }
    }

    pub fn mode(&self) -> FrameOrderMode {
        self.mode
    }

    fn uses_pts(&self) -> bool {
        matches!(
            self.mode,
            FrameOrderMode::MultiTrackPts | FrameOrderMode::MultiTrackPtsOneMsCompensation
        )
    }

    fn compensates(&self) -> bool {
        matches!(
            self.mode,
            FrameOrderMode::MultiTrackDtsOneMsCompensation
                | FrameOrderMode::MultiTrackPtsOneMsCompensation
        )
    }

    fn sort_key(&self, frame: &Frame) -> Timestamp {
        if self.uses_pts() {
            frame.presentation_ts
        } else {
            frame.decoding_ts
        }
    }

    /// Accept a frame; returns the frames now ready, in output order.
    pub fn push(&mut self, frame: Frame) -> Vec<Frame> {
        if self.mode == FrameOrderMode::PassThrough {
            return vec![frame];
        }

        if frame.is_end_of_fragment() {
            let mut ready = self.flush();
            ready.push(frame);
            return ready;
        }

        match self.queues.get_mut(&frame.track_id) {
            Some(queue) => queue.push_back(frame),
            // Unknown tracks are rejected before reaching the coordinator.
            None => return vec![frame],
        }

        let mut ready = Vec::new();
        while self.queues.values().all(|queue| !queue.is_empty()) {
            match self.pop_min() {
                Some(frame) => ready.push(frame),
                None => break,
            }
        }
        ready
    }

    /// Drain every queued frame in order.
    pub fn flush(&mut self) -> Vec<Frame> {
        let mut ready = Vec::new();
        while let Some(frame) = self.pop_min() {
            ready.push(frame);
        }
        ready
    }

    /// Number of frames held back.
    pub fn pending(&self) -> usize {
        self.queues.values().map(VecDeque::len).sum()
    }

    fn pop_min(&mut self) -> Option<Frame> {
        let track_id = self
            .queues
            .iter()
            .filter_map(|(track_id, queue)| queue.front().map(|frame| (*track_id, frame)))
            .min_by_key(|(track_id, frame)| (self.sort_key(frame), !frame.is_key_frame(), *track_id))
            .map(|(track_id, _)| track_id)?;

        let mut frame = self.queues.get_mut(&track_id)?.pop_front()?;

        if self.compensates() && self.last_emitted == Some(self.sort_key(&frame)) {
            trace!(track_id, timestamp = self.sort_key(&frame), "Shifting colliding frame");
            frame.decoding_ts += HUNDREDS_OF_NANOS_IN_A_MILLISECOND;
            frame.presentation_ts += HUNDREDS_OF_NANOS_IN_A_MILLISECOND;
        }
        self.last_emitted = Some(self.sort_key(&frame));
        Some(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use ingest_proto::FrameFlags;
    use proptest::prelude::*;

    const MS: Timestamp = HUNDREDS_OF_NANOS_IN_A_MILLISECOND;

    fn tracks() -> Vec<TrackInfo> {
        vec![
            TrackInfo {
                track_id: 1,
                name: "video".into(),
                codec_id: "V_MPEG4/ISO/AVC".into(),
                codec_private_data: Vec::new(),
            },
            TrackInfo {
                track_id: 2,
                name: "audio".into(),
                codec_id: "A_AAC".into(),
                codec_private_data: Vec::new(),
            },
        ]
    }

    fn frame(track_id: u64, ts_ms: u64, key: bool) -> Frame {
        let flags = if key {
            FrameFlags::KEY_FRAME
        } else {
            FrameFlags::empty()
        };
        Frame::new(0, track_id, flags, ts_ms * MS, ts_ms * MS, 10 * MS, Bytes::new())
    }

    fn order(frames: &[Frame]) -> Vec<(u64, Timestamp)> {
        frames
            .iter()
            .map(|f| (f.track_id, f.decoding_ts / MS))
            .collect()
    }

    #[test]
    fn test_pass_through_emits_immediately() {
        let mut coordinator = FrameOrderCoordinator::new(FrameOrderMode::PassThrough, &tracks());
        assert_eq!(coordinator.push(frame(1, 10, true)).len(), 1);
        assert_eq!(coordinator.pending(), 0);
    }

    #[test]
    fn test_waits_for_every_track() {
        let mut coordinator = FrameOrderCoordinator::new(FrameOrderMode::MultiTrackDts, &tracks());
        assert!(coordinator.push(frame(1, 0, true)).is_empty());
        assert!(coordinator.push(frame(1, 40, false)).is_empty());

        let ready = coordinator.push(frame(2, 20, false));
        assert_eq!(order(&ready), vec![(1, 0), (2, 20)]);
        assert_eq!(coordinator.pending(), 1);

        assert_eq!(order(&coordinator.flush()), vec![(1, 40)]);
    }

    #[test]
    fn test_ties_favour_key_frames() {
        let mut coordinator = FrameOrderCoordinator::new(FrameOrderMode::MultiTrackDts, &tracks());
        coordinator.push(frame(2, 0, false));
        let ready = coordinator.push(frame(1, 0, true));
        assert_eq!(order(&ready), vec![(1, 0), (2, 0)]);
    }

    #[test]
    fn test_one_ms_compensation() {
        let mut coordinator = FrameOrderCoordinator::new(
            FrameOrderMode::MultiTrackDtsOneMsCompensation,
            &tracks(),
        );
        coordinator.push(frame(1, 0, true));
        let ready = coordinator.push(frame(2, 0, false));
        assert_eq!(order(&ready), vec![(1, 0), (2, 1)]);
    }

    #[test]
    fn test_end_of_fragment_flushes() {
        let mut coordinator = FrameOrderCoordinator::new(FrameOrderMode::MultiTrackPts, &tracks());
        coordinator.push(frame(1, 0, true));
        let ready = coordinator.push(Frame::end_of_fragment(1, 10 * MS));
        assert_eq!(ready.len(), 2);
        assert!(ready[1].is_end_of_fragment());
        assert_eq!(coordinator.pending(), 0);
    }

    proptest! {
        #[test]
        fn test_multi_track_output_is_ordered(
            steps in proptest::collection::vec((1u64..=2, 0u64..20), 1..64),
        ) {
            let mut coordinator = FrameOrderCoordinator::new(FrameOrderMode::MultiTrackDts, &tracks());
            let mut clocks = [0u64; 3];
            let mut out = Vec::new();
            for (track_id, gap) in steps {
                clocks[track_id as usize] += gap;
                out.extend(coordinator.push(frame(track_id, clocks[track_id as usize], false)));
            }
            out.extend(coordinator.flush());

            prop_assert_eq!(coordinator.pending(), 0);
            prop_assert!(out.windows(2).all(|w| w[0].decoding_ts <= w[1].decoding_ts));
        }
    }
}
