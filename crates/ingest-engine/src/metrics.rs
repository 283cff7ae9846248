//! Stream metrics collection.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use tracing::trace;

use ingest_proto::{StreamMetrics, Timestamp, HUNDREDS_OF_NANOS_IN_A_SECOND};

/// View occupancy sampled under the stream lock.
#[derive(Debug, Clone, Copy, Default)]
pub struct ViewUsage {
    pub current_duration: Timestamp,
    pub overall_duration: Timestamp,
    pub current_size: u64,
    pub overall_size: u64,
    pub upload_handles_created: u64,
    pub live_upload_handles: u32,
}

#[derive(Debug, Clone, Copy)]
struct RateSample {
    at: Timestamp,
    frames: u64,
    bytes: u64,
}

/// Counters for one stream.
pub struct MetricsCollector {
    frames: AtomicU64,
    bytes_sent: AtomicU64,
    dropped_frames: AtomicU64,
    dropped_fragments: AtomicU64,
    error_acks: AtomicU64,
    persisted_acks: AtomicU64,
    last_sample: RwLock<RateSample>,
}

impl MetricsCollector {
    pub fn new(now: Timestamp) -> Self {
        Self {
            frames: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            dropped_frames: AtomicU64::new(0),
            dropped_fragments: AtomicU64::new(0),
            error_acks: AtomicU64::new(0),
            persisted_acks: AtomicU64::new(0),
            last_sample: RwLock::new(RateSample {
                at: now,
                frames: 0,
                bytes: 0,
            }),
        }
    }

    /// Record a frame accepted into the view.
    pub fn record_frame(&self) {
        self.frames.fetch_add(1, Ordering::Relaxed);
    }

    /// Record bytes handed to a consumer.
    pub fn record_bytes_sent(&self, bytes: u64) {
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_dropped_frame(&self) {
        self.dropped_frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped_fragment(&self) {
        self.dropped_fragments.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error_ack(&self) {
        self.error_acks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_persisted_ack(&self) {
        self.persisted_acks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dropped_frames(&self) -> u64 {
        self.dropped_frames.load(Ordering::Relaxed)
    }

    /// Build a snapshot. Rates cover the time since the previous snapshot.
    pub fn snapshot(&self, now: Timestamp, usage: ViewUsage) -> StreamMetrics {
        let frames = self.frames.load(Ordering::Relaxed);
        let bytes = self.bytes_sent.load(Ordering::Relaxed);

        let (frame_rate, transfer_rate) = {
            let mut last = self.last_sample.write();
            let elapsed = now.saturating_sub(last.at);
            let rates = if elapsed > 0 {
                let seconds = elapsed as f64 / HUNDREDS_OF_NANOS_IN_A_SECOND as f64;
                (
                    (frames - last.frames) as f64 / seconds,
                    ((bytes - last.bytes) as f64 / seconds) as u64,
                )
            } else {
                (0.0, 0)
            };
            *last = RateSample {
                at: now,
                frames,
                bytes,
            };
            rates
        };

        trace!(frame_rate, transfer_rate, "Metrics snapshot");

        StreamMetrics {
            current_view_duration: usage.current_duration,
            overall_view_duration: usage.overall_duration,
            current_view_size: usage.current_size,
            overall_view_size: usage.overall_size,
            current_frame_rate: frame_rate,
            current_transfer_rate: transfer_rate,
            dropped_frames: self.dropped_frames.load(Ordering::Relaxed),
            dropped_fragments: self.dropped_fragments.load(Ordering::Relaxed),
            error_acks: self.error_acks.load(Ordering::Relaxed),
            persisted_acks: self.persisted_acks.load(Ordering::Relaxed),
            upload_handles_created: usage.upload_handles_created,
            live_upload_handles: usage.live_upload_handles,
        }
    }
}
