//! Stream and client configuration.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{Timestamp, HUNDREDS_OF_NANOS_IN_A_MILLISECOND};

/// Maximum stream name length.
pub const MAX_STREAM_NAME_LEN: usize = 256;

/// Extra view slots on top of the frame count implied by the buffer duration.
const VIEW_ITEM_HEADROOM: usize = 64;

/// Configuration errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid stream name: {0}")]
    InvalidStreamName(String),

    #[error("Stream must declare at least one track")]
    NoTracks,

    #[error("Duplicate track id: {0}")]
    DuplicateTrackId(u64),

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },

    #[error("Failed to parse configuration: {0}")]
    Parse(String),
}

/// How latency sensitive the stream is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum StreamingType {
    #[default]
    Realtime,
    NearRealtime,
    Offline,
}

/// Behaviour when the content store cannot fit a new frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum StoragePressurePolicy {
    /// Reject the frame with an out-of-memory error.
    Fail,

    /// Evict from the tail per the view overflow policy.
    #[default]
    DropTail,

    /// Block the producer until space frees up or the stream terminates.
    Block,
}

/// Behaviour when the view runs out of item slots or buffer duration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ViewOverflowPolicy {
    /// Evict the oldest single item.
    DropTailViewItem,

    /// Evict the oldest whole fragment.
    #[default]
    DropUntilFragmentStart,
}

/// Serialization order for interleaved tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FrameOrderMode {
    #[default]
    PassThrough,
    MultiTrackDts,
    MultiTrackPts,
    MultiTrackDtsOneMsCompensation,
    MultiTrackPtsOneMsCompensation,
}

/// A track carried by the stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackInfo {
    pub track_id: u64,
    pub name: String,
    pub codec_id: String,

    /// Initial codec private data. May be replaced by a format change.
    #[serde(default)]
    pub codec_private_data: Vec<u8>,
}

/// Configuration for a single stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Remote stream name.
    pub name: String,

    pub streaming_type: StreamingType,

    /// MIME content type (e.g., "video/h264").
    pub content_type: String,

    /// Optional encryption key id for stream creation.
    pub kms_key_id: Option<String>,

    /// Retention requested when creating the stream, in hours.
    pub retention_hours: u32,

    /// Tags applied after creation.
    pub tags: BTreeMap<String, String>,

    /// Tracks multiplexed into the stream.
    pub tracks: Vec<TrackInfo>,

    /// Nominal frame rate, used to size the view.
    pub frame_rate: u32,

    /// Duration of content retained in the view.
    pub buffer_duration_ms: u64,

    /// How far back a rollback may reach.
    pub replay_duration_ms: u64,

    /// Un-sent duration above which latency pressure is reported.
    pub max_latency_ms: u64,

    /// Interval without buffering acks after which the connection is stale.
    pub connection_staleness_ms: u64,

    /// Start fragments on key frames.
    pub key_frame_fragmentation: bool,

    /// Bytes available to the content store.
    pub storage_size_bytes: u64,

    /// Explicit view slot count. Derived from duration and frame rate when absent.
    pub max_view_items: Option<usize>,

    pub storage_pressure_policy: StoragePressurePolicy,

    pub view_overflow_policy: ViewOverflowPolicy,

    pub frame_order_mode: FrameOrderMode,

    /// Roll back and reconnect automatically on recoverable errors.
    pub recover_on_error: bool,

    /// Time allowed for handles to drain on a synchronous stop. Monotonic wall time.
    pub stop_timeout_ms: u64,

    /// Upper bound on a producer blocked by the `Block` pressure policy. Monotonic wall time.
    pub max_blocking_put_ms: Option<u64>,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            streaming_type: StreamingType::Realtime,
            content_type: "video/h264".to_string(),
            kms_key_id: None,
            retention_hours: 2,
            tags: BTreeMap::new(),
            tracks: vec![TrackInfo {
                track_id: 1,
                name: "video".to_string(),
                codec_id: "V_MPEG4/ISO/AVC".to_string(),
                codec_private_data: Vec::new(),
            }],
            frame_rate: 25,
            buffer_duration_ms: 120_000,
            replay_duration_ms: 40_000,
            max_latency_ms: 60_000,
            connection_staleness_ms: 60_000,
            key_frame_fragmentation: true,
            storage_size_bytes: 128 * 1024 * 1024,
            max_view_items: None,
            storage_pressure_policy: StoragePressurePolicy::DropTail,
            view_overflow_policy: ViewOverflowPolicy::DropUntilFragmentStart,
            frame_order_mode: FrameOrderMode::PassThrough,
            recover_on_error: true,
            stop_timeout_ms: 15_000,
            max_blocking_put_ms: None,
        }
    }
}

impl StreamConfig {
    /// Create a configuration with defaults for the given stream name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Parse a configuration from JSON. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() || self.name.len() > MAX_STREAM_NAME_LEN {
            return Err(ConfigError::InvalidStreamName(self.name.clone()));
        }

        if self.tracks.is_empty() {
            return Err(ConfigError::NoTracks);
        }

        let mut ids = HashSet::new();
        for track in &self.tracks {
            if !ids.insert(track.track_id) {
                return Err(ConfigError::DuplicateTrackId(track.track_id));
            }
        }

        if self.frame_rate == 0 {
            return Err(invalid("frame_rate", "must be positive"));
        }

        if self.buffer_duration_ms == 0 {
            return Err(invalid("buffer_duration_ms", "must be positive"));
        }

        if self.replay_duration_ms > self.buffer_duration_ms {
            return Err(invalid(
                "replay_duration_ms",
                "must not exceed the buffer duration",
            ));
        }

        if self.storage_size_bytes == 0 {
            return Err(invalid("storage_size_bytes", "must be positive"));
        }

        if self.max_view_items == Some(0) {
            return Err(invalid("max_view_items", "must be positive"));
        }

        Ok(())
    }

    /// Whether the stream buffers locally without a latency target and retains nothing remotely.
    pub fn is_offline_with_zero_retention(&self) -> bool {
        self.streaming_type == StreamingType::Offline && self.retention_hours == 0
    }

    /// Number of view slots.
    pub fn view_capacity(&self) -> usize {
        self.max_view_items.unwrap_or_else(|| {
            let frames = self.buffer_duration_ms.saturating_mul(self.frame_rate as u64) / 1000;
            (frames as usize).saturating_mul(self.tracks.len()) + VIEW_ITEM_HEADROOM
        })
    }

    pub fn buffer_duration(&self) -> Timestamp {
        self.buffer_duration_ms * HUNDREDS_OF_NANOS_IN_A_MILLISECOND
    }

    pub fn replay_duration(&self) -> Timestamp {
        self.replay_duration_ms * HUNDREDS_OF_NANOS_IN_A_MILLISECOND
    }

    pub fn max_latency(&self) -> Timestamp {
        self.max_latency_ms * HUNDREDS_OF_NANOS_IN_A_MILLISECOND
    }

    pub fn connection_staleness(&self) -> Timestamp {
        self.connection_staleness_ms * HUNDREDS_OF_NANOS_IN_A_MILLISECOND
    }
}

fn invalid(field: &'static str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field,
        reason: reason.to_string(),
    }
}

/// Configuration shared by every stream of a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Maximum concurrently registered streams.
    pub max_stream_count: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            max_stream_count: 16,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert_eq!(StreamConfig::new("camera-1").validate(), Ok(()));
    }

    #[test]
    fn test_rejects_empty_name() {
        assert!(matches!(
            StreamConfig::default().validate(),
            Err(ConfigError::InvalidStreamName(_))
        ));
    }

    #[test]
    fn test_rejects_duplicate_tracks() {
        let mut config = StreamConfig::new("camera-1");
        config.tracks.push(config.tracks[0].clone());
        assert_eq!(config.validate(), Err(ConfigError::DuplicateTrackId(1)));
    }

    #[test]
    fn test_rejects_replay_longer_than_buffer() {
        let mut config = StreamConfig::new("camera-1");
        config.replay_duration_ms = config.buffer_duration_ms + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_view_capacity_from_duration() {
        let mut config = StreamConfig::new("camera-1");
        config.buffer_duration_ms = 10_000;
        config.frame_rate = 30;
        assert_eq!(config.view_capacity(), 300 + VIEW_ITEM_HEADROOM);

        config.max_view_items = Some(8);
        assert_eq!(config.view_capacity(), 8);
    }

    #[test]
    fn test_from_json_fills_defaults() {
        let config =
            StreamConfig::from_json(r#"{"name":"cam","streaming_type":"Offline","retention_hours":0}"#)
                .unwrap();
        assert_eq!(config.name, "cam");
        assert!(config.is_offline_with_zero_retention());
        assert_eq!(config.frame_rate, 25);
    }
}
