//! Frame packaging for the ingestion core.
//!
//! The container format is opaque to the view and the ack processor; this
//! crate only turns frames, fragment metadata and codec private data into
//! the bytes handed to upload handles.

mod error;
mod framed;
mod metadata;
mod passthrough;

pub use error::EncoderError;
pub use framed::FramedEncoder;
pub use metadata::{
    validate_metadata, FragmentMetadata, MetadataQueue, MAX_FRAGMENT_METADATA_COUNT,
    MAX_FRAGMENT_METADATA_NAME_LEN, MAX_FRAGMENT_METADATA_VALUE_LEN, RESERVED_METADATA_PREFIX,
};
pub use passthrough::PassThroughEncoder;

use bytes::Bytes;
use ingest_proto::{Frame, Timestamp, TrackInfo};

/// Result type for encoder operations.
pub type EncoderResult<T> = Result<T, EncoderError>;

/// Largest codec private data accepted for a track.
pub const MAX_CODEC_PRIVATE_DATA_SIZE: usize = 1024 * 1024;

/// Available packagers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EncoderKind {
    /// Payload bytes verbatim.
    #[default]
    PassThrough,

    /// Length-prefixed records carrying timestamps and track ids.
    Framed,
}

/// Trait for frame packagers.
pub trait FrameEncoder: Send {
    /// Bytes sent at the start of every upload handle.
    fn stream_header(&self) -> Bytes;

    /// Package one frame. `metadata` is non-empty only for fragment starts.
    fn encode_frame(&mut self, frame: &Frame, metadata: &[FragmentMetadata]) -> EncoderResult<Bytes>;

    /// Package an explicit end-of-fragment marker.
    fn encode_end_of_fragment(&mut self, track_id: u64, timestamp: Timestamp) -> Bytes;

    /// Replace the codec private data of a track.
    fn set_codec_private_data(&mut self, track_id: u64, data: Bytes) -> EncoderResult<()>;

    /// Current codec private data of a track.
    fn codec_private_data(&self, track_id: u64) -> Option<Bytes>;

    /// Encoder name for diagnostics.
    fn name(&self) -> &'static str;
}

/// Create a packager for the given tracks.
pub fn create_encoder(kind: EncoderKind, tracks: &[TrackInfo]) -> Box<dyn FrameEncoder> {
    tracing::debug!(?kind, tracks = tracks.len(), "Creating frame encoder");
    match kind {
        EncoderKind::PassThrough => Box::new(PassThroughEncoder::new(tracks)),
        EncoderKind::Framed => Box::new(FramedEncoder::new(tracks)),
    }
}

/// Per-track codec private data shared by the packagers.
#[derive(Debug, Clone, Default)]
pub(crate) struct TrackTable {
    tracks: Vec<(u64, String, Bytes)>,
}

impl TrackTable {
    pub(crate) fn new(tracks: &[TrackInfo]) -> Self {
        Self {
            tracks: tracks
                .iter()
                .map(|t| {
                    (
                        t.track_id,
                        t.name.clone(),
                        Bytes::from(t.codec_private_data.clone()),
                    )
                })
                .collect(),
        }
    }

    pub(crate) fn set(&mut self, track_id: u64, data: Bytes) -> EncoderResult<()> {
        if data.len() > MAX_CODEC_PRIVATE_DATA_SIZE {
            return Err(EncoderError::CodecPrivateDataTooLarge {
                size: data.len(),
                max: MAX_CODEC_PRIVATE_DATA_SIZE,
            });
        }

        let entry = self
            .tracks
            .iter_mut()
            .find(|(id, _, _)| *id == track_id)
            .ok_or(EncoderError::UnknownTrack(track_id))?;
        entry.2 = data;
        Ok(())
    }

    pub(crate) fn get(&self, track_id: u64) -> Option<Bytes> {
        self.tracks
            .iter()
            .find(|(id, _, _)| *id == track_id)
            .map(|(_, _, cpd)| cpd.clone())
    }

    pub(crate) fn contains(&self, track_id: u64) -> bool {
        self.tracks.iter().any(|(id, _, _)| *id == track_id)
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &(u64, String, Bytes)> {
        self.tracks.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracks() -> Vec<TrackInfo> {
        vec![TrackInfo {
            track_id: 1,
            name: "video".into(),
            codec_id: "V_MPEG4/ISO/AVC".into(),
            codec_private_data: Vec::new(),
        }]
    }

    #[test]
    fn test_codec_private_data_limits() {
        let mut encoder = create_encoder(EncoderKind::PassThrough, &tracks());

        assert_eq!(
            encoder.set_codec_private_data(9, Bytes::from_static(b"x")),
            Err(EncoderError::UnknownTrack(9))
        );
        assert!(matches!(
            encoder.set_codec_private_data(1, Bytes::from(vec![0u8; MAX_CODEC_PRIVATE_DATA_SIZE + 1])),
            Err(EncoderError::CodecPrivateDataTooLarge { .. })
        ));

        encoder
            .set_codec_private_data(1, Bytes::from_static(b"\x01\x64"))
            .unwrap();
        assert_eq!(encoder.codec_private_data(1).unwrap().as_ref(), b"\x01\x64");
    }

    #[test]
    fn test_factory_names() {
        assert_eq!(create_encoder(EncoderKind::PassThrough, &tracks()).name(), "pass-through");
        assert_eq!(create_encoder(EncoderKind::Framed, &tracks()).name(), "framed");
    }
}
