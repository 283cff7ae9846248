//! Pass-through packager.
//!
//! Frames are written verbatim so the upload stream is exactly the
//! concatenation of the producer payloads. The stream header carries the
//! codec private data of every track in declaration order. Fragment
//! metadata is written as `name=value` lines ahead of the fragment's first
//! payload.

use bytes::{BufMut, Bytes, BytesMut};
use tracing::trace;

use ingest_proto::{Frame, Timestamp, TrackInfo};

use crate::error::EncoderError;
use crate::metadata::FragmentMetadata;
use crate::{EncoderResult, FrameEncoder, TrackTable};

/// Writes frame payloads verbatim.
#[derive(Debug, Clone)]
pub struct PassThroughEncoder {
    tracks: TrackTable,
}

impl PassThroughEncoder {
    pub fn new(tracks: &[TrackInfo]) -> Self {
        Self {
            tracks: TrackTable::new(tracks),
        }
    }
}

impl FrameEncoder for PassThroughEncoder {
    fn stream_header(&self) -> Bytes {
        let mut header = BytesMut::new();
        for (_, _, cpd) in self.tracks.iter() {
            header.put_slice(cpd);
        }
        header.freeze()
    }

    fn encode_frame(&mut self, frame: &Frame, metadata: &[FragmentMetadata]) -> EncoderResult<Bytes> {
        if !self.tracks.contains(frame.track_id) {
            return Err(EncoderError::UnknownTrack(frame.track_id));
        }

        if metadata.is_empty() {
            return Ok(frame.payload.clone());
        }

        let mut out = BytesMut::new();
        for entry in metadata {
            out.put_slice(entry.name.as_bytes());
            out.put_u8(b'=');
            out.put_slice(entry.value.as_bytes());
            out.put_u8(b'\n');
        }
        out.put_slice(&frame.payload);

        trace!(entries = metadata.len(), "Prefixed fragment metadata");
        Ok(out.freeze())
    }

    fn encode_end_of_fragment(&mut self, _track_id: u64, _timestamp: Timestamp) -> Bytes {
        Bytes::new()
    }

    fn set_codec_private_data(&mut self, track_id: u64, data: Bytes) -> EncoderResult<()> {
        self.tracks.set(track_id, data)
    }

    fn codec_private_data(&self, track_id: u64) -> Option<Bytes> {
        self.tracks.get(track_id)
    }

    fn name(&self) -> &'static str {
        "pass-through"
    }
}
