//! Length-prefixed record packager.
//!
//! Layout (big endian):
//! - header: `b"INGS"`, version `u8`, track count `u16`, then per track the
//!   id `u64`, name length `u16` + name, codec private data length `u32` +
//!   data.
//! - frame record: tag `0x01`, track `u64`, dts `u64`, pts `u64`, duration
//!   `u64`, flags `u8`, payload length `u32` + payload.
//! - metadata record: tag `0x02`, name length `u16` + name, value length
//!   `u16` + value. Written immediately before the fragment-start frame.
//! - end-of-fragment record: tag `0x03`, track `u64`, timestamp `u64`.

use bytes::{BufMut, Bytes, BytesMut};

use ingest_proto::{Frame, Timestamp, TrackInfo};

use crate::error::EncoderError;
use crate::metadata::FragmentMetadata;
use crate::{EncoderResult, FrameEncoder, TrackTable};

const MAGIC: &[u8; 4] = b"INGS";
const VERSION: u8 = 1;

const TAG_FRAME: u8 = 0x01;
const TAG_METADATA: u8 = 0x02;
const TAG_END_OF_FRAGMENT: u8 = 0x03;

/// Fixed bytes of a frame record before the payload.
const FRAME_RECORD_OVERHEAD: usize = 1 + 8 * 4 + 1 + 4;

/// Writes self-describing length-prefixed records.
#[derive(Debug, Clone)]
pub struct FramedEncoder {
    tracks: TrackTable,
}

impl FramedEncoder {
    pub fn new(tracks: &[TrackInfo]) -> Self {
        Self {
            tracks: TrackTable::new(tracks),
        }
    }
}

impl FrameEncoder for FramedEncoder {
    fn stream_header(&self) -> Bytes {
        let tracks: Vec<_> = self.tracks.iter().collect();
        let mut header = BytesMut::new();
        header.put_slice(MAGIC);
        header.put_u8(VERSION);
        header.put_u16(tracks.len() as u16);

        for (id, name, cpd) in tracks {
            header.put_u64(*id);
            header.put_u16(name.len() as u16);
            header.put_slice(name.as_bytes());
            header.put_u32(cpd.len() as u32);
            header.put_slice(cpd);
        }

        header.freeze()
    }

    fn encode_frame(&mut self, frame: &Frame, metadata: &[FragmentMetadata]) -> EncoderResult<Bytes> {
        if !self.tracks.contains(frame.track_id) {
            return Err(EncoderError::UnknownTrack(frame.track_id));
        }

        let payload_len = u32::try_from(frame.payload.len())
            .map_err(|_| EncoderError::Encoding(format!("payload of {} bytes", frame.payload.len())))?;

        let mut out = BytesMut::with_capacity(FRAME_RECORD_OVERHEAD + frame.payload.len());

        for entry in metadata {
            out.put_u8(TAG_METADATA);
            out.put_u16(entry.name.len() as u16);
            out.put_slice(entry.name.as_bytes());
            out.put_u16(entry.value.len() as u16);
            out.put_slice(entry.value.as_bytes());
        }

        out.put_u8(TAG_FRAME);
        out.put_u64(frame.track_id);
        out.put_u64(frame.decoding_ts);
        out.put_u64(frame.presentation_ts);
        out.put_u64(frame.duration);
        out.put_u8(frame.flags.bits() as u8);
        out.put_u32(payload_len);
        out.put_slice(&frame.payload);

        Ok(out.freeze())
    }

    fn encode_end_of_fragment(&mut self, track_id: u64, timestamp: Timestamp) -> Bytes {
        let mut out = BytesMut::with_capacity(17);
        out.put_u8(TAG_END_OF_FRAGMENT);
        out.put_u64(track_id);
        out.put_u64(timestamp);
        out.freeze()
    }

    fn set_codec_private_data(&mut self, track_id: u64, data: Bytes) -> EncoderResult<()> {
        self.tracks.set(track_id, data)
    }

    fn codec_private_data(&self, track_id: u64) -> Option<Bytes> {
        self.tracks.get(track_id)
    }

    fn name(&self) -> &'static str {
        "framed"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ingest_proto::FrameFlags;

    fn encoder() -> FramedEncoder {
        FramedEncoder::new(&[TrackInfo {
            track_id: 1,
            name: "v".into(),
            codec_id: "V_MPEG4/ISO/AVC".into(),
            codec_private_data: vec![0xAA, 0xBB],
        }])
    }

    #[test]
    fn test_header_layout() {
        let header = encoder().stream_header();
        assert_eq!(&header[..4], MAGIC);
        assert_eq!(header[4], VERSION);
        assert_eq!(&header[5..7], &[0, 1]);
        // id + name len + name + cpd len + cpd
        assert_eq!(header.len(), 7 + 8 + 2 + 1 + 4 + 2);
        assert_eq!(&header[header.len() - 2..], &[0xAA, 0xBB]);
    }

    #[test]
    fn test_frame_record_layout() {
        let mut encoder = encoder();
        let frame = Frame::new(0, 1, FrameFlags::KEY_FRAME, 10, 20, 5, Bytes::from_static(b"xyz"));
        let record = encoder.encode_frame(&frame, &[]).unwrap();

        assert_eq!(record.len(), FRAME_RECORD_OVERHEAD + 3);
        assert_eq!(record[0], TAG_FRAME);
        assert_eq!(&record[9..17], &10u64.to_be_bytes());
        assert_eq!(&record[17..25], &20u64.to_be_bytes());
        assert_eq!(record[33], FrameFlags::KEY_FRAME.bits() as u8);
        assert_eq!(&record[record.len() - 3..], b"xyz");
    }

    #[test]
    fn test_metadata_precedes_frame() {
        let mut encoder = encoder();
        let frame = Frame::new(0, 1, FrameFlags::KEY_FRAME, 0, 0, 1, Bytes::new());
        let metadata = [FragmentMetadata {
            name: "a".into(),
            value: "b".into(),
            persistent: true,
        }];
        let record = encoder.encode_frame(&frame, &metadata).unwrap();

        assert_eq!(record[0], TAG_METADATA);
        assert_eq!(&record[1..3], &[0, 1]);
        assert_eq!(record[3], b'a');
        assert_eq!(record[7], TAG_FRAME);
    }

    #[test]
    fn test_end_of_fragment_record() {
        let record = encoder().encode_end_of_fragment(1, 99);
        assert_eq!(record.len(), 17);
        assert_eq!(record[0], TAG_END_OF_FRAGMENT);
        assert_eq!(&record[9..], &99u64.to_be_bytes());
    }
}
