//! Error types for the encoder module.

use thiserror::Error;

/// Errors that can occur while packaging frames.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EncoderError {
    /// Codec private data exceeds the allowed size.
    #[error("Codec private data of {size} bytes exceeds the {max} byte limit")]
    CodecPrivateDataTooLarge { size: usize, max: usize },

    /// Track not declared in the stream configuration.
    #[error("Unknown track id: {0}")]
    UnknownTrack(u64),

    /// Invalid fragment metadata name.
    #[error("Invalid metadata name: {0}")]
    InvalidMetadataName(String),

    /// Invalid fragment metadata value.
    #[error("Invalid metadata value for {0}")]
    InvalidMetadataValue(String),

    /// Frame payload cannot be packaged.
    #[error("Encoding error: {0}")]
    Encoding(String),
}
