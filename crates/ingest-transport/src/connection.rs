//! Upload handle state.

use serde::{Deserialize, Serialize};
use url::Url;

use ingest_proto::ServiceCallResult;

use crate::error::TransportError;
use crate::TransportResult;

/// Lifecycle of one upload handle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum UploadState {
    /// Assigned, nothing delivered yet.
    #[default]
    New,

    /// Delivering bytes.
    Streaming,

    /// Delivering up to its rotation boundary, then end of stream.
    Draining,

    /// Ended. The next read reports end of stream.
    Terminated { result: ServiceCallResult },

    /// Its unread content was evicted. Reads fail.
    Aborted,
}

impl UploadState {
    /// Whether the handle still occupies one of the live slots.
    pub fn is_live(&self) -> bool {
        matches!(self, Self::New | Self::Streaming | Self::Draining)
    }

    pub fn is_draining(&self) -> bool {
        matches!(self, Self::Draining)
    }
}

/// Parse a streaming endpoint returned by the service.
pub fn parse_endpoint(endpoint: &str) -> TransportResult<Url> {
    let url = Url::parse(endpoint)?;
    if url.cannot_be_a_base() || url.host_str().is_none() {
        return Err(TransportError::InvalidUrl(endpoint.to_string()));
    }
    Ok(url)
}
