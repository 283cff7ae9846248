//! Control-plane state identifiers.

use std::fmt;

use serde::{Deserialize, Serialize};

/// States of the per-stream control plane, in their nominal order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StreamState {
    New,
    Describe,
    Create,
    TagStream,
    GetEndpoint,
    GetToken,
    Ready,
    PutStream,
    Streaming,
    Stopped,
}

impl StreamState {
    pub const ALL: [StreamState; 10] = [
        Self::New,
        Self::Describe,
        Self::Create,
        Self::TagStream,
        Self::GetEndpoint,
        Self::GetToken,
        Self::Ready,
        Self::PutStream,
        Self::Streaming,
        Self::Stopped,
    ];

    /// Bit used to build accept masks.
    pub fn bit(self) -> u32 {
        1 << (self as u32)
    }

    /// Returns the display name for this state.
    pub fn name(self) -> &'static str {
        match self {
            Self::New => "New",
            Self::Describe => "Describe",
            Self::Create => "Create",
            Self::TagStream => "TagStream",
            Self::GetEndpoint => "GetEndpoint",
            Self::GetToken => "GetToken",
            Self::Ready => "Ready",
            Self::PutStream => "PutStream",
            Self::Streaming => "Streaming",
            Self::Stopped => "Stopped",
        }
    }

    /// Whether a frame can be handed to an upload handle in this state.
    pub fn is_ready_to_upload(self) -> bool {
        matches!(self, Self::Ready | Self::PutStream | Self::Streaming)
    }
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A set of stream states, stored as a bitmask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct StateSet(u32);

impl StateSet {
    pub const EMPTY: StateSet = StateSet(0);

    pub fn of(states: &[StreamState]) -> Self {
        Self(states.iter().fold(0, |mask, state| mask | state.bit()))
    }

    pub fn all() -> Self {
        Self::of(&StreamState::ALL)
    }

    pub fn contains(self, state: StreamState) -> bool {
        self.0 & state.bit() != 0
    }

    pub fn with(self, state: StreamState) -> Self {
        Self(self.0 | state.bit())
    }
}
