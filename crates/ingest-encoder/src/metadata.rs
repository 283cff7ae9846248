//! Fragment metadata.

use tracing::debug;

use crate::error::EncoderError;
use crate::EncoderResult;

pub const MAX_FRAGMENT_METADATA_NAME_LEN: usize = 128;
pub const MAX_FRAGMENT_METADATA_VALUE_LEN: usize = 256;

/// Names starting with this prefix belong to the service.
pub const RESERVED_METADATA_PREFIX: &str = "AWS";

/// Pending plus persistent entries allowed at once.
pub const MAX_FRAGMENT_METADATA_COUNT: usize = 10;

/// A name/value pair attached to a fragment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FragmentMetadata {
    pub name: String,
    pub value: String,

    /// Repeated on every fragment until removed.
    pub persistent: bool,
}

/// Check a metadata name and value.
pub fn validate_metadata(name: &str, value: &str) -> EncoderResult<()> {
    if name.is_empty()
        || name.len() > MAX_FRAGMENT_METADATA_NAME_LEN
        || name.starts_with(RESERVED_METADATA_PREFIX)
    {
        return Err(EncoderError::InvalidMetadataName(name.to_string()));
    }

    if value.len() > MAX_FRAGMENT_METADATA_VALUE_LEN {
        return Err(EncoderError::InvalidMetadataValue(name.to_string()));
    }

    Ok(())
}

/// Metadata waiting for the next fragment start.
#[derive(Debug, Clone, Default)]
pub struct MetadataQueue {
    pending: Vec<FragmentMetadata>,
    persistent: Vec<FragmentMetadata>,
}

impl MetadataQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an entry.
    ///
    /// A persistent entry with an empty value removes the persistent entry of
    /// that name. Returns `false` when the queue is full.
    pub fn push(&mut self, name: &str, value: &str, persistent: bool) -> EncoderResult<bool> {
        validate_metadata(name, value)?;

        if persistent {
            if value.is_empty() {
                self.persistent.retain(|m| m.name != name);
                debug!(name, "Removed persistent fragment metadata");
                return Ok(true);
            }

            if let Some(existing) = self.persistent.iter_mut().find(|m| m.name == name) {
                existing.value = value.to_string();
                return Ok(true);
            }
        }

        if self.len() >= MAX_FRAGMENT_METADATA_COUNT {
            return Ok(false);
        }

        let entry = FragmentMetadata {
            name: name.to_string(),
            value: value.to_string(),
            persistent,
        };

        if persistent {
            self.persistent.push(entry);
        } else {
            self.pending.push(entry);
        }
        Ok(true)
    }

    /// Entries for the next fragment: persistent ones first, then the drained pending ones.
    pub fn take_for_fragment(&mut self) -> Vec<FragmentMetadata> {
        let mut entries = self.persistent.clone();
        entries.append(&mut self.pending);
        entries
    }

    pub fn len(&self) -> usize {
        self.pending.len() + self.persistent.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_metadata() {
        assert!(validate_metadata("location", "lobby").is_ok());
        assert!(validate_metadata("AWS_internal", "x").is_err());
        assert!(validate_metadata("", "x").is_err());
        assert!(validate_metadata(&"n".repeat(129), "x").is_err());
        assert!(validate_metadata("n", &"v".repeat(257)).is_err());
    }

    #[test]
    fn test_pending_metadata_drains_once() {
        let mut queue = MetadataQueue::new();
        assert!(queue.push("a", "1", false).unwrap());
        assert!(queue.push("b", "2", true).unwrap());

        let first = queue.take_for_fragment();
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].name, "b");

        let second = queue.take_for_fragment();
        assert_eq!(second.len(), 1);
        assert!(second[0].persistent);
    }

    #[test]
    fn test_persistent_empty_value_removes() {
        let mut queue = MetadataQueue::new();
        queue.push("camera", "front", true).unwrap();
        queue.push("camera", "back", true).unwrap();
        assert_eq!(queue.len(), 1);

        queue.push("camera", "", true).unwrap();
        assert!(queue.is_empty());
    }

    #[test]
    fn test_queue_limit() {
        let mut queue = MetadataQueue::new();
        for i in 0..MAX_FRAGMENT_METADATA_COUNT {
            assert!(queue.push(&format!("k{}", i), "v", false).unwrap());
        }
        assert!(!queue.push("overflow", "v", false).unwrap());
    }
}
