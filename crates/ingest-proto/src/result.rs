//! Remote call results and control-plane payloads.

use serde::{Deserialize, Serialize};

use crate::types::Timestamp;

/// Result of a control-plane call, a connection termination or an error ack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ServiceCallResult {
    #[default]
    Ok,
    InvalidArg,
    ResourceNotFound,
    ResourceDeleted,
    ResourceInUse,
    ClientLimit,
    DeviceLimit,
    StreamLimit,
    NotAuthorized,
    Forbidden,
    RequestTimeout,
    GatewayTimeout,
    NetworkReadTimeout,
    NetworkConnectionTimeout,
    InternalError,
    ServiceUnavailable,
    NotImplemented,
    /// Synthetic result used when the token is about to expire.
    StreamAuthInGracePeriod,

    // Ack level errors reported on the upload response stream.
    StreamReadError,
    MaxFragmentSizeReached,
    MaxFragmentDurationReached,
    MaxConnectionDurationReached,
    FragmentTimecodeLesserThanPrevious,
    InvalidMkvData,
    InvalidProducerTimestamp,
    FragmentArchivalError,
    Unknown,
}

impl ServiceCallResult {
    /// Map an HTTP status (or ack error code) onto a result.
    pub fn from_status_code(code: u32) -> Self {
        match code {
            200 => Self::Ok,
            400 | 406 => Self::InvalidArg,
            401 => Self::NotAuthorized,
            403 => Self::Forbidden,
            404 => Self::ResourceNotFound,
            408 => Self::RequestTimeout,
            409 => Self::ResourceInUse,
            410 => Self::ResourceDeleted,
            429 => Self::ClientLimit,
            500 => Self::InternalError,
            501 => Self::NotImplemented,
            503 => Self::ServiceUnavailable,
            504 => Self::GatewayTimeout,
            4000 => Self::StreamReadError,
            4001 => Self::MaxFragmentSizeReached,
            4002 => Self::MaxFragmentDurationReached,
            4003 => Self::MaxConnectionDurationReached,
            4004 => Self::FragmentTimecodeLesserThanPrevious,
            4006 => Self::InvalidMkvData,
            4007 => Self::InvalidProducerTimestamp,
            5000 => Self::InternalError,
            5001 => Self::FragmentArchivalError,
            10_001 => Self::DeviceLimit,
            10_002 => Self::StreamLimit,
            10_003 => Self::NetworkReadTimeout,
            10_004 => Self::NetworkConnectionTimeout,
            _ => Self::Unknown,
        }
    }

    pub fn is_ok(self) -> bool {
        self == Self::Ok
    }

    /// Transient results that the control plane retries within its budget.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::ClientLimit
                | Self::DeviceLimit
                | Self::StreamLimit
                | Self::InternalError
                | Self::ServiceUnavailable
                | Self::Unknown
        ) || self.is_timeout()
    }

    pub fn is_timeout(self) -> bool {
        matches!(
            self,
            Self::RequestTimeout
                | Self::GatewayTimeout
                | Self::NetworkReadTimeout
                | Self::NetworkConnectionTimeout
        )
    }

    pub fn is_auth_failure(self) -> bool {
        matches!(self, Self::NotAuthorized | Self::Forbidden)
    }
}

/// Lifecycle status of the remote stream resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum StreamStatus {
    Creating,
    #[default]
    Active,
    Updating,
    Deleting,
}

/// Describe-stream response payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamDescription {
    pub stream_name: String,
    pub stream_arn: String,
    pub status: StreamStatus,
    pub content_type: String,

    /// Retention of the remote stream in 100ns units. Zero means no retention.
    pub retention_period: Timestamp,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_code_mapping() {
        assert_eq!(ServiceCallResult::from_status_code(200), ServiceCallResult::Ok);
        assert_eq!(
            ServiceCallResult::from_status_code(404),
            ServiceCallResult::ResourceNotFound
        );
        assert_eq!(
            ServiceCallResult::from_status_code(5001),
            ServiceCallResult::FragmentArchivalError
        );
        assert_eq!(ServiceCallResult::from_status_code(999), ServiceCallResult::Unknown);
    }

    #[test]
    fn test_retryable_classification() {
        assert!(ServiceCallResult::GatewayTimeout.is_retryable());
        assert!(ServiceCallResult::InternalError.is_retryable());
        assert!(!ServiceCallResult::ResourceNotFound.is_retryable());
        assert!(!ServiceCallResult::NotAuthorized.is_retryable());
        assert!(!ServiceCallResult::Ok.is_retryable());
    }
}
