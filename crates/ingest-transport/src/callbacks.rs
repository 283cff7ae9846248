//! Control-plane callbacks.

use std::collections::BTreeMap;

use crossbeam_channel::{Receiver, Sender, TrySendError};
use tracing::{trace, warn};
use url::Url;

use ingest_proto::Timestamp;

use crate::error::TransportError;
use crate::{TransportResult, SERVICE_CALL_CHANNEL_CAPACITY};

/// Credentials attached to a call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthInfo {
    pub token: String,

    /// Absolute expiration in 100ns units.
    pub expiration: Timestamp,
}

/// Context carried by every call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallContext {
    /// Must be echoed back in the matching result entry point.
    pub correlation_id: u64,

    pub stream_name: String,

    pub auth: Option<AuthInfo>,

    /// Timeout in 100ns units.
    pub timeout: Timestamp,
}

/// Parameters of a create-stream call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateStreamRequest {
    pub content_type: String,
    pub kms_key_id: Option<String>,
    pub retention_hours: u32,
}

/// Parameters of a tag-stream call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagStreamRequest {
    pub tags: BTreeMap<String, String>,
}

/// Parameters of a put-stream call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutStreamRequest {
    pub endpoint: Url,
    pub content_type: String,

    /// Timestamp of the first item the new handle will carry.
    pub start_timestamp: Timestamp,
}

/// The control-plane calls the core issues.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceCall {
    DescribeStream(CallContext),
    CreateStream(CallContext, CreateStreamRequest),
    TagStream(CallContext, TagStreamRequest),
    GetStreamingEndpoint(CallContext),
    GetStreamingToken(CallContext),
    PutStream(CallContext, PutStreamRequest),
}

impl ServiceCall {
    pub fn context(&self) -> &CallContext {
        match self {
            Self::DescribeStream(ctx)
            | Self::CreateStream(ctx, _)
            | Self::TagStream(ctx, _)
            | Self::GetStreamingEndpoint(ctx)
            | Self::GetStreamingToken(ctx)
            | Self::PutStream(ctx, _) => ctx,
        }
    }

    /// Call name for diagnostics.
    pub fn name(&self) -> &'static str {
        match self {
            Self::DescribeStream(_) => "describe_stream",
            Self::CreateStream(..) => "create_stream",
            Self::TagStream(..) => "tag_stream",
            Self::GetStreamingEndpoint(_) => "get_streaming_endpoint",
            Self::GetStreamingToken(_) => "get_streaming_token",
            Self::PutStream(..) => "put_stream",
        }
    }

    /// Hand the call to the transport.
    pub fn issue(self, callbacks: &dyn ServiceCallbacks) -> TransportResult<()> {
        trace!(call = self.name(), correlation_id = self.context().correlation_id, "Issuing service call");
        match self {
            Self::DescribeStream(ctx) => callbacks.describe_stream(ctx),
            Self::CreateStream(ctx, request) => callbacks.create_stream(ctx, request),
            Self::TagStream(ctx, request) => callbacks.tag_stream(ctx, request),
            Self::GetStreamingEndpoint(ctx) => callbacks.get_streaming_endpoint(ctx),
            Self::GetStreamingToken(ctx) => callbacks.get_streaming_token(ctx),
            Self::PutStream(ctx, request) => callbacks.put_stream(ctx, request),
        }
    }
}

/// Transport supplied by the caller.
///
/// Every method must return as soon as the call is issued. Implementations
/// must not call back into the stream from inside these methods on the same
/// thread while expecting a synchronous answer; results are delivered later
/// through the stream's result entry points.
pub trait ServiceCallbacks: Send + Sync {
    fn describe_stream(&self, ctx: CallContext) -> TransportResult<()>;

    fn create_stream(&self, ctx: CallContext, request: CreateStreamRequest) -> TransportResult<()>;

    fn tag_stream(&self, ctx: CallContext, request: TagStreamRequest) -> TransportResult<()>;

    fn get_streaming_endpoint(&self, ctx: CallContext) -> TransportResult<()>;

    fn get_streaming_token(&self, ctx: CallContext) -> TransportResult<()>;

    fn put_stream(&self, ctx: CallContext, request: PutStreamRequest) -> TransportResult<()>;
}

/// Forwards every call into a bounded channel for a transport thread to serve.
#[derive(Debug, Clone)]
pub struct ChannelServiceCallbacks {
    tx: Sender<ServiceCall>,
}

impl ChannelServiceCallbacks {
    /// Create the callbacks and the receiving end of the call queue.
    pub fn new() -> (Self, Receiver<ServiceCall>) {
        let (tx, rx) = crossbeam_channel::bounded(SERVICE_CALL_CHANNEL_CAPACITY);
        (Self { tx }, rx)
    }

    fn send(&self, call: ServiceCall) -> TransportResult<()> {
        match self.tx.try_send(call) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(call)) => {
                warn!(call = call.name(), "Service call queue full");
                Err(TransportError::QueueFull)
            }
            Err(TrySendError::Disconnected(_)) => Err(TransportError::ChannelDisconnected),
        }
    }
}

impl ServiceCallbacks for ChannelServiceCallbacks {
    fn describe_stream(&self, ctx: CallContext) -> TransportResult<()> {
        self.send(ServiceCall::DescribeStream(ctx))
    }

    fn create_stream(&self, ctx: CallContext, request: CreateStreamRequest) -> TransportResult<()> {
        self.send(ServiceCall::CreateStream(ctx, request))
    }

    fn tag_stream(&self, ctx: CallContext, request: TagStreamRequest) -> TransportResult<()> {
        self.send(ServiceCall::TagStream(ctx, request))
    }

    fn get_streaming_endpoint(&self, ctx: CallContext) -> TransportResult<()> {
        self.send(ServiceCall::GetStreamingEndpoint(ctx))
    }

    fn get_streaming_token(&self, ctx: CallContext) -> TransportResult<()> {
        self.send(ServiceCall::GetStreamingToken(ctx))
    }

    fn put_stream(&self, ctx: CallContext, request: PutStreamRequest) -> TransportResult<()> {
        self.send(ServiceCall::PutStream(ctx, request))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(id: u64) -> CallContext {
        CallContext {
            correlation_id: id,
            stream_name: "cam".into(),
            auth: None,
            timeout: 0,
        }
    }

    #[test]
    fn test_channel_callbacks_forward_calls() {
        let (callbacks, rx) = ChannelServiceCallbacks::new();
        ServiceCall::DescribeStream(ctx(1)).issue(&callbacks).unwrap();
        ServiceCall::GetStreamingToken(ctx(2)).issue(&callbacks).unwrap();

        let first = rx.try_recv().unwrap();
        assert_eq!(first.name(), "describe_stream");
        assert_eq!(first.context().correlation_id, 1);
        assert_eq!(rx.try_recv().unwrap().name(), "get_streaming_token");
    }

    #[test]
    fn test_channel_callbacks_full_queue() {
        let (callbacks, _rx) = ChannelServiceCallbacks::new();
        for i in 0..SERVICE_CALL_CHANNEL_CAPACITY as u64 {
            callbacks.describe_stream(ctx(i)).unwrap();
        }
        assert_eq!(
            callbacks.describe_stream(ctx(99)),
            Err(TransportError::QueueFull)
        );
    }

    #[test]
    fn test_channel_callbacks_disconnected() {
        let (callbacks, rx) = ChannelServiceCallbacks::new();
        drop(rx);
        assert_eq!(
            callbacks.get_streaming_endpoint(ctx(1)),
            Err(TransportError::ChannelDisconnected)
        );
    }
}
