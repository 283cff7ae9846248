//! Shared harness for stream integration tests.

#![allow(dead_code)]

use std::sync::{Arc, Once};

use bytes::Bytes;
use crossbeam_channel::Receiver;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use ingest_encoder::EncoderKind;
use ingest_engine::{DataStatus, ManualPlatform, Stream, StreamData};
use ingest_proto::{
    event_channel, Frame, FrameFlags, ServiceCallResult, StreamConfig, StreamDescription,
    StreamEvent, StreamState, StreamStatus, Timestamp, UploadHandle,
    HUNDREDS_OF_NANOS_IN_A_MILLISECOND, HUNDREDS_OF_NANOS_IN_A_SECOND,
};
use ingest_transport::{ChannelServiceCallbacks, ServiceCall};

pub const MS: Timestamp = HUNDREDS_OF_NANOS_IN_A_MILLISECOND;
pub const SEC: Timestamp = HUNDREDS_OF_NANOS_IN_A_SECOND;

/// Wall time the manual clock starts at.
pub const START: Timestamp = 1_700_000_000 * SEC;

pub const ENDPOINT: &str = "https://ingest.example.com";

static INIT: Once = Once::new();

/// Route engine logs to the test writer. Filter with `RUST_LOG`.
pub fn init_test_logging() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::registry()
            .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
            .with(tracing_subscriber::fmt::layer().with_test_writer())
            .try_init();
    });
}

pub fn frame(track_id: u64, ts_ms: u64, key: bool, payload: &'static [u8]) -> Frame {
    let flags = if key {
        FrameFlags::KEY_FRAME
    } else {
        FrameFlags::empty()
    };
    Frame::new(
        0,
        track_id,
        flags,
        ts_ms * MS,
        ts_ms * MS,
        40 * MS,
        Bytes::from_static(payload),
    )
}

pub fn key(ts_ms: u64, payload: &'static [u8]) -> Frame {
    frame(1, ts_ms, true, payload)
}

pub fn delta(ts_ms: u64, payload: &'static [u8]) -> Frame {
    frame(1, ts_ms, false, payload)
}

/// A stream wired to a channel transport and a manual clock.
pub struct Harness {
    pub stream: Arc<Stream>,
    pub calls: Receiver<ServiceCall>,
    pub events: Receiver<StreamEvent>,
    pub platform: Arc<ManualPlatform>,
}

impl Harness {
    /// Create and start a stream. The first describe call is queued.
    pub fn start(config: StreamConfig) -> Self {
        init_test_logging();

        let (callbacks, calls) = ChannelServiceCallbacks::new();
        let (tx, events) = event_channel();
        let platform = Arc::new(ManualPlatform::new(START));
        let stream = Stream::new(
            config,
            EncoderKind::PassThrough,
            Arc::new(callbacks),
            platform.clone(),
            tx,
        )
        .unwrap();
        stream.start().unwrap();

        Self {
            stream: Arc::new(stream),
            calls,
            events,
            platform,
        }
    }

    pub fn next_call(&self) -> ServiceCall {
        self.calls.try_recv().expect("a service call should be queued")
    }

    pub fn no_call(&self) -> bool {
        self.calls.is_empty()
    }

    pub fn answer_describe(&self, result: ServiceCallResult) {
        let call = self.next_call();
        assert_eq!(call.name(), "describe_stream");
        let description = StreamDescription {
            stream_name: self.stream.name().to_string(),
            stream_arn: format!("arn:stream/{}", self.stream.name()),
            status: StreamStatus::Active,
            ..Default::default()
        };
        let _ = self.stream.describe_stream_result(
            call.context().correlation_id,
            result,
            result.is_ok().then_some(description),
        );
    }

    pub fn answer_endpoint(&self) {
        let call = self.next_call();
        assert_eq!(call.name(), "get_streaming_endpoint");
        self.stream
            .get_streaming_endpoint_result(call.context().correlation_id, ServiceCallResult::Ok, ENDPOINT)
            .unwrap();
    }

    pub fn answer_token(&self, expires_in: Timestamp) {
        let call = self.next_call();
        assert_eq!(call.name(), "get_streaming_token");
        let expiration = self.platform_now() + expires_in;
        self.stream
            .get_streaming_token_result(call.context().correlation_id, ServiceCallResult::Ok, "token", expiration)
            .unwrap();
    }

    pub fn answer_put_stream(&self) -> UploadHandle {
        let call = self.next_call();
        assert_eq!(call.name(), "put_stream");
        self.stream
            .put_stream_result(call.context().correlation_id, ServiceCallResult::Ok)
            .unwrap()
            .expect("put stream should create a handle")
    }

    /// Answer describe, endpoint and token successfully.
    pub fn to_ready(&self) {
        self.answer_describe(ServiceCallResult::Ok);
        self.answer_endpoint();
        self.answer_token(3_600 * SEC);
        assert_eq!(self.stream.state(), StreamState::Ready);
    }

    /// Ready, one key frame and an open upload handle.
    pub fn to_streaming(&self, first: Frame) -> UploadHandle {
        self.to_ready();
        self.stream.put_frame(first).unwrap();
        let handle = self.answer_put_stream();
        assert_eq!(self.stream.state(), StreamState::Streaming);
        handle
    }

    /// Read everything currently available for `handle`.
    pub fn read_all(&self, handle: UploadHandle) -> (Vec<u8>, DataStatus) {
        let mut out = Vec::new();
        let mut buf = [0u8; 7];
        loop {
            let StreamData { filled, status } = self.stream.get_stream_data(handle, &mut buf).unwrap();
            out.extend_from_slice(&buf[..filled]);
            if status != DataStatus::More {
                return (out, status);
            }
        }
    }

    pub fn platform_now(&self) -> Timestamp {
        use ingest_engine::Platform;
        self.platform.now()
    }

    pub fn drain_events(&self) -> Vec<StreamEvent> {
        self.events.try_iter().collect()
    }
}
