mod common;

use std::sync::Arc;

use crossbeam_channel::Receiver;

use ingest_engine::{IngestClient, ManualPlatform, StreamError};
use ingest_proto::{ClientConfig, StreamConfig, StreamEvent, StreamState};
use ingest_transport::{ChannelServiceCallbacks, ServiceCall};

use common::{init_test_logging, key, START};

struct Fixture {
    client: IngestClient,
    events: Receiver<StreamEvent>,
    _calls: Receiver<ServiceCall>,
}

fn fixture(max_stream_count: usize) -> Fixture {
    init_test_logging();
    let (callbacks, calls) = ChannelServiceCallbacks::new();
    let (client, events) = IngestClient::new(
        ClientConfig { max_stream_count },
        Arc::new(callbacks),
        Arc::new(ManualPlatform::new(START)),
    );
    Fixture {
        client,
        events,
        _calls: calls,
    }
}

#[test]
fn test_create_and_lookup() {
    let f = fixture(4);
    let (client, events) = (&f.client, &f.events);
    let stream = client.create_stream(StreamConfig::new("front-door")).unwrap();
    assert_eq!(stream.state(), StreamState::Describe);

    let found = client.get_stream("front-door").unwrap();
    assert!(Arc::ptr_eq(&stream, &found));
    assert!(events
        .try_iter()
        .any(|e| matches!(e, StreamEvent::StateChanged { current: StreamState::Describe, .. })));
}

#[test]
fn test_duplicate_and_limit() {
    let f = fixture(1);
    let client = &f.client;
    client.create_stream(StreamConfig::new("a")).unwrap();

    assert_eq!(
        client.create_stream(StreamConfig::new("a")).err(),
        Some(StreamError::MaxStreamCount(1))
    );

    let f = fixture(2);
    let client = &f.client;
    client.create_stream(StreamConfig::new("a")).unwrap();
    assert_eq!(
        client.create_stream(StreamConfig::new("a")).err(),
        Some(StreamError::DuplicateStreamName("a".to_string()))
    );
}

#[test]
fn test_invalid_config_rejected() {
    let f = fixture(2);
    let client = &f.client;
    assert!(matches!(
        client.create_stream(StreamConfig::new("")),
        Err(StreamError::Config(_))
    ));
    assert_eq!(client.stream_count(), 0);
}

#[test]
fn test_failed_start_leaves_no_registration() {
    init_test_logging();
    let (callbacks, calls) = ChannelServiceCallbacks::new();
    drop(calls);
    let (client, _events) = IngestClient::new(
        ClientConfig { max_stream_count: 2 },
        Arc::new(callbacks),
        Arc::new(ManualPlatform::new(START)),
    );

    // Every describe is refused by the transport until the retry budget runs out.
    assert_eq!(
        client.create_stream(StreamConfig::new("a")).err(),
        Some(StreamError::StreamTerminated)
    );
    assert_eq!(client.stream_count(), 0);
    assert_eq!(
        client.get_stream("a").err(),
        Some(StreamError::StreamNotFound("a".to_string()))
    );
}

#[test]
fn test_free_stream() {
    let f = fixture(2);
    let client = &f.client;
    let stream = client.create_stream(StreamConfig::new("a")).unwrap();
    client.free_stream("a").unwrap();

    assert!(stream.is_terminated());
    assert_eq!(stream.put_frame(key(0, b"x")), Err(StreamError::StreamTerminated));
    assert_eq!(
        client.get_stream("a").err(),
        Some(StreamError::StreamNotFound("a".to_string()))
    );
    assert_eq!(
        client.free_stream("a"),
        Err(StreamError::StreamNotFound("a".to_string()))
    );
}

#[test]
fn test_client_metrics() {
    let f = fixture(4);
    let client = &f.client;
    let mut config = StreamConfig::new("a");
    config.storage_size_bytes = 1_000;
    let stream = client.create_stream(config).unwrap();
    stream.put_frame(key(0, &[0u8; 10])).unwrap();

    let mut config = StreamConfig::new("b");
    config.storage_size_bytes = 500;
    client.create_stream(config).unwrap();

    let metrics = client.metrics();
    assert_eq!(metrics.stream_count, 2);
    assert_eq!(metrics.content_store_size, 1_500);
    assert_eq!(metrics.content_store_allocated, 10);
    assert_eq!(metrics.total_dropped_frames, 0);

    client.free();
    assert_eq!(client.metrics().stream_count, 0);
}
