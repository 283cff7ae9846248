//! Client-level stream registry.

use std::collections::HashMap;
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};
use parking_lot::RwLock;
use tracing::{info, instrument, warn};

use ingest_encoder::EncoderKind;
use ingest_proto::{event_channel, ClientConfig, ClientMetrics, StreamConfig, StreamEvent};
use ingest_transport::ServiceCallbacks;

use crate::error::StreamError;
use crate::platform::Platform;
use crate::stream::Stream;
use crate::StreamResult;

/// Owns the streams of one producer and the notification channel they share.
pub struct IngestClient {
    config: ClientConfig,
    callbacks: Arc<dyn ServiceCallbacks>,
    platform: Arc<dyn Platform>,
    events: Sender<StreamEvent>,
    streams: RwLock<HashMap<String, Arc<Stream>>>,
}

impl IngestClient {
    /// Create a client. The receiver carries notifications of every stream.
    pub fn new(
        config: ClientConfig,
        callbacks: Arc<dyn ServiceCallbacks>,
        platform: Arc<dyn Platform>,
    ) -> (Self, Receiver<StreamEvent>) {
        let (events, rx) = event_channel();
        let client = Self {
            config,
            callbacks,
            platform,
            events,
            streams: RwLock::new(HashMap::new()),
        };
        (client, rx)
    }

    /// Create and start a stream packaging frames as-is.
    pub fn create_stream(&self, config: StreamConfig) -> StreamResult<Arc<Stream>> {
        self.create_stream_with_encoder(config, EncoderKind::PassThrough)
    }

    #[instrument(name = "create_stream", skip(self, config), fields(stream = %config.name))]
    pub fn create_stream_with_encoder(
        &self,
        config: StreamConfig,
        encoder: EncoderKind,
    ) -> StreamResult<Arc<Stream>> {
        let stream = {
            let mut streams = self.streams.write();
            if streams.len() >= self.config.max_stream_count {
                return Err(StreamError::MaxStreamCount(self.config.max_stream_count));
            }
            if streams.contains_key(&config.name) {
                return Err(StreamError::DuplicateStreamName(config.name));
            }

            let stream = Arc::new(Stream::new(
                config,
                encoder,
                Arc::clone(&self.callbacks),
                Arc::clone(&self.platform),
                self.events.clone(),
            )?);
            streams.insert(stream.name().to_string(), Arc::clone(&stream));
            stream
        };

        let started = stream.start().and_then(|()| {
            if stream.is_terminated() {
                Err(StreamError::StreamTerminated)
            } else {
                Ok(())
            }
        });
        if let Err(e) = started {
            warn!(stream = stream.name(), "Stream failed to start: {}", e);
            let mut streams = self.streams.write();
            if streams
                .get(stream.name())
                .is_some_and(|registered| Arc::ptr_eq(registered, &stream))
            {
                streams.remove(stream.name());
            }
            drop(streams);
            stream.free();
            return Err(e);
        }
        Ok(stream)
    }

    pub fn get_stream(&self, name: &str) -> StreamResult<Arc<Stream>> {
        self.streams
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| StreamError::StreamNotFound(name.to_string()))
    }

    /// Free a stream and remove it from the registry.
    pub fn free_stream(&self, name: &str) -> StreamResult<()> {
        let stream = self
            .streams
            .write()
            .remove(name)
            .ok_or_else(|| StreamError::StreamNotFound(name.to_string()))?;
        stream.free();
        info!(stream = name, "Freed stream");
        Ok(())
    }

    /// Free every stream.
    pub fn free(&self) {
        let streams: Vec<_> = self.streams.write().drain().map(|(_, s)| s).collect();
        for stream in &streams {
            stream.free();
        }
        info!(count = streams.len(), "Freed client");
    }

    pub fn stream_count(&self) -> usize {
        self.streams.read().len()
    }

    /// Aggregate metrics over every stream.
    pub fn metrics(&self) -> ClientMetrics {
        let streams = self.streams.read();
        let mut metrics = ClientMetrics {
            stream_count: streams.len() as u32,
            ..Default::default()
        };
        for stream in streams.values() {
            let (capacity, allocated) = stream.store_usage();
            metrics.content_store_size += capacity;
            metrics.content_store_allocated += allocated;
            metrics.total_dropped_frames += stream.dropped_frames();
        }
        metrics
    }
}

impl Drop for IngestClient {
    fn drop(&mut self) {
        self.free();
    }
}
