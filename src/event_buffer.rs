//! Event buffer subsystem
//!
//! Accumulates recording events for the segment being recorded and turns
//! them into a payload on `finish`. Three implementations share the
//! [`EventBuffer`] trait:
//!
//! - `array_buffer`: plain in-memory list, serialized to JSON on finish.
//! - `compression_buffer`: streams events to a background compression
//!   worker and gets zlib-compressed bytes back.
//! - `proxy_buffer`: starts on the array buffer while the worker loads,
//!   migrates to the worker once it is ready, and falls back to the array
//!   for good if the worker fails to start.
//!
//! The worker side (`worker`, `compressor`) speaks a small request/response
//! protocol over channels, keyed by a correlation id.
//!
//! All implementations enforce the same uncompressed size ceiling: an event
//! that would push the buffer over it is rejected with
//! [`EventBufferError::SizeExceeded`] and not added.

pub mod array_buffer;
pub mod compression_buffer;
pub mod compressor;
pub mod proxy_buffer;
pub mod worker;

use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, warn};

use crate::error_handling::types::EventBufferError;
use crate::recording::types::RecordingEvent;

use self::array_buffer::EventBufferArray;
use self::proxy_buffer::EventBufferProxy;
use self::worker::{ThreadWorkerFactory, WorkerFactory, WorkerHandle};

/// Default uncompressed size ceiling of a buffer.
pub const REPLAY_MAX_EVENT_BUFFER_SIZE: usize = 20_000_000;

/// Which implementation currently holds the events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferKind {
    Sync,
    Worker,
}

/// Output of [`EventBuffer::finish`].
#[derive(Debug, Clone, PartialEq)]
pub enum ReplayPayload {
    /// JSON array of events.
    Json(String),
    /// zlib-compressed JSON array of events.
    Compressed(Vec<u8>),
}

impl ReplayPayload {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            ReplayPayload::Json(text) => text.as_bytes(),
            ReplayPayload::Compressed(bytes) => bytes,
        }
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.as_bytes().is_empty()
    }

    pub fn is_compressed(&self) -> bool {
        matches!(self, ReplayPayload::Compressed(_))
    }
}

/// Serialized size of an event, the unit of the size ceiling.
pub fn event_size(event: &RecordingEvent) -> Result<usize, EventBufferError> {
    Ok(serde_json::to_string(event)?.len())
}

#[async_trait]
pub trait EventBuffer: Send {
    fn kind(&self) -> BufferKind;

    fn has_events(&self) -> bool;

    /// True once a checkout has been added to the current segment.
    fn has_checkout(&self) -> bool;
    fn set_has_checkout(&mut self, value: bool);

    /// While set, buffered events are provisional until the next checkout.
    fn wait_for_checkout(&self) -> bool;
    fn set_wait_for_checkout(&mut self, value: bool);

    /// Uncompressed size of the events currently buffered.
    fn total_size(&self) -> usize;

    /// Adds an event, or rejects it when the size ceiling would be crossed.
    async fn add_event(&mut self, event: RecordingEvent) -> Result<(), EventBufferError>;

    /// Snapshots and clears the buffered events.
    async fn finish(&mut self) -> Result<ReplayPayload, EventBufferError>;

    async fn clear(&mut self) -> Result<(), EventBufferError>;

    fn earliest_timestamp(&self) -> Option<i64>;

    /// Releases the buffer's resources. The buffer must not be used afterwards.
    fn destroy(&mut self);
}

#[derive(Clone, Default)]
pub struct BufferOptions {
    pub use_compression: bool,
    pub max_size: usize,
    pub worker_factory: Option<Arc<dyn WorkerFactory>>,
}

/// Builds the buffer for a new recording.
///
/// Must be called inside a tokio runtime when compression is on.
pub fn create_event_buffer(options: BufferOptions) -> Box<dyn EventBuffer> {
    let max_size = if options.max_size == 0 {
        REPLAY_MAX_EVENT_BUFFER_SIZE
    } else {
        options.max_size
    };
    if !options.use_compression {
        return Box::new(EventBufferArray::new(max_size));
    }

    let factory: Arc<dyn WorkerFactory> = options
        .worker_factory
        .unwrap_or_else(|| Arc::new(ThreadWorkerFactory));
    match factory.spawn() {
        Ok(channel) => {
            debug!("Using compression worker");
            Box::new(EventBufferProxy::new(WorkerHandle::new(channel), max_size))
        }
        Err(e) => {
            warn!("Failed to create compression worker, using in-memory buffer: {}", e);
            Box::new(EventBufferArray::new(max_size))
        }
    }
}
