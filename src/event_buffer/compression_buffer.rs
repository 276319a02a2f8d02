use async_trait::async_trait;
use log::trace;

use crate::error_handling::types::{EventBufferError, WorkerError};
use crate::recording::types::RecordingEvent;

use super::worker::{WorkerHandle, WorkerMethod, WorkerPayload};
use super::{BufferKind, EventBuffer, ReplayPayload};

/// Streams events into a compression worker.
///
/// Size and timestamp bookkeeping stays on this side; the worker only ever
/// sees serialized events.
pub struct EventBufferCompressionWorker {
    worker: WorkerHandle,
    total_size: usize,
    max_size: usize,
    earliest_timestamp: Option<i64>,
    has_checkout: bool,
    wait_for_checkout: bool,
}

impl EventBufferCompressionWorker {
    pub fn new(worker: WorkerHandle, max_size: usize) -> Self {
        Self {
            worker,
            total_size: 0,
            max_size,
            earliest_timestamp: None,
            has_checkout: false,
            wait_for_checkout: false,
        }
    }

    pub(crate) fn worker_mut(&mut self) -> &mut WorkerHandle {
        &mut self.worker
    }

    fn reset(&mut self) {
        self.total_size = 0;
        self.earliest_timestamp = None;
        self.has_checkout = false;
    }
}

#[async_trait]
impl EventBuffer for EventBufferCompressionWorker {
    fn kind(&self) -> BufferKind {
        BufferKind::Worker
    }

    fn has_events(&self) -> bool {
        self.earliest_timestamp.is_some()
    }

    fn has_checkout(&self) -> bool {
        self.has_checkout
    }

    fn set_has_checkout(&mut self, value: bool) {
        self.has_checkout = value;
    }

    fn wait_for_checkout(&self) -> bool {
        self.wait_for_checkout
    }

    fn set_wait_for_checkout(&mut self, value: bool) {
        self.wait_for_checkout = value;
    }

    fn total_size(&self) -> usize {
        self.total_size
    }

    async fn add_event(&mut self, event: RecordingEvent) -> Result<(), EventBufferError> {
        let data = serde_json::to_string(&event)?;
        let size = data.len();
        if self.total_size + size > self.max_size {
            return Err(EventBufferError::SizeExceeded {
                size: self.total_size + size,
                limit: self.max_size,
            });
        }

        self.worker
            .post_message(WorkerMethod::AddEvent, Some(data))
            .await?;
        self.total_size += size;
        self.earliest_timestamp = Some(match self.earliest_timestamp {
            Some(earliest) => earliest.min(event.timestamp),
            None => event.timestamp,
        });
        trace!("Posted event to worker ({} bytes, {} total)", size, self.total_size);
        Ok(())
    }

    async fn finish(&mut self) -> Result<ReplayPayload, EventBufferError> {
        self.reset();
        match self.worker.post_message(WorkerMethod::Finish, None).await? {
            Some(WorkerPayload::Compressed(bytes)) => Ok(ReplayPayload::Compressed(bytes)),
            _ => Err(WorkerError::Rejected {
                method: WorkerMethod::Finish.as_str().to_string(),
                message: "finish returned no payload".to_string(),
            }
            .into()),
        }
    }

    async fn clear(&mut self) -> Result<(), EventBufferError> {
        self.reset();
        self.worker.post_message(WorkerMethod::Clear, None).await?;
        Ok(())
    }

    fn earliest_timestamp(&self) -> Option<i64> {
        self.earliest_timestamp
    }

    fn destroy(&mut self) {
        self.reset();
        self.worker.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_buffer::event_size;
    use crate::event_buffer::worker::{ThreadWorkerFactory, WorkerFactory};
    use crate::recording::types::EventType;
    use flate2::read::ZlibDecoder;
    use serde_json::json;
    use std::io::Read;

    fn event(ts: i64) -> RecordingEvent {
        RecordingEvent::new(EventType::IncrementalSnapshot, ts, json!({ "source": 0 }))
    }

    async fn ready_buffer(max_size: usize) -> EventBufferCompressionWorker {
        let mut worker = WorkerHandle::new(ThreadWorkerFactory.spawn().unwrap());
        worker.ensure_ready().await.unwrap();
        EventBufferCompressionWorker::new(worker, max_size)
    }

    fn inflate(payload: ReplayPayload) -> Vec<RecordingEvent> {
        let ReplayPayload::Compressed(bytes) = payload else {
            panic!("expected compressed payload");
        };
        let mut text = String::new();
        ZlibDecoder::new(bytes.as_slice())
            .read_to_string(&mut text)
            .unwrap();
        serde_json::from_str(&text).unwrap()
    }

    #[tokio::test]
    async fn finish_returns_compressed_events() {
        let mut buffer = ready_buffer(1_000).await;
        buffer.add_event(event(20)).await.unwrap();
        buffer.add_event(event(10)).await.unwrap();
        assert_eq!(buffer.earliest_timestamp(), Some(10));

        let events = inflate(buffer.finish().await.unwrap());
        assert_eq!(events, vec![event(20), event(10)]);
        assert!(!buffer.has_events());

        buffer.add_event(event(30)).await.unwrap();
        assert_eq!(inflate(buffer.finish().await.unwrap()), vec![event(30)]);
    }

    #[tokio::test]
    async fn size_ceiling_is_checked_before_posting() {
        let size = event_size(&event(1)).unwrap();
        let mut buffer = ready_buffer(size).await;
        buffer.add_event(event(1)).await.unwrap();
        assert!(buffer.add_event(event(2)).await.unwrap_err().is_size_exceeded());
        assert_eq!(inflate(buffer.finish().await.unwrap()), vec![event(1)]);
    }

    #[tokio::test]
    async fn clear_drops_events_in_the_worker() {
        let mut buffer = ready_buffer(1_000).await;
        buffer.add_event(event(1)).await.unwrap();
        buffer.clear().await.unwrap();
        assert_eq!(buffer.total_size(), 0);
        assert!(inflate(buffer.finish().await.unwrap()).is_empty());
    }
}
