use async_trait::async_trait;
use log::{debug, warn};

use crate::error_handling::types::{EventBufferError, WorkerError};
use crate::recording::types::RecordingEvent;

use super::array_buffer::EventBufferArray;
use super::compression_buffer::EventBufferCompressionWorker;
use super::worker::WorkerHandle;
use super::{BufferKind, EventBuffer, ReplayPayload};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WorkerState {
    Loading,
    Active,
    Failed,
}

/// Buffers in memory until the compression worker is ready, then moves to it.
///
/// Readiness is checked at the start of every operation. Once the worker
/// reports ready, the events already buffered are replayed into it in their
/// original order before it becomes the active buffer. A worker that fails
/// to start is abandoned and the in-memory buffer stays active for the rest
/// of the recording.
pub struct EventBufferProxy {
    fallback: EventBufferArray,
    compression: EventBufferCompressionWorker,
    state: WorkerState,
}

impl EventBufferProxy {
    pub fn new(worker: WorkerHandle, max_size: usize) -> Self {
        Self {
            fallback: EventBufferArray::new(max_size),
            compression: EventBufferCompressionWorker::new(worker, max_size),
            state: WorkerState::Loading,
        }
    }

    fn active(&self) -> &dyn EventBuffer {
        match self.state {
            WorkerState::Active => &self.compression,
            _ => &self.fallback,
        }
    }

    fn active_mut(&mut self) -> &mut dyn EventBuffer {
        match self.state {
            WorkerState::Active => &mut self.compression,
            _ => &mut self.fallback,
        }
    }

    /// Switches over if the worker finished loading since the last call.
    async fn poll_worker(&mut self) {
        if self.state != WorkerState::Loading {
            return;
        }
        match self.compression.worker_mut().poll_ready() {
            None => {}
            Some(outcome) => self.on_worker_outcome(outcome).await,
        }
    }

    /// Waits for the worker to load (or fail) and switches over if it did.
    pub async fn ensure_worker_is_loaded(&mut self) -> Result<(), WorkerError> {
        match self.state {
            WorkerState::Active => return Ok(()),
            WorkerState::Failed => return Err(WorkerError::ChannelClosed),
            WorkerState::Loading => {}
        }
        let outcome = self.compression.worker_mut().ensure_ready().await;
        let result = outcome.clone();
        self.on_worker_outcome(outcome).await;
        result
    }

    async fn on_worker_outcome(&mut self, outcome: Result<(), WorkerError>) {
        match outcome {
            Ok(()) => {
                if let Err(e) = self.switch_to_compression_worker().await {
                    warn!("Failed to migrate events to compression worker: {}", e);
                    self.abandon_worker();
                }
            }
            Err(e) => {
                warn!("Failed to load compression worker, using in-memory buffer: {}", e);
                self.abandon_worker();
            }
        }
    }

    fn abandon_worker(&mut self) {
        self.state = WorkerState::Failed;
        self.compression.destroy();
    }

    /// Replays every buffered event into the worker, then makes it active.
    /// On failure nothing is lost: the events go back into the fallback.
    async fn switch_to_compression_worker(&mut self) -> Result<(), EventBufferError> {
        let has_checkout = self.fallback.has_checkout();
        let wait_for_checkout = self.fallback.wait_for_checkout();
        let events = self.fallback.take_events();
        debug!("Migrating {} event(s) to compression worker", events.len());

        let mut failure = None;
        for (index, event) in events.iter().enumerate() {
            if let Err(e) = self.compression.add_event(event.clone()).await {
                warn!("Migration stopped at event {}: {}", index, e);
                failure = Some(e);
                break;
            }
        }
        if let Some(e) = failure {
            if let Err(e) = self.compression.clear().await {
                warn!("Unable to clear compression worker after failed migration: {}", e);
            }
            self.fallback.restore_events(events);
            return Err(e);
        }

        self.compression.set_has_checkout(has_checkout);
        self.compression.set_wait_for_checkout(wait_for_checkout);
        self.state = WorkerState::Active;
        self.fallback.destroy();
        Ok(())
    }
}

#[async_trait]
impl EventBuffer for EventBufferProxy {
    fn kind(&self) -> BufferKind {
        self.active().kind()
    }

    fn has_events(&self) -> bool {
        self.active().has_events()
    }

    fn has_checkout(&self) -> bool {
        self.active().has_checkout()
    }

    fn set_has_checkout(&mut self, value: bool) {
        self.active_mut().set_has_checkout(value);
    }

    fn wait_for_checkout(&self) -> bool {
        self.active().wait_for_checkout()
    }

    fn set_wait_for_checkout(&mut self, value: bool) {
        self.active_mut().set_wait_for_checkout(value);
    }

    fn total_size(&self) -> usize {
        self.active().total_size()
    }

    async fn add_event(&mut self, event: RecordingEvent) -> Result<(), EventBufferError> {
        self.poll_worker().await;
        self.active_mut().add_event(event).await
    }

    async fn finish(&mut self) -> Result<ReplayPayload, EventBufferError> {
        let _ = self.ensure_worker_is_loaded().await;
        self.active_mut().finish().await
    }

    async fn clear(&mut self) -> Result<(), EventBufferError> {
        self.poll_worker().await;
        self.active_mut().clear().await
    }

    fn earliest_timestamp(&self) -> Option<i64> {
        self.active().earliest_timestamp()
    }

    fn destroy(&mut self) {
        self.fallback.destroy();
        self.compression.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_buffer::worker::{
        run_worker, WorkerChannel, WorkerFactory, WorkerMethod, WorkerPayload, WorkerRequest, WorkerResponse,
    };
    use crate::recording::types::EventType;
    use flate2::read::ZlibDecoder;
    use serde_json::json;
    use std::io::Read;
    use std::sync::mpsc as std_mpsc;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    /// Starts a real worker thread that waits for the gate before loading.
    struct GatedFactory {
        gate: Mutex<Option<std_mpsc::Receiver<()>>>,
    }

    impl WorkerFactory for GatedFactory {
        fn spawn(&self) -> Result<WorkerChannel, WorkerError> {
            let gate = self.gate.lock().unwrap().take().unwrap();
            let (request_tx, request_rx) = mpsc::unbounded_channel();
            let (response_tx, response_rx) = mpsc::unbounded_channel();
            std::thread::spawn(move || {
                if gate.recv().is_ok() {
                    run_worker(request_rx, response_tx);
                }
            });
            Ok(WorkerChannel {
                requests: request_tx,
                responses: response_rx,
            })
        }
    }

    fn gated() -> (std_mpsc::Sender<()>, EventBufferProxy) {
        let (open, gate) = std_mpsc::channel();
        let factory = GatedFactory {
            gate: Mutex::new(Some(gate)),
        };
        let worker = WorkerHandle::new(factory.spawn().unwrap());
        (open, EventBufferProxy::new(worker, 10_000))
    }

    fn event(ts: i64) -> RecordingEvent {
        RecordingEvent::new(EventType::IncrementalSnapshot, ts, json!({ "n": ts }))
    }

    fn decode(payload: ReplayPayload) -> Vec<RecordingEvent> {
        match payload {
            ReplayPayload::Json(text) => serde_json::from_str(&text).unwrap(),
            ReplayPayload::Compressed(bytes) => {
                let mut text = String::new();
                ZlibDecoder::new(bytes.as_slice())
                    .read_to_string(&mut text)
                    .unwrap();
                serde_json::from_str(&text).unwrap()
            }
        }
    }

    #[tokio::test]
    async fn buffered_events_migrate_in_order_without_loss() {
        let (open, mut buffer) = gated();
        buffer.add_event(event(1)).await.unwrap();
        buffer.add_event(event(2)).await.unwrap();
        buffer.set_has_checkout(true);
        assert_eq!(buffer.kind(), BufferKind::Sync);
        let size_before = buffer.total_size();

        open.send(()).unwrap();
        buffer.ensure_worker_is_loaded().await.unwrap();
        assert_eq!(buffer.kind(), BufferKind::Worker);
        assert!(buffer.has_checkout());
        assert_eq!(buffer.total_size(), size_before);

        buffer.add_event(event(3)).await.unwrap();
        let payload = buffer.finish().await.unwrap();
        assert!(payload.is_compressed());
        assert_eq!(decode(payload), vec![event(1), event(2), event(3)]);
    }

    #[tokio::test]
    async fn finish_waits_for_the_worker() {
        let (open, mut buffer) = gated();
        buffer.add_event(event(1)).await.unwrap();
        open.send(()).unwrap();
        let payload = buffer.finish().await.unwrap();
        assert!(payload.is_compressed());
        assert_eq!(decode(payload), vec![event(1)]);
    }

    #[tokio::test]
    async fn init_failure_falls_back_for_good() {
        let (open, mut buffer) = gated();
        buffer.add_event(event(1)).await.unwrap();
        drop(open);

        assert!(buffer.ensure_worker_is_loaded().await.is_err());
        assert_eq!(buffer.kind(), BufferKind::Sync);
        buffer.add_event(event(2)).await.unwrap();
        let payload = buffer.finish().await.unwrap();
        assert_eq!(payload, ReplayPayload::Json(serde_json::to_string(&vec![event(1), event(2)]).unwrap()));
        assert!(buffer.ensure_worker_is_loaded().await.is_err());
    }

    #[tokio::test]
    async fn worker_refusing_to_start_is_abandoned() {
        let (request_tx, _request_rx) = mpsc::unbounded_channel();
        let (response_tx, response_rx) = mpsc::unbounded_channel();
        response_tx
            .send(WorkerResponse {
                id: 0,
                method: WorkerMethod::Init,
                success: false,
                response: None,
            })
            .unwrap();
        let worker = WorkerHandle::new(WorkerChannel {
            requests: request_tx,
            responses: response_rx,
        });
        let mut buffer = EventBufferProxy::new(worker, 10_000);
        buffer.add_event(event(1)).await.unwrap();
        assert!(!buffer.finish().await.unwrap().is_compressed());
    }

    #[tokio::test]
    async fn failed_migration_keeps_events_in_memory() {
        let (request_tx, mut request_rx) = mpsc::unbounded_channel::<WorkerRequest>();
        let (response_tx, response_rx) = mpsc::unbounded_channel();
        response_tx
            .send(WorkerResponse {
                id: 0,
                method: WorkerMethod::Init,
                success: true,
                response: None,
            })
            .unwrap();
        let seen = std::sync::Arc::new(Mutex::new(Vec::new()));
        let methods = std::sync::Arc::clone(&seen);
        tokio::spawn(async move {
            while let Some(request) = request_rx.recv().await {
                methods.lock().unwrap().push(request.method);
                let _ = response_tx.send(WorkerResponse {
                    id: request.id,
                    method: request.method,
                    success: false,
                    response: Some(WorkerPayload::Error("out of memory".to_string())),
                });
            }
        });
        let worker = WorkerHandle::new(WorkerChannel {
            requests: request_tx,
            responses: response_rx,
        });

        let mut buffer = EventBufferProxy::new(worker, 10_000);
        buffer.add_event(event(1)).await.unwrap();
        buffer.add_event(event(2)).await.unwrap();
        let _ = buffer.ensure_worker_is_loaded().await;

        assert_eq!(buffer.kind(), BufferKind::Sync);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![WorkerMethod::AddEvent, WorkerMethod::Clear]
        );
        let payload = buffer.finish().await.unwrap();
        assert_eq!(decode(payload), vec![event(1), event(2)]);
    }
}
