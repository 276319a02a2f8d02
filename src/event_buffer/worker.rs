//! Compression worker protocol.
//!
//! The worker is a background executor with no access to recorder state.
//! It receives [`WorkerRequest`]s and answers each with a
//! [`WorkerResponse`] carrying the same `id`. Right after starting, it sends
//! one unsolicited response with `id: 0` and `method: init` reporting
//! whether it is usable.
//!
//! [`WorkerHandle`] is the caller's side: it numbers requests, keeps the
//! outstanding ones in a map and resolves each from a dispatcher task as
//! responses arrive. The transport between the two is a pair of channels
//! produced by a [`WorkerFactory`], so the worker can live on a thread, in a
//! subprocess behind a pipe, or in-process for tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use log::{debug, error, trace, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::error_handling::types::WorkerError;

use super::compressor::Compressor;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WorkerMethod {
    Init,
    Clear,
    AddEvent,
    Finish,
}

impl WorkerMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerMethod::Init => "init",
            WorkerMethod::Clear => "clear",
            WorkerMethod::AddEvent => "addEvent",
            WorkerMethod::Finish => "finish",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerRequest {
    pub id: u64,
    pub method: WorkerMethod,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arg: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WorkerPayload {
    Compressed(Vec<u8>),
    Error(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerResponse {
    pub id: u64,
    pub method: WorkerMethod,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<WorkerPayload>,
}

impl WorkerResponse {
    fn ok(id: u64, method: WorkerMethod, response: Option<WorkerPayload>) -> Self {
        Self {
            id,
            method,
            success: true,
            response,
        }
    }

    fn failed(id: u64, method: WorkerMethod, message: String) -> Self {
        Self {
            id,
            method,
            success: false,
            response: Some(WorkerPayload::Error(message)),
        }
    }
}

/// Caller's ends of a freshly started worker.
pub struct WorkerChannel {
    pub requests: mpsc::UnboundedSender<WorkerRequest>,
    pub responses: mpsc::UnboundedReceiver<WorkerResponse>,
}

/// Starts compression workers.
pub trait WorkerFactory: Send + Sync {
    fn spawn(&self) -> Result<WorkerChannel, WorkerError>;
}

/// Runs the compression worker on a dedicated OS thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadWorkerFactory;

impl WorkerFactory for ThreadWorkerFactory {
    fn spawn(&self) -> Result<WorkerChannel, WorkerError> {
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (response_tx, response_rx) = mpsc::unbounded_channel();
        std::thread::Builder::new()
            .name("replay-compression".to_string())
            .spawn(move || run_worker(request_rx, response_tx))
            .map_err(|e| WorkerError::InitFailed(e.to_string()))?;
        Ok(WorkerChannel {
            requests: request_tx,
            responses: response_rx,
        })
    }
}

/// Worker loop. Blocks the calling thread until the request side closes.
pub fn run_worker(
    mut requests: mpsc::UnboundedReceiver<WorkerRequest>,
    responses: mpsc::UnboundedSender<WorkerResponse>,
) {
    let mut compressor = match Compressor::new() {
        Ok(compressor) => compressor,
        Err(e) => {
            let _ = responses.send(WorkerResponse::failed(0, WorkerMethod::Init, e.to_string()));
            return;
        }
    };
    if responses
        .send(WorkerResponse::ok(0, WorkerMethod::Init, None))
        .is_err()
    {
        return;
    }

    while let Some(request) = requests.blocking_recv() {
        let id = request.id;
        let method = request.method;
        let result = match method {
            WorkerMethod::Init => Ok(None),
            WorkerMethod::Clear => compressor.clear().map(|_| None),
            WorkerMethod::AddEvent => match request.arg {
                Some(ref data) => compressor.add_event(data).map(|_| None),
                None => Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "addEvent without event data",
                )),
            },
            WorkerMethod::Finish => compressor
                .finish()
                .map(|bytes| Some(WorkerPayload::Compressed(bytes))),
        };
        let response = match result {
            Ok(payload) => WorkerResponse::ok(id, method, payload),
            Err(e) => WorkerResponse::failed(id, method, e.to_string()),
        };
        if responses.send(response).is_err() {
            break;
        }
    }
}

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<WorkerResponse>>>>;

enum Readiness {
    Loading(oneshot::Receiver<Result<(), WorkerError>>),
    Ready,
    Failed(WorkerError),
}

/// Request/response client of a compression worker.
pub struct WorkerHandle {
    requests: Option<mpsc::UnboundedSender<WorkerRequest>>,
    pending: Pending,
    next_id: AtomicU64,
    readiness: Readiness,
    dispatcher: JoinHandle<()>,
}

impl WorkerHandle {
    /// Wraps `channel` and starts routing its responses. Needs a tokio runtime.
    pub fn new(channel: WorkerChannel) -> Self {
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let (ready_tx, ready_rx) = oneshot::channel();
        let dispatcher = tokio::spawn(dispatch(channel.responses, Arc::clone(&pending), ready_tx));
        Self {
            requests: Some(channel.requests),
            pending,
            next_id: AtomicU64::new(1),
            readiness: Readiness::Loading(ready_rx),
            dispatcher,
        }
    }

    /// Non-blocking readiness check. `None` while the worker is still loading.
    pub fn poll_ready(&mut self) -> Option<Result<(), WorkerError>> {
        let outcome = match &mut self.readiness {
            Readiness::Ready => return Some(Ok(())),
            Readiness::Failed(e) => return Some(Err(e.clone())),
            Readiness::Loading(rx) => match rx.try_recv() {
                Ok(outcome) => outcome,
                Err(oneshot::error::TryRecvError::Empty) => return None,
                Err(oneshot::error::TryRecvError::Closed) => Err(WorkerError::ChannelClosed),
            },
        };
        Some(self.settle(outcome))
    }

    /// Waits until the worker reported whether it is usable.
    pub async fn ensure_ready(&mut self) -> Result<(), WorkerError> {
        let outcome = match &mut self.readiness {
            Readiness::Ready => return Ok(()),
            Readiness::Failed(e) => return Err(e.clone()),
            Readiness::Loading(rx) => match rx.await {
                Ok(outcome) => outcome,
                Err(_) => Err(WorkerError::ChannelClosed),
            },
        };
        self.settle(outcome)
    }

    fn settle(&mut self, outcome: Result<(), WorkerError>) -> Result<(), WorkerError> {
        match outcome {
            Ok(()) => {
                debug!("Compression worker is ready");
                self.readiness = Readiness::Ready;
                Ok(())
            }
            Err(e) => {
                self.readiness = Readiness::Failed(e.clone());
                Err(e)
            }
        }
    }

    /// Sends one request and waits for its response.
    pub async fn post_message(
        &self,
        method: WorkerMethod,
        arg: Option<String>,
    ) -> Result<Option<WorkerPayload>, WorkerError> {
        let requests = self.requests.as_ref().ok_or(WorkerError::ChannelClosed)?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().map_err(|_| WorkerError::ChannelClosed)?;
            pending.insert(id, tx);
        }

        if requests.send(WorkerRequest { id, method, arg }).is_err() {
            if let Ok(mut pending) = self.pending.lock() {
                pending.remove(&id);
            }
            return Err(WorkerError::ChannelClosed);
        }

        let response = rx.await.map_err(|_| WorkerError::ChannelClosed)?;
        if !response.success {
            let message = match response.response {
                Some(WorkerPayload::Error(message)) => message,
                _ => "unknown worker error".to_string(),
            };
            error!("Worker {} request {} failed: {}", method.as_str(), id, message);
            return Err(WorkerError::Rejected {
                method: method.as_str().to_string(),
                message,
            });
        }
        Ok(response.response)
    }

    /// Closes the request channel, which ends the worker.
    pub fn destroy(&mut self) {
        if self.requests.take().is_some() {
            debug!("Destroying compression worker");
        }
        self.dispatcher.abort();
        if let Ok(mut pending) = self.pending.lock() {
            pending.clear();
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.destroy();
    }
}

async fn dispatch(
    mut responses: mpsc::UnboundedReceiver<WorkerResponse>,
    pending: Pending,
    ready: oneshot::Sender<Result<(), WorkerError>>,
) {
    let mut ready = Some(ready);
    while let Some(response) = responses.recv().await {
        if response.method == WorkerMethod::Init && response.id == 0 {
            let outcome = if response.success {
                Ok(())
            } else {
                let message = match response.response {
                    Some(WorkerPayload::Error(message)) => message,
                    _ => "worker refused to start".to_string(),
                };
                Err(WorkerError::InitFailed(message))
            };
            if let Some(ready) = ready.take() {
                let _ = ready.send(outcome);
            }
            continue;
        }

        let waiter = pending
            .lock()
            .ok()
            .and_then(|mut pending| pending.remove(&response.id));
        match waiter {
            Some(waiter) => {
                trace!("Worker answered request {}", response.id);
                let _ = waiter.send(response);
            }
            None => warn!("Dropping worker response for unknown request {}", response.id),
        }
    }

    if let Some(ready) = ready.take() {
        let _ = ready.send(Err(WorkerError::InitFailed(
            "worker exited before it was ready".to_string(),
        )));
    }
    if let Ok(mut pending) = pending.lock() {
        pending.clear();
    }
}
