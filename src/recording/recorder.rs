//! DOM recorder contract and a trace-replaying implementation.
//!
//! The controller never talks to a concrete recorder. It asks a
//! [`DomRecorder`] to start a recording, hands it a [`RecordingSink`] to emit
//! into, and keeps the returned [`RecorderHandle`] to stop it later. Each
//! `record` call is a fresh recording, so the recorder doubles as its own
//! factory.
//!
//! [`ScriptedRecorder`] replays a JSON-lines trace captured from a real
//! recorder, one entry per line:
//!
//! ```text
//! {"event":{"type":2,"timestamp":1700000000000,"data":{}},"isCheckout":true}
//! {"event":{"type":3,"timestamp":1700000000250,"data":{"source":2,"type":2,"id":7}},"nodes":[{"nodeId":7,"tagName":"button"}]}
//! ```
//!
//! Events keep their relative spacing but are rebased onto the current
//! clock, so a trace recorded last week still replays as "now".

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, trace, warn};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::watch;

use crate::click_detection::selector::ClickTarget;
use crate::configuration::types::PrivacyOptions;
use crate::context::Clock;
use crate::error_handling::types::RecorderError;

use super::types::{RecordingEvent, SOURCE_MUTATION};

/// Options passed to the recorder on every start.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordOptions {
    pub mask_selector: String,
    pub unmask_selector: String,
    pub block_selector: String,
    pub unblock_selector: String,
    pub ignore_selector: String,
    pub mask_all_text: bool,
    pub mask_all_inputs: bool,
    pub block_all_media: bool,
    /// Forces a full checkout at this interval (buffer mode only).
    pub checkout_every_ms: Option<u64>,
}

impl RecordOptions {
    pub fn from_privacy(privacy: &PrivacyOptions, checkout_every_ms: Option<u64>) -> Self {
        Self {
            mask_selector: privacy.mask_selector(),
            unmask_selector: privacy.unmask_selector(),
            block_selector: privacy.block_selector(),
            unblock_selector: privacy.unblock_selector(),
            ignore_selector: privacy.ignore_selector(),
            mask_all_text: privacy.mask_all_text,
            mask_all_inputs: privacy.mask_all_inputs,
            block_all_media: privacy.block_all_media,
            checkout_every_ms,
        }
    }
}

/// Receiver of everything a running recorder emits.
pub trait RecordingSink: Send + Sync {
    fn on_event(&self, event: RecordingEvent, is_checkout: bool);

    /// Called before a mutation batch of `count` changes is emitted.
    /// Returning `false` asks the recorder to drop the batch.
    fn on_mutation(&self, _count: usize) -> bool {
        true
    }
}

/// Stops the recording it was returned for. Dropping it stops as well.
pub struct RecorderHandle {
    stop: Option<Box<dyn FnOnce() + Send>>,
}

impl RecorderHandle {
    pub fn new(stop: impl FnOnce() + Send + 'static) -> Self {
        Self {
            stop: Some(Box::new(stop)),
        }
    }

    pub fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            stop();
        }
    }
}

impl Drop for RecorderHandle {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            stop();
        }
    }
}

impl std::fmt::Debug for RecorderHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecorderHandle")
            .field("running", &self.stop.is_some())
            .finish()
    }
}

pub trait DomRecorder: Send + Sync {
    /// Starts a new recording emitting into `sink`.
    fn record(
        &self,
        options: RecordOptions,
        sink: Arc<dyn RecordingSink>,
    ) -> Result<RecorderHandle, RecorderError>;

    /// Resolves a recorder node id to the element it mirrors.
    fn lookup_node(&self, _node_id: u64) -> Option<ClickTarget> {
        None
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TraceEntry {
    event: RecordingEvent,
    #[serde(default)]
    is_checkout: bool,
    #[serde(default)]
    nodes: Vec<ClickTarget>,
}

/// Number of DOM changes carried by a mutation event.
pub fn mutation_count(event: &RecordingEvent) -> Option<usize> {
    if event.incremental_source() != Some(SOURCE_MUTATION) {
        return None;
    }
    let len = |key: &str| {
        event
            .data
            .get(key)
            .and_then(Value::as_array)
            .map(Vec::len)
            .unwrap_or(0)
    };
    Some(len("adds") + len("removes") + len("attributes") + len("texts"))
}

/// Replays a captured recorder trace in real time.
///
/// Stopping and restarting continues from the next unplayed entry.
pub struct ScriptedRecorder {
    entries: Arc<Vec<TraceEntry>>,
    nodes: HashMap<u64, ClickTarget>,
    cursor: Arc<Mutex<usize>>,
    clock: Arc<dyn Clock>,
    done: watch::Sender<bool>,
}

impl ScriptedRecorder {
    pub fn from_file(path: &Path, clock: Arc<dyn Clock>) -> Result<Self, RecorderError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_jsonl(&content, clock)
    }

    pub fn from_jsonl(content: &str, clock: Arc<dyn Clock>) -> Result<Self, RecorderError> {
        let mut entries = Vec::new();
        for (index, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let entry: TraceEntry =
                serde_json::from_str(line).map_err(|e| RecorderError::InvalidTrace {
                    line: index + 1,
                    message: e.to_string(),
                })?;
            entries.push(entry);
        }
        let nodes = entries
            .iter()
            .flat_map(|entry| entry.nodes.iter())
            .map(|node| (node.node_id, node.clone()))
            .collect();
        debug!("Loaded recorder trace with {} event(s)", entries.len());

        let (done, _) = watch::channel(entries.is_empty());
        Ok(Self {
            entries: Arc::new(entries),
            nodes,
            cursor: Arc::new(Mutex::new(0)),
            clock,
            done,
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Resolves once every trace entry has been emitted.
    pub async fn finished(&self) {
        let mut rx = self.done.subscribe();
        let _ = rx.wait_for(|done| *done).await;
    }
}

impl DomRecorder for ScriptedRecorder {
    fn record(
        &self,
        options: RecordOptions,
        sink: Arc<dyn RecordingSink>,
    ) -> Result<RecorderHandle, RecorderError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| RecorderError::StartFailed(e.to_string()))?;
        trace!("Starting scripted recorder with {:?}", options);

        let start = match self.cursor.lock() {
            Ok(cursor) => *cursor,
            Err(_) => return Err(RecorderError::StartFailed("cursor poisoned".to_string())),
        };
        let Some(first) = self.entries.get(start) else {
            self.done.send_replace(true);
            return Ok(RecorderHandle::new(|| {}));
        };
        self.done.send_replace(false);

        let offset = self.clock.now_ms() - first.event.timestamp;
        let entries = Arc::clone(&self.entries);
        let cursor = Arc::clone(&self.cursor);
        let done = self.done.clone();

        let task = runtime.spawn(async move {
            let mut previous = entries[start].event.timestamp;
            for (index, entry) in entries.iter().enumerate().skip(start) {
                let delta = (entry.event.timestamp - previous).max(0) as u64;
                if delta > 0 {
                    tokio::time::sleep(Duration::from_millis(delta)).await;
                }
                previous = entry.event.timestamp;
                if let Ok(mut cursor) = cursor.lock() {
                    *cursor = index + 1;
                }

                if let Some(count) = mutation_count(&entry.event) {
                    if !sink.on_mutation(count) {
                        trace!("Mutation batch of {} dropped by sink", count);
                        continue;
                    }
                }
                let mut event = entry.event.clone();
                event.timestamp += offset;
                sink.on_event(event, entry.is_checkout);
            }
            done.send_replace(true);
        });

        Ok(RecorderHandle::new(move || task.abort()))
    }

    fn lookup_node(&self, node_id: u64) -> Option<ClickTarget> {
        let node = self.nodes.get(&node_id).cloned();
        if node.is_none() {
            warn!("Unknown recorder node {}", node_id);
        }
        node
    }
}
