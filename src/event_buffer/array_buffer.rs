use async_trait::async_trait;
use log::trace;

use crate::error_handling::types::EventBufferError;
use crate::recording::types::RecordingEvent;

use super::{event_size, BufferKind, EventBuffer, ReplayPayload};

/// Keeps events in memory and serializes them on finish.
#[derive(Debug)]
pub struct EventBufferArray {
    events: Vec<RecordingEvent>,
    total_size: usize,
    max_size: usize,
    has_checkout: bool,
    wait_for_checkout: bool,
}

impl EventBufferArray {
    pub fn new(max_size: usize) -> Self {
        Self {
            events: Vec::new(),
            total_size: 0,
            max_size,
            has_checkout: false,
            wait_for_checkout: false,
        }
    }

    /// Removes and returns the buffered events, resetting the size.
    pub(crate) fn take_events(&mut self) -> Vec<RecordingEvent> {
        self.total_size = 0;
        std::mem::take(&mut self.events)
    }

    /// Puts previously taken events back in front of anything buffered since.
    pub(crate) fn restore_events(&mut self, mut events: Vec<RecordingEvent>) {
        let restored: usize = events
            .iter()
            .filter_map(|e| event_size(e).ok())
            .sum();
        events.append(&mut self.events);
        self.events = events;
        self.total_size += restored;
    }
}

#[async_trait]
impl EventBuffer for EventBufferArray {
    fn kind(&self) -> BufferKind {
        BufferKind::Sync
    }

    fn has_events(&self) -> bool {
        !self.events.is_empty()
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
        let size = event_size(&event)?;
        if self.total_size + size > self.max_size {
            return Err(EventBufferError::SizeExceeded {
                size: self.total_size + size,
                limit: self.max_size,
            });
        }
        self.total_size += size;
        self.events.push(event);
        trace!("Buffered event ({} bytes, {} total)", size, self.total_size);
        Ok(())
    }

    async fn finish(&mut self) -> Result<ReplayPayload, EventBufferError> {
        let events = self.take_events();
        self.has_checkout = false;
        Ok(ReplayPayload::Json(serde_json::to_string(&events)?))
    }

    async fn clear(&mut self) -> Result<(), EventBufferError> {
        self.events.clear();
        self.total_size = 0;
        self.has_checkout = false;
        Ok(())
    }

    fn earliest_timestamp(&self) -> Option<i64> {
        self.events.iter().map(|e| e.timestamp).min()
    }

    fn destroy(&mut self) {
        self.events = Vec::new();
        self.total_size = 0;
    }
}
