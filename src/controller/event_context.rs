/// Errors and traces linked to a single segment are capped at this many.
pub const MAX_LINKED_IDS: usize = 100;

/// Per-segment metadata sent along with the recording.
///
/// `initial_timestamp` and `initial_url` survive [`EventContext::clear`];
/// everything else is reset for every segment.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventContext {
    pub initial_timestamp: i64,
    pub initial_url: Option<String>,
    pub error_ids: Vec<String>,
    pub trace_ids: Vec<String>,
    pub urls: Vec<String>,
}

impl EventContext {
    pub fn new(initial_timestamp: i64) -> Self {
        Self {
            initial_timestamp,
            ..Default::default()
        }
    }

    /// Returns `false` when the id is a duplicate or the cap is reached.
    pub fn add_error_id(&mut self, id: &str) -> bool {
        add_linked_id(&mut self.error_ids, id)
    }

    pub fn add_trace_id(&mut self, id: &str) -> bool {
        add_linked_id(&mut self.trace_ids, id)
    }

    pub fn add_url(&mut self, url: &str) {
        self.urls.push(url.to_string());
    }

    pub fn clear(&mut self) {
        self.error_ids.clear();
        self.trace_ids.clear();
        self.urls.clear();
    }

    /// Snapshot for the segment being sent, then clear.
    pub fn pop(&mut self) -> EventContext {
        let popped = self.clone();
        self.clear();
        popped
    }
}

fn add_linked_id(ids: &mut Vec<String>, id: &str) -> bool {
    if ids.len() >= MAX_LINKED_IDS || ids.iter().any(|known| known == id) {
        return false;
    }
    ids.push(id.to_string());
    true
}
