//! Events of the host SDK's own capture pipeline.
//!
//! The controller only needs a narrow view of them: whether an event is an
//! error or a transaction, its ids, and its tags (where the replay id is
//! attached).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Tag carrying the replay id on linked events.
pub const REPLAY_ID_TAG: &str = "replayId";

/// Message of the error reported when a segment cannot be delivered.
/// Such errors never promote a buffered replay.
pub const UNABLE_TO_SEND_REPLAY: &str = "Unable to send Replay";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HostEvent {
    pub event_id: String,
    /// `None` for errors, otherwise `transaction`, `replay_event`, ...
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub event_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exception: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
}

impl HostEvent {
    /// An error event carrying an exception.
    pub fn error(event_id: impl Into<String>, exception: Value) -> Self {
        Self {
            event_id: event_id.into(),
            exception: Some(exception),
            ..Default::default()
        }
    }

    pub fn transaction(event_id: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self {
            event_id: event_id.into(),
            event_type: Some("transaction".to_string()),
            trace_id: Some(trace_id.into()),
            ..Default::default()
        }
    }

    pub fn is_error_event(&self) -> bool {
        self.event_type.is_none()
    }

    pub fn is_transaction_event(&self) -> bool {
        self.event_type.as_deref() == Some("transaction")
    }

    pub fn replay_id(&self) -> Option<&str> {
        self.tags.get(REPLAY_ID_TAG).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn event_kinds() {
        let error = HostEvent::error("e1", json!({ "values": [] }));
        assert!(error.is_error_event());
        assert!(!error.is_transaction_event());

        let transaction = HostEvent::transaction("t1", "trace-1");
        assert!(transaction.is_transaction_event());
        assert!(!transaction.is_error_event());
        assert_eq!(transaction.replay_id(), None);
    }

    #[test]
    fn error_events_deserialize_without_a_type() {
        let event: HostEvent =
            serde_json::from_str(r#"{"event_id":"e1","tags":{"replayId":"r1"}}"#).unwrap();
        assert!(event.is_error_event());
        assert_eq!(event.replay_id(), Some("r1"));
    }
}
