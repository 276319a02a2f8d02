//! Replay envelope construction.
//!
//! A replay segment travels as one envelope with two items:
//!
//! ```text
//! {"event_id":"<replay id>","sent_at":"...","sdk":{...}}
//! {"type":"replay_event"}
//! {<replay event json>}
//! {"type":"replay_recording","length":<bytes>}
//! {"segment_id":3}
//! <recording payload, json or zlib bytes>
//! ```
//!
//! The recording item's payload is its own one-line JSON header followed
//! by a newline and the segment payload.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::event_buffer::ReplayPayload;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SdkInfo {
    pub name: String,
    pub version: String,
}

impl Default for SdkInfo {
    fn default() -> Self {
        Self {
            name: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Replay metadata sent alongside every segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplayEvent {
    #[serde(rename = "type")]
    pub kind: String,
    pub event_id: String,
    pub replay_id: String,
    pub segment_id: u32,
    /// Seconds.
    pub replay_start_timestamp: f64,
    /// Seconds.
    pub timestamp: f64,
    pub error_ids: Vec<String>,
    pub trace_ids: Vec<String>,
    pub urls: Vec<String>,
    pub replay_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdk: Option<SdkInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvelopeHeader {
    pub event_id: String,
    pub sent_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdk: Option<SdkInfo>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EnvelopeItem {
    pub header: Value,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub header: EnvelopeHeader,
    pub items: Vec<EnvelopeItem>,
}

impl Envelope {
    pub fn new(event_id: String, sent_at: String, sdk: Option<SdkInfo>) -> Self {
        Self {
            header: EnvelopeHeader {
                event_id,
                sent_at,
                sdk,
            },
            items: Vec::new(),
        }
    }

    /// Newline-separated header and item lines.
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        let mut out = serde_json::to_vec(&self.header)?;
        for item in &self.items {
            out.push(b'\n');
            out.extend(serde_json::to_vec(&item.header)?);
            out.push(b'\n');
            out.extend_from_slice(&item.payload);
        }
        Ok(out)
    }

    pub fn item(&self, kind: &str) -> Option<&EnvelopeItem> {
        self.items
            .iter()
            .find(|item| item.header.get("type").and_then(Value::as_str) == Some(kind))
    }
}

/// `{"segment_id":N}\n` followed by the payload.
pub fn prepare_recording_data(segment_id: u32, payload: &ReplayPayload) -> Vec<u8> {
    let mut data = format!("{{\"segment_id\":{}}}\n", segment_id).into_bytes();
    data.extend_from_slice(payload.as_bytes());
    data
}

pub fn create_replay_envelope(
    replay_event: &ReplayEvent,
    recording_data: Vec<u8>,
    sent_at: String,
) -> Result<Envelope, serde_json::Error> {
    let mut envelope = Envelope::new(
        replay_event.event_id.clone(),
        sent_at,
        replay_event.sdk.clone(),
    );
    envelope.items.push(EnvelopeItem {
        header: json!({ "type": "replay_event" }),
        payload: serde_json::to_vec(replay_event)?,
    });
    envelope.items.push(EnvelopeItem {
        header: json!({ "type": "replay_recording", "length": recording_data.len() }),
        payload: recording_data,
    });
    Ok(envelope)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn replay_event() -> ReplayEvent {
        ReplayEvent {
            kind: "replay_event".into(),
            event_id: "r1".into(),
            replay_id: "r1".into(),
            segment_id: 2,
            replay_start_timestamp: 1.5,
            timestamp: 3.0,
            error_ids: vec!["e1".into()],
            trace_ids: vec![],
            urls: vec!["https://example.com/".into()],
            replay_type: "session".into(),
            sdk: Some(SdkInfo::default()),
        }
    }

    #[test]
    fn recording_item_is_prefixed_with_segment_header() {
        let data = prepare_recording_data(2, &ReplayPayload::Json("[]".into()));
        assert_eq!(data, b"{\"segment_id\":2}\n[]".to_vec());
    }

    #[test]
    fn envelope_serializes_two_items() {
        let recording = prepare_recording_data(2, &ReplayPayload::Json("[]".into()));
        let envelope =
            create_replay_envelope(&replay_event(), recording, "2024-01-01T00:00:00Z".into())
                .unwrap();
        assert_eq!(envelope.items.len(), 2);
        assert_eq!(
            envelope.item("replay_recording").unwrap().header["length"],
            19
        );

        let text = String::from_utf8(envelope.to_bytes().unwrap()).unwrap();
        let lines: Vec<&str> = text.split('\n').collect();
        assert_eq!(lines.len(), 6);
        let header: Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(header["event_id"], "r1");
        let event: Value = serde_json::from_str(lines[2]).unwrap();
        assert_eq!(event["type"], "replay_event");
        assert_eq!(event["segment_id"], 2);
        assert_eq!(lines[4], "{\"segment_id\":2}");
        assert_eq!(lines[5], "[]");
    }
}
