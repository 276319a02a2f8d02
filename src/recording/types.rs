//! Common data types used across the recording subsystem.
//!
//! `RecordingEvent` mirrors the DOM recorder's serialized event shape
//! (`{ type, timestamp, data }`), `Breadcrumb` is the host SDK's breadcrumb,
//! and `ReplayPerformanceEntry` is a finished span/metric written into the
//! recording as a custom event.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// Incremental snapshot sources the controller cares about.
pub const SOURCE_MUTATION: u64 = 0;
pub const SOURCE_MOUSE_INTERACTION: u64 = 2;
pub const SOURCE_SCROLL: u64 = 3;

/// Sources that count as "the page changed" for click classification:
/// mutation, media interaction, style sheet rule, canvas mutation,
/// selection, style declaration and adopted style sheet.
pub const MUTATION_SOURCES: [u64; 7] = [0, 7, 8, 9, 13, 14, 15];

/// `MouseInteractions.Click` in the recorder's numbering.
pub const MOUSE_INTERACTION_CLICK: u64 = 2;

/// Recorder event kinds, serialized as their numeric tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum EventType {
    DomContentLoaded,
    Load,
    FullSnapshot,
    IncrementalSnapshot,
    Meta,
    Custom,
    Plugin,
}

impl From<EventType> for u8 {
    fn from(value: EventType) -> Self {
        match value {
            EventType::DomContentLoaded => 0,
            EventType::Load => 1,
            EventType::FullSnapshot => 2,
            EventType::IncrementalSnapshot => 3,
            EventType::Meta => 4,
            EventType::Custom => 5,
            EventType::Plugin => 6,
        }
    }
}

impl TryFrom<u8> for EventType {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(EventType::DomContentLoaded),
            1 => Ok(EventType::Load),
            2 => Ok(EventType::FullSnapshot),
            3 => Ok(EventType::IncrementalSnapshot),
            4 => Ok(EventType::Meta),
            5 => Ok(EventType::Custom),
            6 => Ok(EventType::Plugin),
            other => Err(format!("unknown recording event type {}", other)),
        }
    }
}

/// One serialized recording event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordingEvent {
    #[serde(rename = "type")]
    pub event_type: EventType,
    /// Milliseconds since the epoch.
    pub timestamp: i64,
    #[serde(default)]
    pub data: Value,
}

impl RecordingEvent {
    pub fn new(event_type: EventType, timestamp: i64, data: Value) -> Self {
        Self {
            event_type,
            timestamp,
            data,
        }
    }

    /// Builds a custom event carrying `{ tag, payload }`.
    pub fn custom(tag: &str, timestamp: i64, payload: Value) -> Self {
        Self::new(
            EventType::Custom,
            timestamp,
            json!({ "tag": tag, "payload": payload }),
        )
    }

    pub fn custom_tag(&self) -> Option<&str> {
        if self.event_type != EventType::Custom {
            return None;
        }
        self.data.get("tag").and_then(Value::as_str)
    }

    pub fn incremental_source(&self) -> Option<u64> {
        if self.event_type != EventType::IncrementalSnapshot {
            return None;
        }
        self.data.get("source").and_then(Value::as_u64)
    }

    /// Whether this is an incremental change of the page itself.
    pub fn is_page_change(&self) -> bool {
        self.incremental_source()
            .map(|source| MUTATION_SOURCES.contains(&source))
            .unwrap_or(false)
    }

    /// `href` of a meta event.
    pub fn meta_href(&self) -> Option<&str> {
        if self.event_type != EventType::Meta {
            return None;
        }
        self.data.get("href").and_then(Value::as_str)
    }

    /// Node id of a click interaction, if this is one.
    pub fn clicked_node_id(&self) -> Option<u64> {
        if self.incremental_source() != Some(SOURCE_MOUSE_INTERACTION) {
            return None;
        }
        if self.data.get("type").and_then(Value::as_u64) != Some(MOUSE_INTERACTION_CLICK) {
            return None;
        }
        self.data.get("id").and_then(Value::as_u64)
    }
}

/// Converts a timestamp that may be in seconds into milliseconds.
pub fn timestamp_to_ms(timestamp: f64) -> i64 {
    if timestamp > 9_999_999_999.0 {
        timestamp as i64
    } else {
        (timestamp * 1000.0) as i64
    }
}

/// Converts a millisecond timestamp into fractional seconds.
pub fn ms_to_secs(timestamp_ms: i64) -> f64 {
    timestamp_ms as f64 / 1000.0
}

/// A host SDK breadcrumb. Timestamps are in seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Breadcrumb {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,
    pub timestamp: f64,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub data: Map<String, Value>,
}

impl Breadcrumb {
    pub fn new(category: impl Into<String>, timestamp: f64) -> Self {
        Self {
            kind: Some("default".to_string()),
            category: Some(category.into()),
            message: None,
            level: None,
            timestamp,
            data: Map::new(),
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_data(mut self, key: &str, value: Value) -> Self {
        self.data.insert(key.to_string(), value);
        self
    }

    pub fn category(&self) -> Option<&str> {
        self.category.as_deref()
    }

    /// Wraps the breadcrumb as a `breadcrumb` custom recording event.
    pub fn to_event(&self) -> RecordingEvent {
        let payload = serde_json::to_value(self).unwrap_or(Value::Null);
        RecordingEvent::custom("breadcrumb", timestamp_to_ms(self.timestamp), payload)
    }
}

/// A finished span or metric destined for the recording.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayPerformanceEntry {
    pub op: String,
    pub description: String,
    /// Seconds.
    pub start_timestamp: f64,
    /// Seconds.
    pub end_timestamp: f64,
    #[serde(default)]
    pub data: Value,
}

impl ReplayPerformanceEntry {
    pub fn new(
        op: impl Into<String>,
        description: impl Into<String>,
        start_timestamp: f64,
        end_timestamp: f64,
        data: Value,
    ) -> Self {
        Self {
            op: op.into(),
            description: description.into(),
            start_timestamp,
            end_timestamp,
            data,
        }
    }

    pub fn to_event(&self) -> RecordingEvent {
        let payload = serde_json::to_value(self).unwrap_or(Value::Null);
        RecordingEvent::custom(
            "performanceSpan",
            timestamp_to_ms(self.start_timestamp),
            payload,
        )
    }
}

/// A finished web-vital metric handed over by the host's metric collector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebVitalMetric {
    /// `LCP`, `CLS`, `INP`, ...
    pub name: String,
    pub value: f64,
    pub rating: String,
    /// Milliseconds since the epoch.
    pub timestamp: i64,
    #[serde(default)]
    pub node_ids: Vec<u64>,
}

impl From<&WebVitalMetric> for ReplayPerformanceEntry {
    fn from(metric: &WebVitalMetric) -> Self {
        let at = ms_to_secs(metric.timestamp);
        let description = match metric.name.as_str() {
            "LCP" => "largest-contentful-paint",
            "CLS" => "cumulative-layout-shift",
            "INP" => "interaction-to-next-paint",
            "FID" => "first-input-delay",
            other => other,
        };
        ReplayPerformanceEntry::new(
            "web-vital",
            description,
            at,
            at,
            json!({
                "value": metric.value,
                "size": metric.value,
                "rating": metric.rating,
                "nodeIds": metric.node_ids,
            }),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_type_serializes_as_number() {
        let event = RecordingEvent::new(EventType::FullSnapshot, 1_000, json!({}));
        let text = serde_json::to_string(&event).unwrap();
        assert!(text.contains("\"type\":2"));

        let back: RecordingEvent = serde_json::from_str(&text).unwrap();
        assert_eq!(back.event_type, EventType::FullSnapshot);
        assert!(serde_json::from_str::<RecordingEvent>(r#"{"type":42,"timestamp":1}"#).is_err());
    }

    #[test]
    fn click_interaction_exposes_node_id() {
        let click = RecordingEvent::new(
            EventType::IncrementalSnapshot,
            5,
            json!({ "source": SOURCE_MOUSE_INTERACTION, "type": MOUSE_INTERACTION_CLICK, "id": 17 }),
        );
        assert_eq!(click.clicked_node_id(), Some(17));

        let scroll = RecordingEvent::new(
            EventType::IncrementalSnapshot,
            5,
            json!({ "source": SOURCE_SCROLL, "id": 17 }),
        );
        assert_eq!(scroll.clicked_node_id(), None);
        assert_eq!(scroll.incremental_source(), Some(SOURCE_SCROLL));
    }

    #[test]
    fn breadcrumb_event_uses_millisecond_timestamp() {
        let crumb = Breadcrumb::new("console", 1_700_000_000.5).with_message("hi");
        let event = crumb.to_event();
        assert_eq!(event.timestamp, 1_700_000_000_500);
        assert_eq!(event.custom_tag(), Some("breadcrumb"));
        assert_eq!(event.data["payload"]["message"], "hi");
    }

    #[test]
    fn web_vital_becomes_performance_span() {
        let metric = WebVitalMetric {
            name: "LCP".into(),
            value: 1200.0,
            rating: "good".into(),
            timestamp: 2_000,
            node_ids: vec![3],
        };
        let entry = ReplayPerformanceEntry::from(&metric);
        assert_eq!(entry.op, "web-vital");
        assert_eq!(entry.description, "largest-contentful-paint");
        let event = entry.to_event();
        assert_eq!(event.timestamp, 2_000);
        assert_eq!(event.data["payload"]["data"]["nodeIds"][0], 3);
    }
}
