use std::time::Duration;

use log::debug;
use serde_json::Value;

use super::types::{BodyStream, NetworkBody, NetworkMetaWarning};

/// A body ready to be stored, with the reasons it may be incomplete.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedBody {
    pub body: Option<Value>,
    pub warnings: Vec<NetworkMetaWarning>,
}

impl NormalizedBody {
    fn warn(warning: NetworkMetaWarning) -> Self {
        Self {
            body: None,
            warnings: vec![warning],
        }
    }
}

/// Text representation of a body, or the warning explaining why there is none.
pub fn body_to_string(body: &NetworkBody) -> Result<String, NetworkMetaWarning> {
    match body {
        NetworkBody::Text(text) => Ok(text.clone()),
        NetworkBody::Json(value) => {
            serde_json::to_string(value).map_err(|_| NetworkMetaWarning::BodyParseError)
        }
        NetworkBody::Form(fields) => Ok(fields
            .iter()
            .map(|(key, value)| format!("{}={}", key, value))
            .collect::<Vec<_>>()
            .join("&")),
        NetworkBody::Binary(_) => Err(NetworkMetaWarning::UnparseableBodyType),
    }
}

/// Byte size of a body, when it can be known without reading a stream.
pub fn body_size(body: &NetworkBody) -> Option<usize> {
    match body {
        NetworkBody::Binary(bytes) => Some(bytes.len()),
        other => body_to_string(other).ok().map(|text| text.len()),
    }
}

/// Truncates oversized text and parses JSON-looking text.
///
/// Truncated JSON is kept as text since it no longer parses; other text gets
/// an ellipsis. JSON that fails to parse is kept as the raw string.
pub fn normalize_network_body(text: &str, max_size: usize) -> NormalizedBody {
    let trimmed = text.trim_start();
    let probably_json = trimmed.starts_with('{') || trimmed.starts_with('[');

    if text.chars().count() > max_size {
        let truncated: String = text.chars().take(max_size).collect();
        return if probably_json {
            NormalizedBody {
                body: Some(Value::String(truncated)),
                warnings: vec![NetworkMetaWarning::MaybeJsonTruncated],
            }
        } else {
            NormalizedBody {
                body: Some(Value::String(format!("{}…", truncated))),
                warnings: vec![NetworkMetaWarning::TextTruncated],
            }
        };
    }

    if probably_json {
        if let Ok(parsed) = serde_json::from_str::<Value>(text) {
            return NormalizedBody {
                body: Some(parsed),
                warnings: Vec::new(),
            };
        }
    }

    NormalizedBody {
        body: Some(Value::String(text.to_string())),
        warnings: Vec::new(),
    }
}

/// Normalizes a body that is already available.
pub fn normalize_ready_body(body: &NetworkBody, max_size: usize) -> NormalizedBody {
    match body_to_string(body) {
        Ok(text) => normalize_network_body(&text, max_size),
        Err(warning) => NormalizedBody::warn(warning),
    }
}

/// Reads a streaming body, giving up after `timeout`.
pub async fn read_body_with_timeout(
    stream: BodyStream,
    timeout: Duration,
    max_size: usize,
) -> NormalizedBody {
    match tokio::time::timeout(timeout, stream).await {
        Ok(Ok(text)) => normalize_network_body(&text, max_size),
        Ok(Err(e)) => {
            debug!("Failed to read response body: {}", e);
            NormalizedBody::warn(NetworkMetaWarning::BodyParseError)
        }
        Err(_) => {
            debug!("Timed out reading response body after {:?}", timeout);
            NormalizedBody::warn(NetworkMetaWarning::BodyParseTimeout)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn small_json_is_parsed() {
        let normalized = normalize_network_body("{\"a\":[1,2]}", 100);
        assert_eq!(normalized.body, Some(json!({ "a": [1, 2] })));
        assert!(normalized.warnings.is_empty());
    }

    #[test]
    fn broken_json_falls_back_to_text() {
        let normalized = normalize_network_body("{\"a\":", 100);
        assert_eq!(normalized.body, Some(json!("{\"a\":")));
        assert!(normalized.warnings.is_empty());
    }

    #[test]
    fn oversized_bodies_are_truncated_with_warning() {
        let text = normalize_network_body("abcdefghij", 4);
        assert_eq!(text.body, Some(json!("abcd…")));
        assert_eq!(text.warnings, vec![NetworkMetaWarning::TextTruncated]);

        let json_like = normalize_network_body("[1,2,3,4,5]", 4);
        assert_eq!(json_like.body, Some(json!("[1,2")));
        assert_eq!(json_like.warnings, vec![NetworkMetaWarning::MaybeJsonTruncated]);
    }

    #[test]
    fn binary_bodies_are_not_captured() {
        let normalized = normalize_ready_body(&NetworkBody::Binary(vec![1, 2, 3]), 100);
        assert_eq!(normalized.body, None);
        assert_eq!(normalized.warnings, vec![NetworkMetaWarning::UnparseableBodyType]);
        assert_eq!(body_size(&NetworkBody::Binary(vec![1, 2, 3])), Some(3));
    }

    #[test]
    fn form_fields_are_url_encoded_pairs() {
        let form = NetworkBody::Form(vec![("a".into(), "1".into()), ("b".into(), "2".into())]);
        assert_eq!(body_to_string(&form).unwrap(), "a=1&b=2");
        assert_eq!(body_size(&form), Some(7));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_stream_times_out() {
        let stream: BodyStream = Box::pin(async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok("late".to_string())
        });
        let normalized = read_body_with_timeout(stream, Duration::from_millis(500), 100).await;
        assert_eq!(normalized.body, None);
        assert_eq!(normalized.warnings, vec![NetworkMetaWarning::BodyParseTimeout]);
    }

    #[tokio::test]
    async fn failing_stream_reports_parse_error() {
        let stream: BodyStream = Box::pin(async { Err("reset".to_string()) });
        let normalized = read_body_with_timeout(stream, Duration::from_millis(500), 100).await;
        assert_eq!(normalized.warnings, vec![NetworkMetaWarning::BodyParseError]);
    }
}
