//! Breadcrumb normalization and throttling for the recording.

use std::collections::BTreeMap;

use serde_json::{json, Value};

use crate::recording::types::{ms_to_secs, Breadcrumb};

/// At most this many throttled events are added per window.
pub const THROTTLE_MAX_EVENTS: usize = 300;
pub const THROTTLE_WINDOW_SECS: i64 = 5;

pub const CONSOLE_ARG_TRUNCATED: &str = "CONSOLE_ARG_TRUNCATED";

/// Host breadcrumb categories that never go into the recording as-is.
const SKIPPED_CATEGORIES: [&str; 4] = ["fetch", "xhr", "sentry.event", "sentry.transaction"];

pub fn create_breadcrumb(category: &str, now_ms: i64) -> Breadcrumb {
    Breadcrumb::new(category, ms_to_secs(now_ms))
}

/// Prepares a host breadcrumb for the recording, `None` if it is skipped.
///
/// Network breadcrumbs arrive through their own path and `ui.*` ones are
/// produced by the controller itself.
pub fn normalize_breadcrumb(breadcrumb: Breadcrumb, console_arg_max_size: usize) -> Option<Breadcrumb> {
    let category = breadcrumb.category()?;
    if SKIPPED_CATEGORIES.contains(&category) || category.starts_with("ui.") {
        return None;
    }
    if category == "console" {
        return Some(normalize_console_breadcrumb(breadcrumb, console_arg_max_size));
    }
    Some(breadcrumb)
}

fn truncate_chars(text: &str, max: usize) -> Option<String> {
    if text.chars().count() <= max {
        return None;
    }
    let mut truncated: String = text.chars().take(max).collect();
    truncated.push('…');
    Some(truncated)
}

/// Caps every console argument at `max_size` characters, marking the
/// breadcrumb when anything was cut.
pub fn normalize_console_breadcrumb(mut breadcrumb: Breadcrumb, max_size: usize) -> Breadcrumb {
    let Some(Value::Array(arguments)) = breadcrumb.data.get("arguments") else {
        return breadcrumb;
    };

    let mut is_truncated = false;
    let normalized: Vec<Value> = arguments
        .iter()
        .map(|argument| match argument {
            Value::String(text) => match truncate_chars(text, max_size) {
                Some(truncated) => {
                    is_truncated = true;
                    Value::String(truncated)
                }
                None => argument.clone(),
            },
            Value::Object(_) | Value::Array(_) => {
                let serialized = argument.to_string();
                match truncate_chars(&serialized, max_size) {
                    Some(truncated) => {
                        is_truncated = true;
                        Value::String(truncated)
                    }
                    None => argument.clone(),
                }
            }
            _ => argument.clone(),
        })
        .collect();

    breadcrumb
        .data
        .insert("arguments".to_string(), Value::Array(normalized));
    if is_truncated {
        breadcrumb.data.insert(
            "_meta".to_string(),
            json!({ "warnings": [CONSOLE_ARG_TRUNCATED] }),
        );
    }
    breadcrumb
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleOutcome {
    Allowed,
    /// First rejection after a run of allowed events.
    Throttled,
    /// Later rejections of the same run.
    Skipped,
}

/// Sliding window counter keyed by whole seconds.
#[derive(Debug, Default)]
pub struct Throttle {
    counts: BTreeMap<i64, usize>,
    is_throttled: bool,
}

impl Throttle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn check(&mut self, now_ms: i64) -> ThrottleOutcome {
        let now = now_ms.div_euclid(1000);
        let threshold = now - THROTTLE_WINDOW_SECS;
        self.counts.retain(|second, _| *second >= threshold);

        if self.counts.values().sum::<usize>() >= THROTTLE_MAX_EVENTS {
            let was_throttled = self.is_throttled;
            self.is_throttled = true;
            return if was_throttled {
                ThrottleOutcome::Skipped
            } else {
                ThrottleOutcome::Throttled
            };
        }

        self.is_throttled = false;
        *self.counts.entry(now).or_insert(0) += 1;
        ThrottleOutcome::Allowed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_and_ui_breadcrumbs_are_skipped() {
        for category in ["fetch", "xhr", "sentry.transaction", "ui.click", "ui.input"] {
            assert!(normalize_breadcrumb(Breadcrumb::new(category, 1.0), 10).is_none());
        }
        let navigation = Breadcrumb::new("navigation", 1.0);
        assert_eq!(
            normalize_breadcrumb(navigation.clone(), 10),
            Some(navigation)
        );
    }

    #[test]
    fn long_console_arguments_are_truncated() {
        let breadcrumb = Breadcrumb::new("console", 1.0).with_data(
            "arguments",
            json!(["short", "x".repeat(20), { "key": "y".repeat(20) }, 42]),
        );
        let normalized = normalize_breadcrumb(breadcrumb, 10).unwrap();
        let arguments = normalized.data["arguments"].as_array().unwrap();

        assert_eq!(arguments[0], "short");
        assert_eq!(arguments[1], format!("{}…", "x".repeat(10)));
        assert_eq!(arguments[2], "{\"key\":\"yy…");
        assert_eq!(arguments[3], 42);
        assert_eq!(
            normalized.data["_meta"]["warnings"],
            json!([CONSOLE_ARG_TRUNCATED])
        );
    }

    #[test]
    fn console_without_long_arguments_has_no_warning() {
        let breadcrumb = Breadcrumb::new("console", 1.0).with_data("arguments", json!(["ok"]));
        let normalized = normalize_breadcrumb(breadcrumb, 10).unwrap();
        assert!(!normalized.data.contains_key("_meta"));
    }

    #[test]
    fn throttle_reports_first_rejection_once() {
        let mut throttle = Throttle::new();
        for _ in 0..THROTTLE_MAX_EVENTS {
            assert_eq!(throttle.check(10_000), ThrottleOutcome::Allowed);
        }
        assert_eq!(throttle.check(10_500), ThrottleOutcome::Throttled);
        assert_eq!(throttle.check(11_000), ThrottleOutcome::Skipped);

        // Once the window has moved past the burst, events flow again.
        assert_eq!(throttle.check(16_000), ThrottleOutcome::Allowed);
    }
}
