use std::fmt;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error_handling::types::ConfigError;

/// A network URL pattern: either a plain substring or a `/regex/`.
#[derive(Clone)]
pub enum UrlPattern {
    Substring(String),
    Regex(Regex),
}

impl UrlPattern {
    pub fn parse(pattern: &str) -> Result<Self, ConfigError> {
        if pattern.len() > 2 && pattern.starts_with('/') && pattern.ends_with('/') {
            let body = &pattern[1..pattern.len() - 1];
            return Regex::new(body)
                .map(UrlPattern::Regex)
                .map_err(|e| ConfigError::BadUrlPattern(format!("{}: {}", pattern, e)));
        }
        Ok(UrlPattern::Substring(pattern.to_string()))
    }

    pub fn matches(&self, url: &str) -> bool {
        match self {
            UrlPattern::Substring(s) => url.contains(s.as_str()),
            UrlPattern::Regex(re) => re.is_match(url),
        }
    }
}

impl fmt::Debug for UrlPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UrlPattern::Substring(s) => write!(f, "{:?}", s),
            UrlPattern::Regex(re) => write!(f, "/{}/", re.as_str()),
        }
    }
}

impl TryFrom<String> for UrlPattern {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        UrlPattern::parse(&value)
    }
}

impl From<UrlPattern> for String {
    fn from(value: UrlPattern) -> Self {
        match value {
            UrlPattern::Substring(s) => s,
            UrlPattern::Regex(re) => format!("/{}/", re.as_str()),
        }
    }
}

impl Serialize for UrlPattern {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&String::from(self.clone()))
    }
}

impl<'de> Deserialize<'de> for UrlPattern {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        UrlPattern::parse(&raw).map_err(serde::de::Error::custom)
    }
}

/// Returns true if `url` matches any of `patterns`.
pub fn url_matches(url: &str, patterns: &[UrlPattern]) -> bool {
    patterns.iter().any(|p| p.matches(url))
}

/// Timing and selector settings of the click detector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SlowClickOptions {
    pub timeout_ms: u64,
    pub threshold_ms: u64,
    pub scroll_timeout_ms: u64,
    pub ignore_selector: String,
}

impl Default for SlowClickOptions {
    fn default() -> Self {
        Self {
            timeout_ms: 7_000,
            threshold_ms: 3_000,
            scroll_timeout_ms: 300,
            ignore_selector: String::new(),
        }
    }
}

/// Request/response detail capture settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkDetailOptions {
    pub allow_urls: Vec<UrlPattern>,
    pub deny_urls: Vec<UrlPattern>,
    pub capture_bodies: bool,
    /// Extra request headers captured on top of the defaults.
    pub request_headers: Vec<String>,
    /// Extra response headers captured on top of the defaults.
    pub response_headers: Vec<String>,
    pub body_max_size: usize,
    pub body_read_timeout_ms: u64,
}

pub const DEFAULT_NETWORK_HEADERS: [&str; 3] = ["content-length", "content-type", "accept"];

impl Default for NetworkDetailOptions {
    fn default() -> Self {
        Self {
            allow_urls: Vec::new(),
            deny_urls: Vec::new(),
            capture_bodies: true,
            request_headers: Vec::new(),
            response_headers: Vec::new(),
            body_max_size: 150_000,
            body_read_timeout_ms: 500,
        }
    }
}

impl NetworkDetailOptions {
    fn merged(extra: &[String]) -> Vec<String> {
        let mut headers: Vec<String> = DEFAULT_NETWORK_HEADERS
            .iter()
            .map(|h| h.to_string())
            .collect();
        for header in extra {
            let lower = header.to_ascii_lowercase();
            if !headers.contains(&lower) {
                headers.push(lower);
            }
        }
        headers
    }

    pub fn allowed_request_headers(&self) -> Vec<String> {
        Self::merged(&self.request_headers)
    }

    pub fn allowed_response_headers(&self) -> Vec<String> {
        Self::merged(&self.response_headers)
    }
}

/// Privacy selector lists handed to the DOM recorder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrivacyOptions {
    pub mask: Vec<String>,
    pub unmask: Vec<String>,
    pub block: Vec<String>,
    pub unblock: Vec<String>,
    pub ignore: Vec<String>,
    pub mask_all_text: bool,
    pub mask_all_inputs: bool,
    pub block_all_media: bool,
}

impl Default for PrivacyOptions {
    fn default() -> Self {
        Self {
            mask: Vec::new(),
            unmask: Vec::new(),
            block: Vec::new(),
            unblock: Vec::new(),
            ignore: Vec::new(),
            mask_all_text: true,
            mask_all_inputs: true,
            block_all_media: true,
        }
    }
}

fn join_selectors(defaults: &[&str], extra: &[String]) -> String {
    defaults
        .iter()
        .map(|s| s.to_string())
        .chain(extra.iter().cloned())
        .collect::<Vec<_>>()
        .join(",")
}

impl PrivacyOptions {
    pub fn mask_selector(&self) -> String {
        join_selectors(&[".replay-mask", "[data-replay-mask]"], &self.mask)
    }

    pub fn unmask_selector(&self) -> String {
        join_selectors(&[], &self.unmask)
    }

    pub fn block_selector(&self) -> String {
        join_selectors(
            &[".replay-block", "[data-replay-block]", "base[href=\"/\"]"],
            &self.block,
        )
    }

    pub fn unblock_selector(&self) -> String {
        join_selectors(&[], &self.unblock)
    }

    pub fn ignore_selector(&self) -> String {
        join_selectors(
            &[".replay-ignore", "[data-replay-ignore]", "input[type=\"file\"]"],
            &self.ignore,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substring_and_regex_patterns() {
        let plain = UrlPattern::parse("api.example.com").unwrap();
        assert!(plain.matches("https://api.example.com/users"));
        assert!(!plain.matches("https://cdn.example.com/app.js"));

        let re = UrlPattern::parse("/\\/v[0-9]+\\/orders$/").unwrap();
        assert!(re.matches("https://shop.test/v2/orders"));
        assert!(!re.matches("https://shop.test/v2/orders/1"));

        assert!(UrlPattern::parse("/(unclosed/").is_err());
    }

    #[test]
    fn default_headers_are_always_allowed() {
        let options = NetworkDetailOptions {
            request_headers: vec!["X-Request-Id".into(), "Accept".into()],
            ..Default::default()
        };
        assert_eq!(
            options.allowed_request_headers(),
            vec!["content-length", "content-type", "accept", "x-request-id"]
        );
        assert_eq!(options.allowed_response_headers().len(), 3);
    }

    #[test]
    fn privacy_selectors_extend_defaults() {
        let privacy = PrivacyOptions {
            mask: vec![".secret".into()],
            ..Default::default()
        };
        assert_eq!(
            privacy.mask_selector(),
            ".replay-mask,[data-replay-mask],.secret"
        );
        assert_eq!(privacy.unmask_selector(), "");
        assert!(privacy.ignore_selector().contains("input[type=\"file\"]"));
    }
}
