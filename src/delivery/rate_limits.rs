use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::DateTime;
use log::{debug, warn};

use super::transport::TransportResponse;

pub const RATE_LIMIT_HEADER: &str = "x-sentry-rate-limits";
pub const RETRY_AFTER_HEADER: &str = "retry-after";

/// Category name that limits every category.
pub const ALL_CATEGORIES: &str = "all";
pub const REPLAY_CATEGORY: &str = "replay";

/// Fallback delay when the server gives none, in milliseconds.
pub const DEFAULT_RETRY_AFTER_MS: i64 = 60_000;

/// Parses a `retry-after` value, either delay seconds or an HTTP date.
pub fn parse_retry_after_header(value: &str, now_ms: i64) -> i64 {
    let value = value.trim();
    if let Ok(seconds) = value.parse::<i64>() {
        return seconds.saturating_mul(1000);
    }
    if let Ok(date) = DateTime::parse_from_rfc2822(value) {
        return date.timestamp_millis().saturating_sub(now_ms);
    }
    DEFAULT_RETRY_AFTER_MS
}

/// Category → "disabled until" (ms since the epoch) table.
///
/// Cloning shares the table.
#[derive(Debug, Clone, Default)]
pub struct RateLimiter {
    limits: Arc<Mutex<HashMap<String, i64>>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Time until which `category` is disabled, considering `all` as well.
    pub fn disabled_until(&self, category: &str) -> i64 {
        let Ok(limits) = self.limits.lock() else {
            return 0;
        };
        let own = limits.get(category).copied().unwrap_or(0);
        let all = limits.get(ALL_CATEGORIES).copied().unwrap_or(0);
        own.max(all)
    }

    pub fn is_rate_limited(&self, category: &str, now_ms: i64) -> bool {
        self.disabled_until(category) > now_ms
    }

    pub fn set(&self, category: &str, until_ms: i64) {
        if let Ok(mut limits) = self.limits.lock() {
            limits.insert(category.to_string(), until_ms);
        }
    }

    /// Applies the limits a response carries.
    ///
    /// The structured rate-limit header wins over `retry-after`; a bare 429
    /// disables everything for a minute.
    pub fn update_from_response(&self, response: &TransportResponse, now_ms: i64) {
        if let Some(header) = response.header(RATE_LIMIT_HEADER) {
            for limit in header.trim().split(',') {
                let mut parts = limit.split(':');
                let delay_ms = parts
                    .next()
                    .and_then(|secs| secs.trim().parse::<i64>().ok())
                    .unwrap_or(60)
                    .saturating_mul(1000);
                let categories = parts.next().unwrap_or("");
                let until = now_ms.saturating_add(delay_ms);
                if categories.is_empty() {
                    self.set(ALL_CATEGORIES, until);
                } else {
                    for category in categories.split(';').filter(|c| !c.is_empty()) {
                        self.set(category, until);
                    }
                }
                debug!("Rate limit `{}` applied until {}", limit.trim(), until);
            }
        } else if let Some(retry_after) = response.header(RETRY_AFTER_HEADER) {
            let until = now_ms.saturating_add(parse_retry_after_header(retry_after, now_ms));
            self.set(ALL_CATEGORIES, until);
            debug!("retry-after applied until {}", until);
        } else if response.status_code == Some(429) {
            warn!("Received 429 without rate limit headers");
            self.set(ALL_CATEGORIES, now_ms + DEFAULT_RETRY_AFTER_MS);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(status: u16, headers: &[(&str, &str)]) -> TransportResponse {
        TransportResponse::new(
            Some(status),
            headers
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    #[test]
    fn structured_header_limits_named_categories() {
        let limiter = RateLimiter::new();
        limiter.update_from_response(
            &response(200, &[("X-Sentry-Rate-Limits", "60:replay;error:organization, 10::org")]),
            1_000,
        );
        assert_eq!(limiter.disabled_until("replay"), 61_000);
        assert_eq!(limiter.disabled_until("error"), 61_000);
        assert_eq!(limiter.disabled_until("transaction"), 11_000);
        assert!(limiter.is_rate_limited("replay", 60_999));
        assert!(!limiter.is_rate_limited("replay", 61_000));
    }

    #[test]
    fn retry_after_accepts_seconds_and_dates() {
        assert_eq!(parse_retry_after_header("30", 0), 30_000);
        let now = DateTime::parse_from_rfc2822("Wed, 21 Oct 2015 07:28:00 GMT")
            .unwrap()
            .timestamp_millis();
        assert_eq!(
            parse_retry_after_header("Wed, 21 Oct 2015 07:28:10 GMT", now),
            10_000
        );
        assert_eq!(parse_retry_after_header("soon", 0), DEFAULT_RETRY_AFTER_MS);
    }

    #[test]
    fn bare_429_disables_everything_for_a_minute() {
        let limiter = RateLimiter::new();
        limiter.update_from_response(&response(429, &[]), 5);
        assert_eq!(limiter.disabled_until(REPLAY_CATEGORY), 60_005);

        let shared = limiter.clone();
        limiter.update_from_response(&response(200, &[("retry-after", "1")]), 0);
        assert_eq!(shared.disabled_until("anything"), 1_000);
    }

    #[test]
    fn huge_server_delays_saturate() {
        let now = 1_700_000_000_000;
        assert_eq!(
            parse_retry_after_header("9223372036854775", now),
            9_223_372_036_854_775_000
        );
        assert_eq!(parse_retry_after_header("9223372036854776", now), i64::MAX);

        let limiter = RateLimiter::new();
        limiter.update_from_response(&response(429, &[("retry-after", "9223372036854775")]), now);
        assert_eq!(limiter.disabled_until(REPLAY_CATEGORY), i64::MAX);

        let limiter = RateLimiter::new();
        limiter.update_from_response(
            &response(200, &[(RATE_LIMIT_HEADER, "9223372036854775:replay:org")]),
            now,
        );
        assert!(limiter.is_rate_limited(REPLAY_CATEGORY, now));
        assert_eq!(limiter.disabled_until(REPLAY_CATEGORY), i64::MAX);
    }
}
