use std::collections::BTreeMap;
use std::time::Duration;

use log::trace;
use serde_json::{json, Value};

use crate::configuration::config::NetworkEnricherHook;
use crate::configuration::types::NetworkDetailOptions;
use crate::recording::types::{ms_to_secs, Breadcrumb, ReplayPerformanceEntry};

use super::body::{body_size, normalize_ready_body, read_body_with_timeout, NormalizedBody};
use super::types::{NetworkHint, NetworkRequestData, NetworkRequestRecord, ResponseBody};
use super::url_filter::UrlFilter;

/// Keeps only the allowed headers, with lowercased names.
pub fn filter_headers(headers: &[(String, String)], allowed: &[String]) -> BTreeMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            let name = name.to_ascii_lowercase();
            allowed
                .contains(&name)
                .then(|| (name, value.clone()))
        })
        .collect()
}

fn build_request_data(
    headers: BTreeMap<String, String>,
    size: Option<usize>,
    body: Option<NormalizedBody>,
) -> NetworkRequestData {
    let mut data = NetworkRequestData {
        headers,
        size,
        body: None,
        meta: None,
    };
    if let Some(normalized) = body {
        data.body = normalized.body;
        for warning in normalized.warnings {
            data.add_warning(warning);
        }
    }
    data
}

/// Builds network performance spans from fetch/xhr breadcrumbs.
pub struct NetworkCapture {
    filter: UrlFilter,
    capture_bodies: bool,
    body_max_size: usize,
    body_read_timeout: Duration,
    request_headers: Vec<String>,
    response_headers: Vec<String>,
    enricher: Option<NetworkEnricherHook>,
}

impl NetworkCapture {
    pub fn new(options: &NetworkDetailOptions, enricher: Option<NetworkEnricherHook>) -> Self {
        Self {
            filter: UrlFilter::new(options),
            capture_bodies: options.capture_bodies,
            body_max_size: options.body_max_size,
            body_read_timeout: Duration::from_millis(options.body_read_timeout_ms),
            request_headers: options.allowed_request_headers(),
            response_headers: options.allowed_response_headers(),
            enricher,
        }
    }

    /// Returns the span for a fetch/xhr breadcrumb, `None` for anything else.
    ///
    /// Never waits on a streaming response body longer than the configured
    /// read timeout.
    pub async fn capture(
        &self,
        breadcrumb: &Breadcrumb,
        mut hint: NetworkHint,
    ) -> Option<ReplayPerformanceEntry> {
        if !matches!(breadcrumb.category(), Some("fetch") | Some("xhr")) {
            return None;
        }
        let data = &breadcrumb.data;
        let url = data.get("url").and_then(Value::as_str)?.to_string();
        let method = data
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or("GET")
            .to_ascii_uppercase();
        let status_code = data
            .get("status_code")
            .and_then(Value::as_u64)
            .and_then(|code| u16::try_from(code).ok());

        let request_size = data
            .get("request_body_size")
            .and_then(Value::as_u64)
            .map(|size| size as usize)
            .or_else(|| hint.request_body.as_ref().and_then(body_size));
        let response_size = data
            .get("response_body_size")
            .and_then(Value::as_u64)
            .map(|size| size as usize)
            .or_else(|| match hint.response_body.as_ref() {
                Some(ResponseBody::Ready(body)) => body_size(body),
                _ => None,
            });

        let (request, response) = if !self.filter.allows(&url) {
            trace!("Skipping network details for {}", url);
            (
                NetworkRequestData::skipped(request_size),
                NetworkRequestData::skipped(response_size),
            )
        } else {
            let request_body = if self.capture_bodies {
                hint.request_body
                    .as_ref()
                    .map(|body| normalize_ready_body(body, self.body_max_size))
            } else {
                None
            };
            let response_body = match hint.response_body.take() {
                Some(body) if self.capture_bodies => Some(match body {
                    ResponseBody::Ready(body) => normalize_ready_body(&body, self.body_max_size),
                    ResponseBody::Stream(stream) => {
                        read_body_with_timeout(stream, self.body_read_timeout, self.body_max_size)
                            .await
                    }
                }),
                _ => None,
            };
            (
                build_request_data(
                    filter_headers(&hint.request_headers, &self.request_headers),
                    request_size,
                    request_body,
                ),
                build_request_data(
                    filter_headers(&hint.response_headers, &self.response_headers),
                    response_size,
                    response_body,
                ),
            )
        };

        let mut record = NetworkRequestRecord {
            url,
            method,
            status_code,
            request: Some(request),
            response: Some(response),
        };
        if let Some(ref enricher) = self.enricher {
            enricher(&mut record, &hint);
        }

        Some(ReplayPerformanceEntry::new(
            hint.kind.op(),
            record.url.clone(),
            ms_to_secs(hint.start_timestamp),
            ms_to_secs(hint.end_timestamp),
            json!({
                "method": record.method,
                "statusCode": record.status_code,
                "request": serde_json::to_value(&record.request).unwrap_or(Value::Null),
                "response": serde_json::to_value(&record.response).unwrap_or(Value::Null),
            }),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configuration::types::UrlPattern;
    use crate::network::types::{BodyStream, NetworkBody, RequestKind};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    fn fetch_breadcrumb(url: &str) -> Breadcrumb {
        Breadcrumb::new("fetch", 1.0)
            .with_data("url", json!(url))
            .with_data("method", json!("post"))
            .with_data("status_code", json!(200))
    }

    fn hint() -> NetworkHint {
        let mut hint = NetworkHint::new(RequestKind::Fetch, 1_000, 1_250);
        hint.request_headers = vec![
            ("Content-Type".into(), "application/json".into()),
            ("Authorization".into(), "Bearer secret".into()),
        ];
        hint.request_body = Some(NetworkBody::Text("{\"user\":1}".into()));
        hint.response_headers = vec![("content-length".into(), "11".into())];
        hint.response_body = Some(ResponseBody::Ready(NetworkBody::Text("{\"ok\":true}".into())));
        hint
    }

    fn capture_for(allow: &str) -> NetworkCapture {
        NetworkCapture::new(
            &NetworkDetailOptions {
                allow_urls: vec![UrlPattern::parse(allow).unwrap()],
                ..Default::default()
            },
            None,
        )
    }

    #[tokio::test]
    async fn url_outside_allow_list_only_records_sizes() {
        let capture = capture_for("api.example.com");
        let entry = capture
            .capture(&fetch_breadcrumb("https://tracker.test/collect"), hint())
            .await
            .unwrap();

        assert_eq!(entry.op, "resource.fetch");
        let request = &entry.data["request"];
        assert_eq!(request["size"], 10);
        assert_eq!(request["headers"], json!({}));
        assert!(request.get("body").is_none());
        assert_eq!(request["_meta"]["warnings"], json!(["URL_SKIPPED"]));
        assert_eq!(entry.data["response"]["size"], 11);
        assert!(entry.data["response"].get("body").is_none());
    }

    #[tokio::test]
    async fn allowed_url_captures_filtered_headers_and_bodies() {
        let capture = capture_for("api.example.com");
        let entry = capture
            .capture(&fetch_breadcrumb("https://api.example.com/users"), hint())
            .await
            .unwrap();

        assert_eq!(entry.description, "https://api.example.com/users");
        assert_eq!(entry.start_timestamp, 1.0);
        assert_eq!(entry.end_timestamp, 1.25);
        assert_eq!(entry.data["method"], "POST");
        assert_eq!(entry.data["statusCode"], 200);
        assert_eq!(
            entry.data["request"]["headers"],
            json!({ "content-type": "application/json" })
        );
        assert_eq!(entry.data["request"]["body"], json!({ "user": 1 }));
        assert_eq!(entry.data["response"]["body"], json!({ "ok": true }));
        assert!(entry.data["response"].get("_meta").is_none());
    }

    #[tokio::test]
    async fn disabled_body_capture_keeps_headers_only() {
        let capture = NetworkCapture::new(
            &NetworkDetailOptions {
                allow_urls: vec![UrlPattern::parse("example").unwrap()],
                capture_bodies: false,
                ..Default::default()
            },
            None,
        );
        let entry = capture
            .capture(&fetch_breadcrumb("https://example.com"), hint())
            .await
            .unwrap();
        assert!(entry.data["request"].get("body").is_none());
        assert_eq!(entry.data["response"]["headers"]["content-length"], "11");
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_response_stream_is_abandoned() {
        let capture = capture_for("example.com");
        let mut hint = hint();
        let stream: BodyStream = Box::pin(std::future::pending());
        hint.response_body = Some(ResponseBody::Stream(stream));

        let entry = capture
            .capture(&fetch_breadcrumb("https://example.com/slow"), hint)
            .await
            .unwrap();
        assert_eq!(
            entry.data["response"]["_meta"]["warnings"],
            json!(["BODY_PARSE_TIMEOUT"])
        );
        assert!(entry.data["response"].get("body").is_none());
    }

    #[tokio::test]
    async fn enricher_sees_the_record() {
        let called = Arc::new(AtomicBool::new(false));
        let seen = Arc::clone(&called);
        let enricher: NetworkEnricherHook = Arc::new(move |record: &mut NetworkRequestRecord, hint: &NetworkHint| {
            seen.store(true, Ordering::SeqCst);
            assert_eq!(hint.kind, RequestKind::Xhr);
            record.method = "PATCH".into();
        });
        let capture = NetworkCapture::new(&NetworkDetailOptions::default(), Some(enricher));
        let breadcrumb = Breadcrumb::new("xhr", 1.0).with_data("url", json!("https://x.test"));
        let entry = capture
            .capture(&breadcrumb, NetworkHint::new(RequestKind::Xhr, 0, 1))
            .await
            .unwrap();
        assert!(called.load(Ordering::SeqCst));
        assert_eq!(entry.op, "resource.xhr");
        assert_eq!(entry.data["method"], "PATCH");
    }

    #[tokio::test]
    async fn other_breadcrumbs_are_ignored() {
        let capture = capture_for("example.com");
        let breadcrumb = Breadcrumb::new("console", 1.0);
        assert!(capture.capture(&breadcrumb, hint()).await.is_none());
    }
}
