use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Marker explaining why a captured body or header set is incomplete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NetworkMetaWarning {
    UrlSkipped,
    TextTruncated,
    MaybeJsonTruncated,
    BodyParseTimeout,
    BodyParseError,
    UnparseableBodyType,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkMeta {
    pub warnings: Vec<NetworkMetaWarning>,
}

/// Captured request or response side.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkRequestData {
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
    #[serde(rename = "_meta", default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<NetworkMeta>,
}

impl NetworkRequestData {
    /// Record for a URL whose details must not be captured: size only.
    pub fn skipped(size: Option<usize>) -> Self {
        Self {
            headers: BTreeMap::new(),
            size,
            body: None,
            meta: Some(NetworkMeta {
                warnings: vec![NetworkMetaWarning::UrlSkipped],
            }),
        }
    }

    pub fn warnings(&self) -> &[NetworkMetaWarning] {
        self.meta
            .as_ref()
            .map(|meta| meta.warnings.as_slice())
            .unwrap_or(&[])
    }

    pub fn add_warning(&mut self, warning: NetworkMetaWarning) {
        self.meta
            .get_or_insert_with(NetworkMeta::default)
            .warnings
            .push(warning);
    }
}

/// Everything recorded about one request, stored as span data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkRequestRecord {
    pub url: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<NetworkRequestData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<NetworkRequestData>,
}

/// A request or response body as the host hands it over.
#[derive(Debug, Clone, PartialEq)]
pub enum NetworkBody {
    Text(String),
    Json(Value),
    /// URL-encoded or multipart form fields.
    Form(Vec<(String, String)>),
    /// Binary content (blobs, array buffers) that is never captured.
    Binary(Vec<u8>),
}

/// A response body that still has to be read.
pub type BodyStream = Pin<Box<dyn Future<Output = Result<String, String>> + Send>>;

pub enum ResponseBody {
    Ready(NetworkBody),
    Stream(BodyStream),
}

impl fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResponseBody::Ready(body) => f.debug_tuple("Ready").field(body).finish(),
            ResponseBody::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Fetch,
    Xhr,
}

impl RequestKind {
    pub fn op(&self) -> &'static str {
        match self {
            RequestKind::Fetch => "resource.fetch",
            RequestKind::Xhr => "resource.xhr",
        }
    }
}

/// Lifecycle details the host observed for a request.
#[derive(Debug)]
pub struct NetworkHint {
    pub kind: RequestKind,
    /// Milliseconds since the epoch.
    pub start_timestamp: i64,
    pub end_timestamp: i64,
    pub request_headers: Vec<(String, String)>,
    pub request_body: Option<NetworkBody>,
    pub response_headers: Vec<(String, String)>,
    pub response_body: Option<ResponseBody>,
}

impl NetworkHint {
    pub fn new(kind: RequestKind, start_timestamp: i64, end_timestamp: i64) -> Self {
        Self {
            kind,
            start_timestamp,
            end_timestamp,
            request_headers: Vec::new(),
            request_body: None,
            response_headers: Vec::new(),
            response_body: None,
        }
    }
}
