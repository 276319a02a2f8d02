//! Network detail capture
//!
//! Turns the host's fetch/xhr breadcrumbs into `resource.fetch` /
//! `resource.xhr` performance spans, optionally carrying request and
//! response headers and bodies.
//!
//! Components:
//! - `types`: request records, body sources and warning markers.
//! - `url_filter`: allow/deny decision per request URL.
//! - `body`: body normalization (truncation, JSON detection) and bounded reads.
//! - `network_capture`: assembles the span from breadcrumb and hint.
//!
//! Nothing here fails: every problem ends up as a `_meta.warnings` entry
//! on the captured record.

pub mod body;
pub mod network_capture;
pub mod types;
pub mod url_filter;

pub use network_capture::NetworkCapture;
pub use types::{NetworkBody, NetworkHint, NetworkRequestData, NetworkRequestRecord};
