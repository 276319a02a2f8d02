//! Delivery pipeline
//!
//! Wraps a finished segment into a two-item envelope and sends it through
//! a [`Transport`](transport::Transport), honouring server rate limits and
//! retrying transient failures with a growing delay.
//!
//! Components:
//! - `envelope`: replay event metadata and envelope wire format.
//! - `rate_limits`: the category → "disabled until" table and header parsing.
//! - `transport`: the transport trait with HTTP and file implementations.
//! - `retry`: the backoff schedule.
//! - `replay_sender`: one send attempt and the retry loop around it.

pub mod envelope;
pub mod rate_limits;
pub mod replay_sender;
pub mod retry;
pub mod transport;

pub use replay_sender::{ReplaySender, SendReplayData};
pub use transport::{FileTransport, HttpTransport, Transport, TransportResponse};
