//! Replay controller core module.
//!
//! This module ties the recorder, the event buffer, the session store and
//! the sender together into one replay lifecycle: sampling, recording,
//! flushing segments, buffer promotion and teardown.

/// Submodule for breadcrumb normalization and the event throttle.
pub mod breadcrumbs;
/// Submodule for the replay controller itself.
pub mod controller_handler;
/// Submodule for per-segment metadata.
pub mod event_context;
/// Submodule for flush debouncing and single-flight locking.
pub mod flush_scheduler;
/// Submodule for host SDK events linked to a replay.
pub mod host_events;

pub use controller_handler::{RecordingMode, ReplayController, StopOptions};
pub use host_events::HostEvent;
