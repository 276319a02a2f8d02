//! Recording primitives: the event model and the DOM recorder contract.

pub mod recorder;
pub mod types;

pub use recorder::{DomRecorder, RecordOptions, RecorderHandle, RecordingSink, ScriptedRecorder};
pub use types::{Breadcrumb, EventType, RecordingEvent, ReplayPerformanceEntry, WebVitalMetric};
