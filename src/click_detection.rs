//! Dead, slow and rage click detection.
//!
//! The detector is a pure state machine: it never reads the clock itself,
//! callers feed it timestamps and poll [`ClickDetector::check_clicks`].

pub mod click_detector;
pub mod selector;

pub use click_detector::{ClickDetector, PendingClick, MULTI_CLICK_CATEGORY, SLOW_CLICK_CATEGORY};
pub use selector::{ClickTarget, SelectorList};
