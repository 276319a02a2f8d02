pub mod config;
pub mod types;

pub use config::{ReplayHooks, ReplayOptions};
pub use types::{NetworkDetailOptions, PrivacyOptions, SlowClickOptions, UrlPattern};
