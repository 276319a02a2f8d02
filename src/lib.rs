pub mod click_detection;
pub mod configuration;
pub mod context;
pub mod controller;
pub mod delivery;
pub mod error_handling;
pub mod event_buffer;
pub mod network;
pub mod recording;
pub mod session_management;
pub mod storage;

pub use context::ReplayContext;
pub use controller::{ReplayController, StopOptions};
