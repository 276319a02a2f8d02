//! Session management core module.
//!
//! This module provides the replay session record, its expiry rules and
//! the store that creates, loads and persists it.

/// Submodule for the session record and expiry rules.
pub mod session;
/// Submodule for session creation, sampling and sticky persistence.
pub mod session_store;

pub use session::{Sampled, Session};
pub use session_store::{SamplingOptions, SessionStore, SessionTimeouts};
