//! Storage subsystem
//!
//! Page-scoped key/value storage used to persist the sticky replay session
//! across reloads.
//!
//! Components:
//! - `storage_trait`: the SessionStorage trait defining a uniform API.
//! - `memory_storage`: in-process map, the default when nothing survives a reload.
//! - `file_storage`: filesystem-backed implementation, one file per key.

pub mod file_storage;
pub mod memory_storage;
pub mod storage_trait;

pub use file_storage::FileSessionStorage;
pub use memory_storage::MemorySessionStorage;
pub use storage_trait::SessionStorage;
