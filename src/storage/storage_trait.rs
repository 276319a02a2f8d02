//! Storage Trait
//!
//! This module defines the `SessionStorage` trait, the interface of the
//! page-scoped storage holding the sticky session record.
//!
//! Implementors only store opaque strings; serialization of the session
//! is handled by the session store. Every method returns a `Result` so the
//! caller can log and carry on when the host has disabled storage.

use crate::error_handling::types::StorageError;

/// Key/value storage surviving page reloads.
pub trait SessionStorage: Send + Sync {
    /// Returns false when the host has disabled this storage.
    fn is_available(&self) -> bool {
        true
    }

    /// Reads the value stored under `key`, `None` if absent.
    fn get_item(&self, key: &str) -> Result<Option<String>, StorageError>;

    /// Stores `value` under `key`, replacing any previous value.
    fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError>;

    /// Removes `key`. Removing a missing key is not an error.
    fn remove_item(&self, key: &str) -> Result<(), StorageError>;
}
