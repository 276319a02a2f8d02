use std::collections::HashMap;
use std::sync::Mutex;

use log::trace;

use crate::error_handling::types::StorageError;
use crate::storage::storage_trait::SessionStorage;

/// In-process storage. Nothing survives the process.
#[derive(Debug, Default)]
pub struct MemorySessionStorage {
    items: Mutex<HashMap<String, String>>,
    disabled: bool,
}

impl MemorySessionStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// A storage behaving like one the host has switched off.
    pub fn disabled() -> Self {
        Self {
            items: Mutex::new(HashMap::new()),
            disabled: true,
        }
    }

    fn check(&self) -> Result<(), StorageError> {
        if self.disabled {
            return Err(StorageError::Unavailable(
                "session storage is disabled".to_string(),
            ));
        }
        Ok(())
    }
}

impl SessionStorage for MemorySessionStorage {
    fn is_available(&self) -> bool {
        !self.disabled
    }

    fn get_item(&self, key: &str) -> Result<Option<String>, StorageError> {
        self.check()?;
        let items = self
            .items
            .lock()
            .map_err(|e| StorageError::ReadFailed(e.to_string()))?;
        Ok(items.get(key).cloned())
    }

    fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.check()?;
        let mut items = self
            .items
            .lock()
            .map_err(|e| StorageError::WriteFailed(e.to_string()))?;
        trace!("Storing {} byte(s) under {}", value.len(), key);
        items.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove_item(&self, key: &str) -> Result<(), StorageError> {
        self.check()?;
        let mut items = self
            .items
            .lock()
            .map_err(|e| StorageError::WriteFailed(e.to_string()))?;
        items.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_get_remove() {
        let storage = MemorySessionStorage::new();
        assert_eq!(storage.get_item("k").unwrap(), None);
        storage.set_item("k", "v").unwrap();
        assert_eq!(storage.get_item("k").unwrap().as_deref(), Some("v"));
        storage.remove_item("k").unwrap();
        storage.remove_item("k").unwrap();
        assert_eq!(storage.get_item("k").unwrap(), None);
    }

    #[test]
    fn disabled_storage_fails_every_call() {
        let storage = MemorySessionStorage::disabled();
        assert!(!storage.is_available());
        assert!(matches!(
            storage.set_item("k", "v"),
            Err(StorageError::Unavailable(_))
        ));
        assert!(storage.get_item("k").is_err());
    }
}
