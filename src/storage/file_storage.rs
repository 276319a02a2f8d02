use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use log::{debug, error, info};

use crate::error_handling::types::StorageError;
use crate::storage::storage_trait::SessionStorage;

pub const STORAGE_DIR_ENV: &str = "REPLAY_STORAGE_DIR";

/// Stores each key as `<key>.json` under a base directory.
#[derive(Debug, Clone)]
pub struct FileSessionStorage {
    base_path: PathBuf,
}

impl FileSessionStorage {
    pub fn new<P: AsRef<Path>>(base_path: P) -> Result<Self, StorageError> {
        let base_path = base_path.as_ref().to_path_buf();
        fs::create_dir_all(&base_path).map_err(|e| {
            error!("Failed to create storage dir {}: {}", base_path.display(), e);
            StorageError::WriteFailed(e.to_string())
        })?;
        info!("FileSessionStorage initialized at {}", base_path.display());
        Ok(Self { base_path })
    }

    /// Storage under the directory named by [`STORAGE_DIR_ENV`], or `None`
    /// when the variable is unset.
    pub fn from_env() -> Result<Option<Self>, StorageError> {
        match std::env::var(STORAGE_DIR_ENV) {
            Ok(dir) => {
                info!("Using FileSessionStorage from {}: {}", STORAGE_DIR_ENV, dir);
                Self::new(PathBuf::from(dir)).map(Some)
            }
            Err(_) => Ok(None),
        }
    }

    fn item_path(&self, key: &str) -> PathBuf {
        let name: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.base_path.join(format!("{}.json", name))
    }
}

impl SessionStorage for FileSessionStorage {
    fn is_available(&self) -> bool {
        self.base_path.is_dir()
    }

    fn get_item(&self, key: &str) -> Result<Option<String>, StorageError> {
        let path = self.item_path(key);
        match fs::read_to_string(&path) {
            Ok(content) => {
                debug!("Read {} byte(s) from {}", content.len(), path.display());
                Ok(Some(content))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => {
                error!("Read failed {}: {}", path.display(), e);
                Err(StorageError::ReadFailed(e.to_string()))
            }
        }
    }

    fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let path = self.item_path(key);
        fs::write(&path, value).map_err(|e| {
            error!("Write failed {}: {}", path.display(), e);
            StorageError::WriteFailed(e.to_string())
        })?;
        debug!("Wrote {} byte(s) to {}", value.len(), path.display());
        Ok(())
    }

    fn remove_item(&self, key: &str) -> Result<(), StorageError> {
        let path = self.item_path(key);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => {
                error!("Remove failed {}: {}", path.display(), e);
                Err(StorageError::WriteFailed(e.to_string()))
            }
        }
    }
}
