//! Device directory backed by a JSON file.
//!
//! The file holds an array of device records, as written by the CRUD
//! service. No cache: every call re-reads the file so that a lookup sees
//! records created after the supervisor started.

use super::{DeviceDirectory, DirectoryError};
use crate::models::DeviceRecord;
use std::fs;
use std::path::PathBuf;
use tracing::info;

pub struct JsonDeviceDirectory {
    storage_path: PathBuf,
}

impl JsonDeviceDirectory {
    /// Opens the directory, creating an empty `[]` file (and its parent) when absent.
    pub fn open<P: Into<PathBuf>>(storage_path: P) -> Result<Self, DirectoryError> {
        let storage_path = storage_path.into();
        if !storage_path.exists() {
            if let Some(parent) = storage_path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&storage_path, "[]")?;
            info!("created empty device directory at {:?}", storage_path);
        }
        Ok(Self { storage_path })
    }
}

impl DeviceDirectory for JsonDeviceDirectory {
    fn list_devices(&self) -> Result<Vec<DeviceRecord>, DirectoryError> {
        let content = fs::read_to_string(&self.storage_path)?;
        if content.trim().is_empty() {
            return Ok(Vec::new());
        }
        Ok(serde_json::from_str(&content)?)
    }
}
