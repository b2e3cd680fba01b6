/**
 * DEVICE DIRECTORY - Read side of the device persistence collaborator
 *
 * ROLE :
 * The engine never owns device records. It reads the full list once when the
 * supervisor starts and resolves `id -> serial` on every command submission.
 *
 * IMPLEMENTATIONS :
 * - `JsonDeviceDirectory` : JSON array on disk, re-read on every call
 * - `StaticDirectory` : in-memory list (tests, devkit, embedding)
 */

pub mod json;

use crate::models::{DeviceId, DeviceRecord};
use parking_lot::RwLock;
use std::sync::Arc;

pub use json::JsonDeviceDirectory;

#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
    #[error("directory IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("directory is not valid JSON: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub trait DeviceDirectory: Send + Sync {
    /// Every known device, in directory order
    fn list_devices(&self) -> Result<Vec<DeviceRecord>, DirectoryError>;

    /// `Ok(None)` when no device carries this id
    fn get_serial(&self, id: DeviceId) -> Result<Option<String>, DirectoryError> {
        Ok(self
            .list_devices()?
            .into_iter()
            .find(|device| device.id == id)
            .map(|device| device.serial))
    }
}

pub type SharedDirectory = Arc<dyn DeviceDirectory>;

/// Directory held in memory
#[derive(Default)]
pub struct StaticDirectory {
    devices: RwLock<Vec<DeviceRecord>>,
}

impl StaticDirectory {
    pub fn new(devices: Vec<DeviceRecord>) -> Self {
        Self { devices: RwLock::new(devices) }
    }

    /// Adds or replaces (same id) a record
    pub fn insert(&self, record: DeviceRecord) {
        let mut devices = self.devices.write();
        devices.retain(|device| device.id != record.id);
        devices.push(record);
    }

    pub fn remove(&self, id: DeviceId) -> Option<DeviceRecord> {
        let mut devices = self.devices.write();
        let index = devices.iter().position(|device| device.id == id)?;
        Some(devices.remove(index))
    }
}

impl DeviceDirectory for StaticDirectory {
    fn list_devices(&self) -> Result<Vec<DeviceRecord>, DirectoryError> {
        Ok(self.devices.read().clone())
    }

    fn get_serial(&self, id: DeviceId) -> Result<Option<String>, DirectoryError> {
        Ok(self
            .devices
            .read()
            .iter()
            .find(|device| device.id == id)
            .map(|device| device.serial.clone()))
    }
}
