/**
 * SIMULATION SUPERVISOR - Owns one simulator per known device
 *
 * ROLE :
 * Reads the device directory at startup, spawns the simulators and is the
 * single entry point for command submission (HTTP layer, devkit, tests).
 *
 * OPERATION :
 * - Simulators are keyed by serial. The lock is never held across an await:
 *   handles are taken out of the map before being stopped.
 * - `submit_command` resolves the serial on every call so that devices added
 *   to the directory after startup are addressable.
 * - Bus failures on submission are retried a few times then logged. The
 *   caller gets its receipt anyway, delivery is fire-and-forget.
 */

use crate::bus::{BusError, SharedBus};
use crate::config::{ConfigError, SimulationConf};
use crate::directory::{DirectoryError, SharedDirectory};
use crate::models::{command_topic, CommandMessage, CommandReceipt, DeviceId, DeviceRecord, DeviceSnapshot};
use crate::simulator::{DeviceSimulator, SimulatorHandle};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use tracing::{debug, error, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("device {0} not found")]
    UnknownDevice(DeviceId),
    #[error(transparent)]
    Directory(#[from] DirectoryError),
    #[error("command not serializable: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error(transparent)]
    Bus(#[from] BusError),
    #[error(transparent)]
    Settings(#[from] ConfigError),
}

pub struct Supervisor {
    bus: SharedBus,
    directory: SharedDirectory,
    settings: SimulationConf,
    simulators: Mutex<HashMap<String, SimulatorHandle>>,
}

impl Supervisor {
    /// Loads the directory once and starts a simulator for every device.
    ///
    /// A device whose simulator cannot start is logged and skipped; only
    /// invalid settings or an unreadable directory abort.
    pub async fn start(bus: SharedBus, directory: SharedDirectory, settings: SimulationConf) -> Result<Self, SupervisorError> {
        settings.validate()?;
        let devices = directory.list_devices()?;
        info!("found {} devices to simulate", devices.len());

        let supervisor = Self {
            bus,
            directory,
            settings,
            simulators: Mutex::new(HashMap::new()),
        };

        for device in &devices {
            if let Err(e) = supervisor.start_device(device).await {
                error!("cannot simulate device {} ({}): {}", device.id, device.serial, e);
            }
        }

        Ok(supervisor)
    }

    /// Starts (or restarts from scratch) the simulator of one device.
    pub async fn start_device(&self, record: &DeviceRecord) -> Result<DeviceSnapshot, SupervisorError> {
        let previous = self.simulators.lock().remove(&record.serial);
        if let Some(previous) = previous {
            debug!("replacing simulator {}", record.serial);
            previous.stop().await;
        }

        let handle = DeviceSimulator::spawn(record, self.bus.clone(), self.settings.clone())?;
        let snapshot = handle.snapshot();

        let displaced = self.simulators.lock().insert(record.serial.clone(), handle);
        if let Some(displaced) = displaced {
            displaced.stop().await;
        }
        Ok(snapshot)
    }

    /// Returns false when no simulator runs under this serial.
    pub async fn stop_device(&self, serial: &str) -> bool {
        let handle = self.simulators.lock().remove(serial);
        match handle {
            Some(handle) => {
                handle.stop().await;
                true
            }
            None => false,
        }
    }

    /// Stops the simulator of a device being deleted from the directory.
    ///
    /// The serial is resolved through the directory, so this must run before
    /// the record is deleted. Once it is gone, use `stop_device` with the serial.
    pub async fn remove_device(&self, device_id: DeviceId) -> Result<bool, SupervisorError> {
        let serial = self
            .directory
            .get_serial(device_id)?
            .ok_or(SupervisorError::UnknownDevice(device_id))?;
        Ok(self.stop_device(&serial).await)
    }

    /// Publishes a command to the device. Unknown ids fail before anything is published.
    pub async fn submit_command(&self, device_id: DeviceId, command: &str, payload: Option<Value>) -> Result<CommandReceipt, SupervisorError> {
        let serial = self
            .directory
            .get_serial(device_id)?
            .ok_or(SupervisorError::UnknownDevice(device_id))?;

        let cmd = CommandMessage::new(command, Some(payload.unwrap_or_else(|| json!({}))));
        let body = serde_json::to_vec(&cmd)?;
        let topic = command_topic(&serial);

        info!("sending '{}' to device {} ({})", command, device_id, serial);
        self.publish_with_retry(&topic, body).await;

        Ok(CommandReceipt::sent(cmd))
    }

    async fn publish_with_retry(&self, topic: &str, body: Vec<u8>) {
        let attempts = self.settings.publish_retries.max(1);
        for attempt in 1..=attempts {
            match self.bus.publish(topic, body.clone()) {
                Ok(()) => return,
                Err(BusError::Disconnected) if attempt < attempts => {
                    debug!("bus down, retrying {} ({}/{})", topic, attempt, attempts);
                    tokio::time::sleep(self.settings.publish_retry_delay()).await;
                }
                Err(e) => {
                    warn!("command on {} not published: {}", topic, e);
                    return;
                }
            }
        }
    }

    /// State of every simulator, ordered by serial
    pub fn snapshots(&self) -> Vec<DeviceSnapshot> {
        let mut snapshots: Vec<DeviceSnapshot> = self.simulators.lock().values().map(SimulatorHandle::snapshot).collect();
        snapshots.sort_by(|a, b| a.serial.cmp(&b.serial));
        snapshots
    }

    pub fn snapshot(&self, serial: &str) -> Option<DeviceSnapshot> {
        self.simulators.lock().get(serial).map(SimulatorHandle::snapshot)
    }

    pub fn simulator_count(&self) -> usize {
        self.simulators.lock().len()
    }

    pub fn is_simulating(&self, serial: &str) -> bool {
        self.simulators.lock().contains_key(serial)
    }

    /// Stops every simulator and waits for them to unsubscribe.
    pub async fn shutdown(&self) {
        let handles: Vec<SimulatorHandle> = self.simulators.lock().drain().map(|(_, handle)| handle).collect();
        info!("stopping {} simulators", handles.len());
        for handle in handles {
            handle.stop().await;
        }
    }
}
