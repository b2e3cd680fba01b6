use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

pub type DeviceId = u64;

/// Persisted device as exposed by the directory collaborator (read-only here)
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRecord {
    pub id: DeviceId,
    pub serial: String,
    pub name: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub firmware_version: Option<String>,
    #[serde(default)]
    pub status: DeviceStatus,
}

/// Status as seen on the wire and in persisted records
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Online,
    #[default]
    Offline,
}

/// Runtime status of a simulated device
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SimulatedStatus {
    Offline,
    Online,
    Restarting,
}

impl SimulatedStatus {
    /// `restarting` has no wire representation, devices report `offline` meanwhile
    pub fn reported(self) -> DeviceStatus {
        match self {
            SimulatedStatus::Online => DeviceStatus::Online,
            SimulatedStatus::Offline | SimulatedStatus::Restarting => DeviceStatus::Offline,
        }
    }
}

#[derive(Debug, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FirmwarePhase {
    Idle,
    Updating,
}

/// State owned by exactly one simulator task
#[derive(Debug, Clone, PartialEq)]
pub struct SimulatedDeviceState {
    pub status: SimulatedStatus,
    pub firmware_version: String,
    pub pending_firmware_version: Option<String>,
}

impl SimulatedDeviceState {
    /// Starting the simulation brings the device up whatever its persisted status.
    pub fn start(record: &DeviceRecord, default_firmware: &str) -> Self {
        let firmware_version = record
            .firmware_version
            .clone()
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| default_firmware.to_string());

        Self {
            status: SimulatedStatus::Online,
            firmware_version,
            pending_firmware_version: None,
        }
    }

    pub fn begin_restart(&mut self) {
        self.status = SimulatedStatus::Restarting;
    }

    pub fn complete_restart(&mut self) {
        self.status = SimulatedStatus::Online;
    }

    /// Replaces any pending target: last command wins.
    pub fn begin_firmware_update(&mut self, version: String) {
        self.pending_firmware_version = Some(version);
    }

    /// Commits the pending version, returns it if there was one.
    pub fn complete_firmware_update(&mut self) -> Option<String> {
        let version = self.pending_firmware_version.take()?;
        self.firmware_version = version.clone();
        Some(version)
    }

    pub fn firmware_phase(&self) -> FirmwarePhase {
        if self.pending_firmware_version.is_some() {
            FirmwarePhase::Updating
        } else {
            FirmwarePhase::Idle
        }
    }
}

/// Read-only view published by a simulator after each state change
#[derive(Debug, Serialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSnapshot {
    pub serial: String,
    pub status: SimulatedStatus,
    pub firmware_version: String,
    pub firmware: FirmwarePhase,
    pub pending_firmware_version: Option<String>,
}

impl DeviceSnapshot {
    pub fn of(serial: &str, state: &SimulatedDeviceState) -> Self {
        Self {
            serial: serial.to_string(),
            status: state.status,
            firmware_version: state.firmware_version.clone(),
            firmware: state.firmware_phase(),
            pending_firmware_version: state.pending_firmware_version.clone(),
        }
    }
}

/// `devices/<serial>/commands` payload
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct CommandMessage {
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default)]
    pub timestamp: String,
}

impl CommandMessage {
    pub fn new(command: &str, payload: Option<Value>) -> Self {
        Self {
            command: command.to_string(),
            payload,
            timestamp: timestamp_now(),
        }
    }
}

/// Returned by `submit_command`; no acknowledgement path exists past the publish.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct CommandReceipt {
    pub message: String,
    pub cmd: CommandMessage,
}

impl CommandReceipt {
    pub fn sent(cmd: CommandMessage) -> Self {
        Self { message: "Command sent".to_string(), cmd }
    }
}

/// `devices/<serial>/telemetry` payload
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TelemetrySample {
    pub status: DeviceStatus,
    pub firmware_version: String,
    pub metrics: Metrics,
    pub timestamp: String,
}

/// Synthetic load figures, percentages in 0..100
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq)]
pub struct Metrics {
    pub cpu: u8,
    pub memory: u8,
}

impl Metrics {
    pub fn sample<R: Rng + ?Sized>(rng: &mut R) -> Self {
        Self {
            cpu: rng.gen_range(0..100),
            memory: rng.gen_range(0..100),
        }
    }
}

impl TelemetrySample {
    pub fn capture<R: Rng + ?Sized>(state: &SimulatedDeviceState, rng: &mut R) -> Self {
        Self {
            status: state.status.reported(),
            firmware_version: state.firmware_version.clone(),
            metrics: Metrics::sample(rng),
            timestamp: timestamp_now(),
        }
    }
}

pub fn command_topic(serial: &str) -> String {
    format!("devices/{}/commands", serial)
}

pub fn telemetry_topic(serial: &str) -> String {
    format!("devices/{}/telemetry", serial)
}

/// Pattern of the global telemetry observer
pub const TELEMETRY_PATTERN: &str = "devices/+/telemetry";

/// RFC 3339 UTC timestamp
pub fn timestamp_now() -> String {
    OffsetDateTime::now_utc().format(&Rfc3339).unwrap_or_default()
}
