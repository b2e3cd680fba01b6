use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tokio::fs;
use tracing::warn;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io { path: String, source: std::io::Error },
    #[error("invalid config {path}: {source}")]
    Yaml { path: String, source: serde_yaml::Error },
    #[error("invalid setting {field}: {reason}")]
    Invalid { field: &'static str, reason: &'static str },
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct KernelConfig {
    pub bus: BusKind,
    pub mqtt: MqttConf,
    pub simulation: SimulationConf,
    pub directory: DirectoryConf,
    pub http: HttpConf,
    /// Log-only observer on `devices/+/telemetry`
    pub monitor_telemetry: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum BusKind {
    #[default]
    Mqtt,
    Memory,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct MqttConf {
    pub host: String,
    pub port: u16,
    /// Prefix, a random suffix is appended per connection
    pub client_id: String,
    pub keep_alive_secs: u64,
    pub request_capacity: usize,
    pub reconnect_delay_secs: u64,
    pub connect_timeout_secs: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct SimulationConf {
    pub telemetry_interval_ms: u64,
    /// Delay applied by `restart` and `updateFirmware`
    pub command_delay_ms: u64,
    /// Reported when the device record carries no firmware version
    pub default_firmware: String,
    pub publish_retries: u32,
    pub publish_retry_delay_ms: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct DirectoryConf {
    pub path: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct HttpConf {
    pub bind: String,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            bus: BusKind::default(),
            mqtt: MqttConf::default(),
            simulation: SimulationConf::default(),
            directory: DirectoryConf::default(),
            http: HttpConf::default(),
            monitor_telemetry: true,
        }
    }
}

impl Default for MqttConf {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 1883,
            client_id: "fleet-kernel".into(),
            keep_alive_secs: 15,
            request_capacity: 64,
            reconnect_delay_secs: 2,
            connect_timeout_secs: 10,
        }
    }
}

impl Default for SimulationConf {
    fn default() -> Self {
        Self {
            telemetry_interval_ms: 5000,
            command_delay_ms: 3000,
            default_firmware: "1.0.0".into(),
            publish_retries: 3,
            publish_retry_delay_ms: 200,
        }
    }
}

impl SimulationConf {
    pub fn telemetry_interval(&self) -> Duration {
        Duration::from_millis(self.telemetry_interval_ms)
    }

    pub fn command_delay(&self) -> Duration {
        Duration::from_millis(self.command_delay_ms)
    }

    pub fn publish_retry_delay(&self) -> Duration {
        Duration::from_millis(self.publish_retry_delay_ms)
    }

    /// Rejects values the simulators cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.telemetry_interval_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "simulation.telemetry_interval_ms",
                reason: "must be greater than 0",
            });
        }
        if self.publish_retries == 0 {
            return Err(ConfigError::Invalid {
                field: "simulation.publish_retries",
                reason: "at least one attempt is required",
            });
        }
        Ok(())
    }
}

impl Default for DirectoryConf {
    fn default() -> Self {
        Self { path: "./data/devices.json".into() }
    }
}

impl Default for HttpConf {
    fn default() -> Self {
        Self { bind: "0.0.0.0:8080".into() }
    }
}

/// Loads `$FLEET_KERNEL_CONFIG` (default `kernel.yaml`).
///
/// A missing or empty file yields the defaults; a file that exists but
/// does not parse is an error.
pub async fn load_config() -> Result<KernelConfig, ConfigError> {
    let path = std::env::var("FLEET_KERNEL_CONFIG").unwrap_or_else(|_| "kernel.yaml".into());
    load_config_from(&path).await
}

pub async fn load_config_from(path: &str) -> Result<KernelConfig, ConfigError> {
    if !Path::new(path).exists() {
        warn!("no {} found, using default config", path);
        return Ok(KernelConfig::default());
    }

    let txt = fs::read_to_string(path)
        .await
        .map_err(|source| ConfigError::Io { path: path.to_string(), source })?;
    if txt.trim().is_empty() {
        return Ok(KernelConfig::default());
    }

    let cfg: KernelConfig =
        serde_yaml::from_str(&txt).map_err(|source| ConfigError::Yaml { path: path.to_string(), source })?;
    cfg.simulation.validate()?;
    Ok(cfg)
}
