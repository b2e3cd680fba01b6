//! Device-fleet simulation engine.
//!
//! One simulator task per device reacts to commands on
//! `devices/<serial>/commands` and reports on `devices/<serial>/telemetry`
//! through a shared `MessageBus`. The `Supervisor` owns the simulators and is
//! the command-submission entry point.

pub mod bus;
pub mod config;
pub mod directory;
pub mod health;
pub mod http;
pub mod models;
pub mod monitor;
pub mod simulator;
pub mod supervisor;

pub use bus::{BusError, MemoryBus, MessageBus, MqttBus, SharedBus};
pub use directory::{DeviceDirectory, JsonDeviceDirectory, StaticDirectory};
pub use simulator::{DeviceCommand, DeviceSimulator, SimulatorHandle};
pub use supervisor::{Supervisor, SupervisorError};
