/*!
# Fleet DevKit - Test doubles and helpers for the simulation engine

Library for exercising simulators without a broker:
- Recording bus with injectable disconnects
- Builders and validators for the command and telemetry wire formats
- Harness booting a supervisor over an in-memory directory
*/

pub mod bus_stub;
pub mod contract_helpers;
pub mod test_utils;

pub use bus_stub::RecordingBus;
pub use contract_helpers::{validate_command, validate_telemetry, CommandBuilder};
pub use test_utils::{fixture_device, TestHarness};
