/*!
Test harness for the simulation engine

Boots a `Supervisor` over a `RecordingBus` and a `StaticDirectory`, then
offers command injection, state inspection and assertions on the traffic.
Meant for tests running on paused tokio time.
*/

use crate::bus_stub::RecordingBus;
use crate::contract_helpers::validate_telemetry;
use anyhow::{bail, Result};
use fleet_kernel::config::SimulationConf;
use fleet_kernel::directory::StaticDirectory;
use fleet_kernel::models::{command_topic, telemetry_topic, CommandReceipt, DeviceId, DeviceRecord, DeviceSnapshot, DeviceStatus, TelemetrySample};
use fleet_kernel::supervisor::Supervisor;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Device record with default firmware and an offline persisted status
pub fn fixture_device(id: DeviceId, serial: &str) -> DeviceRecord {
    DeviceRecord {
        id,
        serial: serial.to_string(),
        name: format!("Device {}", id),
        model: Some("SIM".to_string()),
        firmware_version: None,
        status: DeviceStatus::Offline,
    }
}

pub struct TestHarness {
    pub bus: Arc<RecordingBus>,
    pub directory: Arc<StaticDirectory>,
    pub supervisor: Supervisor,
    expectations: Vec<Expectation>,
}

#[derive(Debug)]
struct Expectation {
    topic: String,
    expected_count: usize,
}

impl TestHarness {
    pub async fn new(devices: Vec<DeviceRecord>) -> Result<Self> {
        Self::with_settings(devices, SimulationConf::default()).await
    }

    pub async fn with_settings(devices: Vec<DeviceRecord>, settings: SimulationConf) -> Result<Self> {
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init()
            .ok();

        let bus = Arc::new(RecordingBus::new());
        let directory = Arc::new(StaticDirectory::new(devices));
        let supervisor = Supervisor::start(bus.clone(), directory.clone(), settings).await?;
        settle().await;

        Ok(Self { bus, directory, supervisor, expectations: Vec::new() })
    }

    /// Submits a command through the supervisor, then lets the simulator react.
    pub async fn send_command(&self, device_id: DeviceId, command: &str, payload: Option<Value>) -> Result<CommandReceipt> {
        let receipt = self.supervisor.submit_command(device_id, command, payload).await?;
        settle().await;
        Ok(receipt)
    }

    /// Injects a raw body on the command topic of a device.
    pub async fn send_raw<V: Into<Vec<u8>>>(&self, serial: &str, body: V) -> Result<()> {
        self.bus.simulate_incoming(command_topic(serial), body)?;
        settle().await;
        Ok(())
    }

    pub fn snapshot(&self, serial: &str) -> Result<DeviceSnapshot> {
        match self.supervisor.snapshot(serial) {
            Some(snapshot) => Ok(snapshot),
            None => bail!("no simulator for {}", serial),
        }
    }

    /// Every telemetry sample published by a device, validated, in order
    pub fn telemetry_for(&self, serial: &str) -> Result<Vec<TelemetrySample>> {
        self.bus
            .find_messages_by_topic(&telemetry_topic(serial))
            .iter()
            .map(|msg| validate_telemetry(&serde_json::from_slice(&msg.payload)?))
            .collect()
    }

    /// Moves paused time forward, then lets the woken tasks run.
    pub async fn advance(&self, duration: Duration) {
        tokio::time::advance(duration).await;
        settle().await;
    }

    pub fn expect_messages(&mut self, topic: &str, count: usize) -> &mut Self {
        self.expectations.push(Expectation { topic: topic.to_string(), expected_count: count });
        self
    }

    pub fn verify_expectations(&self) -> Result<()> {
        for expectation in &self.expectations {
            let actual = self.bus.find_messages_by_topic(&expectation.topic).len();
            if actual != expectation.expected_count {
                bail!(
                    "expectation failed for topic '{}': expected {} messages, got {}",
                    expectation.topic,
                    expectation.expected_count,
                    actual
                );
            }
        }
        Ok(())
    }

    pub fn assert_field_equals(&self, topic: &str, field_path: &str, expected: &Value) -> Result<()> {
        let Some(msg) = self.bus.get_last_json_message::<Value>(topic)? else {
            bail!("no message on {}", topic);
        };
        match get_nested_field(&msg, field_path) {
            Some(actual) if actual == expected => Ok(()),
            Some(actual) => bail!("field '{}' mismatch: expected {:?}, got {:?}", field_path, expected, actual),
            None => bail!("field '{}' not found in latest message on {}", field_path, topic),
        }
    }

    pub fn get_stats(&self) -> TestStats {
        let messages = self.bus.get_published_messages();
        let mut topic_counts = HashMap::new();
        for msg in &messages {
            *topic_counts.entry(msg.topic.clone()).or_insert(0) += 1;
        }

        TestStats {
            total_messages: messages.len(),
            topic_counts,
            subscriptions: self.bus.get_subscriptions(),
            simulators: self.supervisor.simulator_count(),
        }
    }

    pub fn reset(&mut self) {
        self.bus.clear();
        self.expectations.clear();
    }

    pub async fn shutdown(&self) {
        self.supervisor.shutdown().await;
    }
}

/// Yields enough times for every ready task to run.
pub async fn settle() {
    for _ in 0..16 {
        tokio::task::yield_now().await;
    }
}

fn get_nested_field<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(value, |current, part| current.as_object()?.get(part))
}

#[derive(Debug)]
pub struct TestStats {
    pub total_messages: usize,
    pub topic_counts: HashMap<String, usize>,
    pub subscriptions: Vec<String>,
    pub simulators: usize,
}

impl TestStats {
    pub fn print(&self) {
        println!("Test statistics:");
        println!("  simulators: {}", self.simulators);
        println!("  total messages: {}", self.total_messages);
        for (topic, count) in &self.topic_counts {
            println!("    {}: {} messages", topic, count);
        }
        println!("  subscriptions: {:?}", self.subscriptions);
    }
}
