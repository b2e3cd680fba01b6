/**
 * DEVICE SIMULATOR - Runtime stand-in for one device
 *
 * ROLE :
 * Owns the simulated state of a single device, reacts to the commands
 * published on `devices/<serial>/commands` and reports telemetry on
 * `devices/<serial>/telemetry` every `telemetry_interval`.
 *
 * OPERATION :
 * - The bus handler only parses the body and forwards a `DeviceCommand`
 *   into the simulator channel, it never touches the state.
 * - One task per device owns `SimulatedDeviceState` and selects over the
 *   channel, the telemetry interval, the restart timer, the firmware timer
 *   and the cancellation token.
 * - Timers are owned slots: arming one replaces (and so cancels) the
 *   previous deadline. Last command wins, nothing is queued.
 *
 * COMMANDS :
 * - restart : Restarting now, Online after `command_delay`
 * - updateFirmware {version} : version committed after `command_delay`
 * - anything else : ignored, the bus has no reply channel
 */

use crate::bus::{BusError, MessageHandler, SharedBus, SubscriptionHandle};
use crate::config::SimulationConf;
use crate::models::{command_topic, telemetry_topic, CommandMessage, DeviceRecord, DeviceSnapshot, SimulatedDeviceState, TelemetrySample};
use serde_json::Value;
use std::future::pending;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior, Sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("malformed command: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Command verbs understood by a simulated device
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceCommand {
    Restart,
    /// `version` is `None` when the payload carries no usable version
    UpdateFirmware { version: Option<String> },
    Unrecognized(String),
}

impl DeviceCommand {
    /// Parses a raw command body. Only an unreadable body is an error,
    /// an unknown verb is a valid `Unrecognized` command.
    pub fn parse(body: &[u8]) -> Result<Self, CommandError> {
        let message: CommandMessage = serde_json::from_slice(body)?;
        Ok(Self::from_message(&message))
    }

    pub fn from_message(message: &CommandMessage) -> Self {
        match message.command.as_str() {
            "restart" => DeviceCommand::Restart,
            "updateFirmware" => DeviceCommand::UpdateFirmware {
                version: message
                    .payload
                    .as_ref()
                    .and_then(|payload| payload.get("version"))
                    .and_then(Value::as_str)
                    .filter(|version| !version.is_empty())
                    .map(str::to_string),
            },
            other => DeviceCommand::Unrecognized(other.to_string()),
        }
    }
}

/// Owned handle on a running simulator.
///
/// Dropping the handle cancels the simulator; `stop` also waits for the
/// task to unsubscribe.
pub struct SimulatorHandle {
    serial: String,
    snapshot: watch::Receiver<DeviceSnapshot>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl SimulatorHandle {
    pub fn serial(&self) -> &str {
        &self.serial
    }

    pub fn snapshot(&self) -> DeviceSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Receiver notified on every state change
    pub fn watch(&self) -> watch::Receiver<DeviceSnapshot> {
        self.snapshot.clone()
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Cancels telemetry and pending timers, unsubscribes, waits for the task.
    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Err(e) = (&mut self.task).await {
            warn!("simulator {} ended abnormally: {}", self.serial, e);
        }
    }
}

impl Drop for SimulatorHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

type Timer = Option<Pin<Box<Sleep>>>;

pub struct DeviceSimulator {
    serial: String,
    telemetry_topic: String,
    state: SimulatedDeviceState,
    settings: SimulationConf,
    bus: SharedBus,
    subscription: SubscriptionHandle,
    snapshot: watch::Sender<DeviceSnapshot>,
    cancel: CancellationToken,
    restart_timer: Timer,
    firmware_timer: Timer,
}

impl DeviceSimulator {
    /// Brings the device up: state forced Online, command topic subscribed,
    /// telemetry loop started. `settings` must have passed `SimulationConf::validate`.
    pub fn spawn(record: &DeviceRecord, bus: SharedBus, settings: SimulationConf) -> Result<SimulatorHandle, BusError> {
        let serial = record.serial.clone();
        let state = SimulatedDeviceState::start(record, &settings.default_firmware);

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let subscription = bus.subscribe(&command_topic(&serial), command_handler(serial.clone(), commands_tx))?;

        let (snapshot_tx, snapshot_rx) = watch::channel(DeviceSnapshot::of(&serial, &state));
        let cancel = CancellationToken::new();

        let simulator = DeviceSimulator {
            serial: serial.clone(),
            telemetry_topic: telemetry_topic(&serial),
            state,
            settings,
            bus,
            subscription,
            snapshot: snapshot_tx,
            cancel: cancel.clone(),
            restart_timer: None,
            firmware_timer: None,
        };
        let task = tokio::spawn(simulator.run(commands_rx));

        info!("device {} started simulation", serial);
        Ok(SimulatorHandle { serial, snapshot: snapshot_rx, cancel, task })
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<DeviceCommand>) {
        let period = self.settings.telemetry_interval();
        let mut telemetry = interval_at(Instant::now() + period, period);
        telemetry.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                Some(command) = commands.recv() => self.apply(command),
                _ = telemetry.tick() => self.publish_telemetry(),
                _ = expired(&mut self.restart_timer) => self.finish_restart(),
                _ = expired(&mut self.firmware_timer) => self.finish_firmware_update(),
            }
        }

        if let Err(e) = self.bus.unsubscribe(self.subscription) {
            warn!("device {} unsubscribe failed: {}", self.serial, e);
        }
        info!("device {} stopped simulation", self.serial);
    }

    fn apply(&mut self, command: DeviceCommand) {
        match command {
            DeviceCommand::Restart => {
                info!("device {} restarting...", self.serial);
                self.state.begin_restart();
                self.restart_timer = Some(Box::pin(sleep(self.settings.command_delay())));
            }
            DeviceCommand::UpdateFirmware { version: Some(version) } => {
                info!("device {} updating firmware to {}", self.serial, version);
                self.state.begin_firmware_update(version);
                self.firmware_timer = Some(Box::pin(sleep(self.settings.command_delay())));
            }
            DeviceCommand::UpdateFirmware { version: None } => {
                warn!("device {} received updateFirmware but no version", self.serial);
                return;
            }
            DeviceCommand::Unrecognized(verb) => {
                debug!("device {} ignoring unrecognized command '{}'", self.serial, verb);
                return;
            }
        }
        self.publish_snapshot();
    }

    fn finish_restart(&mut self) {
        self.restart_timer = None;
        self.state.complete_restart();
        info!("device {} restarted", self.serial);
        self.publish_snapshot();
    }

    fn finish_firmware_update(&mut self) {
        self.firmware_timer = None;
        if let Some(version) = self.state.complete_firmware_update() {
            info!("device {} firmware updated to {}", self.serial, version);
        }
        self.publish_snapshot();
    }

    fn publish_telemetry(&self) {
        let sample = TelemetrySample::capture(&self.state, &mut rand::thread_rng());
        let payload = match serde_json::to_vec(&sample) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("device {} telemetry not serializable: {}", self.serial, e);
                return;
            }
        };
        // next tick tries again
        if let Err(e) = self.bus.publish(&self.telemetry_topic, payload) {
            warn!("device {} telemetry not published: {}", self.serial, e);
        }
    }

    fn publish_snapshot(&self) {
        self.snapshot.send_replace(DeviceSnapshot::of(&self.serial, &self.state));
    }
}

/// Resolves when the armed timer fires, never when the slot is empty
async fn expired(timer: &mut Timer) {
    match timer.as_mut() {
        Some(deadline) => deadline.await,
        None => pending().await,
    }
}

fn command_handler(serial: String, commands: mpsc::UnboundedSender<DeviceCommand>) -> MessageHandler {
    Arc::new(move |_topic, body| match DeviceCommand::parse(body) {
        Ok(command) => {
            info!("device {} received command: {:?}", serial, command);
            if commands.send(command).is_err() {
                debug!("device {} is stopping, command dropped", serial);
            }
        }
        Err(e) => warn!("failed to parse command for {}: {}", serial, e),
    })
}
