//! Log-only observer of the telemetry stream.

use crate::bus::{BusError, MessageBus, SubscriptionHandle};
use crate::models::{TelemetrySample, TELEMETRY_PATTERN};
use std::sync::Arc;
use tracing::{debug, warn};

/// Subscribes to `devices/+/telemetry` and logs every sample at debug level.
pub fn watch_telemetry(bus: &dyn MessageBus) -> Result<SubscriptionHandle, BusError> {
    bus.subscribe(
        TELEMETRY_PATTERN,
        Arc::new(|topic, body| match serde_json::from_slice::<TelemetrySample>(body) {
            Ok(sample) => debug!(
                "{} status={:?} fw={} cpu={} mem={}",
                topic, sample.status, sample.firmware_version, sample.metrics.cpu, sample.metrics.memory
            ),
            Err(e) => warn!("unreadable telemetry on {}: {}", topic, e),
        }),
    )
}
