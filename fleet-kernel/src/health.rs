use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct KernelHealth {
    pub uptime_seconds: u64,
    pub simulators_running: u32,
    pub memory_usage_mb: f32,
    pub bus_status: String,
    pub bus_reconnects: u32,
}

/// Kernel-wide counters, cheap to clone into the bus and the HTTP state
#[derive(Clone)]
pub struct HealthTracker {
    start_time: Instant,
    bus_reconnects: Arc<AtomicU32>,
    bus_status: Arc<parking_lot::Mutex<String>>,
}

impl HealthTracker {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            bus_reconnects: Arc::new(AtomicU32::new(0)),
            bus_status: Arc::new(parking_lot::Mutex::new("connecting".to_string())),
        }
    }

    pub fn mark_bus_connected(&self) {
        *self.bus_status.lock() = "connected".to_string();
    }

    /// Called on every lost connection; the bus then retries on its own.
    pub fn mark_bus_disconnected(&self) {
        self.bus_reconnects.fetch_add(1, Ordering::Relaxed);
        *self.bus_status.lock() = "reconnecting".to_string();
    }

    pub fn bus_reconnects(&self) -> u32 {
        self.bus_reconnects.load(Ordering::Relaxed)
    }

    pub fn get_health(&self, simulators_running: usize, bus_connected: bool) -> KernelHealth {
        // the in-memory bus never reports through the tracker
        let bus_status = if bus_connected {
            "connected".to_string()
        } else {
            self.bus_status.lock().clone()
        };

        KernelHealth {
            uptime_seconds: self.start_time.elapsed().as_secs(),
            simulators_running: simulators_running as u32,
            memory_usage_mb: get_memory_usage_mb(),
            bus_status,
            bus_reconnects: self.bus_reconnects(),
        }
    }
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new()
    }
}

fn get_memory_usage_mb() -> f32 {
    #[cfg(target_os = "linux")]
    {
        let pid = std::process::id();
        if let Ok(status) = std::fs::read_to_string(format!("/proc/{}/status", pid)) {
            for line in status.lines() {
                if line.starts_with("VmRSS:") {
                    if let Some(kb) = line.split_whitespace().nth(1).and_then(|v| v.parse::<u64>().ok()) {
                        return (kb as f32) / 1024.0;
                    }
                }
            }
        }
    }

    0.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reconnect_accounting() {
        let tracker = HealthTracker::new();
        assert_eq!(tracker.get_health(0, false).bus_status, "connecting");

        tracker.mark_bus_connected();
        tracker.mark_bus_disconnected();
        tracker.mark_bus_disconnected();

        let health = tracker.get_health(3, false);
        assert_eq!(health.bus_status, "reconnecting");
        assert_eq!(health.bus_reconnects, 2);
        assert_eq!(health.simulators_running, 3);

        assert_eq!(tracker.get_health(3, true).bus_status, "connected");
    }
}
