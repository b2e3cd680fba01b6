//! In-process loopback bus.
//!
//! Delivers every publish synchronously to the matching handlers, in
//! registration order. Used when the kernel runs without a broker
//! (`bus: memory`) and by the test suites.

use super::{validate_pattern, validate_topic, BusError, MessageBus, MessageHandler, SubscriptionHandle, SubscriptionRegistry};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

pub struct MemoryBus {
    registry: Mutex<SubscriptionRegistry>,
    connected: AtomicBool,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self {
            registry: Mutex::new(SubscriptionRegistry::new()),
            connected: AtomicBool::new(true),
        }
    }

    /// Simulates a link drop or recovery. Handlers stay attached either way,
    /// like the re-subscribe performed by `MqttBus` on reconnect.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
        debug!("memory bus connected={}", connected);
    }

    pub fn subscription_count(&self) -> usize {
        self.registry.lock().len()
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageBus for MemoryBus {
    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BusError> {
        validate_topic(topic)?;
        if !self.is_connected() {
            return Err(BusError::Disconnected);
        }
        // lock released before calling out
        let handlers = self.registry.lock().matching(topic);
        for handler in handlers {
            handler(topic, &payload);
        }
        Ok(())
    }

    fn subscribe(&self, pattern: &str, handler: MessageHandler) -> Result<SubscriptionHandle, BusError> {
        validate_pattern(pattern)?;
        if !self.is_connected() {
            return Err(BusError::Disconnected);
        }
        let (handle, _) = self.registry.lock().insert(pattern, handler);
        Ok(handle)
    }

    fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<(), BusError> {
        self.registry
            .lock()
            .remove(handle)
            .map(|_| ())
            .ok_or(BusError::UnknownSubscription(handle.id()))
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}
