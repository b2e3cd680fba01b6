/*!
Recording bus for developing without a broker

Wraps the kernel's `MemoryBus`: every accepted publish is recorded for
assertions, and link drops can be injected to exercise the retry paths.
*/

use anyhow::Result;
use fleet_kernel::bus::{BusError, MemoryBus, MessageBus, MessageHandler, SubscriptionHandle};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Debug, Clone, PartialEq)]
pub struct RecordedMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

#[derive(Default)]
pub struct RecordingBus {
    inner: MemoryBus,
    published_messages: Mutex<Vec<RecordedMessage>>,
    subscriptions: Mutex<Vec<String>>,
    rejected_publishes: AtomicUsize,
}

impl RecordingBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn simulate_disconnect(&self) {
        tracing::info!("[stub] link down");
        self.inner.set_connected(false);
    }

    pub fn simulate_reconnect(&self) {
        tracing::info!("[stub] link up");
        self.inner.set_connected(true);
    }

    /// Delivers a message to the subscribers as if it came from the broker.
    /// Not recorded as a publish.
    pub fn simulate_incoming<S: AsRef<str>, V: Into<Vec<u8>>>(&self, topic: S, payload: V) -> Result<()> {
        self.inner.publish(topic.as_ref(), payload.into())?;
        tracing::debug!("[stub] simulated incoming: {}", topic.as_ref());
        Ok(())
    }

    pub fn get_published_messages(&self) -> Vec<RecordedMessage> {
        self.published_messages.lock().clone()
    }

    /// Patterns subscribed so far, in order (unsubscribes not reflected)
    pub fn get_subscriptions(&self) -> Vec<String> {
        self.subscriptions.lock().clone()
    }

    pub fn active_subscriptions(&self) -> usize {
        self.inner.subscription_count()
    }

    /// Publishes refused because the link was down
    pub fn rejected_publishes(&self) -> usize {
        self.rejected_publishes.load(Ordering::SeqCst)
    }

    pub fn find_messages_by_topic(&self, topic: &str) -> Vec<RecordedMessage> {
        self.published_messages
            .lock()
            .iter()
            .filter(|msg| msg.topic == topic)
            .cloned()
            .collect()
    }

    /// Last message of a topic, parsed as JSON
    pub fn get_last_json_message<T>(&self, topic: &str) -> Result<Option<T>>
    where
        T: for<'de> serde::Deserialize<'de>,
    {
        match self.find_messages_by_topic(topic).last() {
            Some(last) => Ok(Some(serde_json::from_slice(&last.payload)?)),
            None => Ok(None),
        }
    }

    pub fn clear(&self) {
        self.published_messages.lock().clear();
        self.subscriptions.lock().clear();
        self.rejected_publishes.store(0, Ordering::SeqCst);
    }
}

impl MessageBus for RecordingBus {
    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BusError> {
        let message = RecordedMessage { topic: topic.to_string(), payload: payload.clone() };
        match self.inner.publish(topic, payload) {
            Ok(()) => {
                // handlers already ran, record order is delivery order
                self.published_messages.lock().push(message);
                Ok(())
            }
            Err(e) => {
                if matches!(e, BusError::Disconnected) {
                    self.rejected_publishes.fetch_add(1, Ordering::SeqCst);
                }
                Err(e)
            }
        }
    }

    fn subscribe(&self, pattern: &str, handler: MessageHandler) -> Result<SubscriptionHandle, BusError> {
        let handle = self.inner.subscribe(pattern, handler)?;
        self.subscriptions.lock().push(pattern.to_string());
        Ok(handle)
    }

    fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<(), BusError> {
        self.inner.unsubscribe(handle)
    }

    fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_records_publishes_and_subscriptions() {
        let bus = RecordingBus::new();
        let seen = Arc::new(Mutex::new(0));
        let sink = Arc::clone(&seen);
        bus.subscribe("devices/+/telemetry", Arc::new(move |_, _| *sink.lock() += 1)).unwrap();
        assert_eq!(bus.get_subscriptions(), vec!["devices/+/telemetry"]);

        bus.publish("devices/A/telemetry", br#"{"n":1}"#.to_vec()).unwrap();
        bus.publish("devices/A/telemetry", br#"{"n":2}"#.to_vec()).unwrap();
        bus.simulate_incoming("devices/B/telemetry", b"{}".to_vec()).unwrap();

        assert_eq!(*seen.lock(), 3);
        assert_eq!(bus.get_published_messages().len(), 2);
        let last: Option<serde_json::Value> = bus.get_last_json_message("devices/A/telemetry").unwrap();
        assert_eq!(last.unwrap()["n"], 2);
    }

    #[test]
    fn test_disconnect_rejects_and_counts() {
        let bus = RecordingBus::new();
        bus.simulate_disconnect();
        assert!(matches!(bus.publish("devices/A/commands", vec![]), Err(BusError::Disconnected)));
        assert_eq!(bus.rejected_publishes(), 1);
        assert!(bus.get_published_messages().is_empty());

        bus.simulate_reconnect();
        bus.publish("devices/A/commands", vec![]).unwrap();
        assert_eq!(bus.find_messages_by_topic("devices/A/commands").len(), 1);

        bus.clear();
        assert_eq!(bus.rejected_publishes(), 0);
        assert!(bus.get_published_messages().is_empty());
    }
}
