/**
 * MESSAGE BUS - Pub/sub transport shared by every device simulator
 *
 * ROLE :
 * Narrow publish / subscribe / unsubscribe contract between the simulation
 * engine and the transport. Simulators never see rumqttc directly, they get
 * an `Arc<dyn MessageBus>` at construction.
 *
 * OPERATION :
 * - `MqttBus` : rumqttc client, automatic reconnect + re-subscribe
 * - `MemoryBus` : in-process loopback (offline mode, tests)
 * - `SubscriptionRegistry` : handlers keyed by handle, shared by both
 *
 * TOPICS :
 * MQTT wildcard semantics, `+` = exactly one level, `#` = remainder.
 * Ex: `devices/+/commands` matches `devices/SN-001/commands`.
 */

pub mod memory;
pub mod mqtt;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

pub use memory::MemoryBus;
pub use mqtt::MqttBus;

/// Callback invoked for every message whose topic matches the subscribed pattern.
///
/// Runs on the bus delivery context: it must return quickly and never block.
pub type MessageHandler = Arc<dyn Fn(&str, &[u8]) + Send + Sync>;

/// Bus shared by the supervisor, every simulator and the HTTP layer.
pub type SharedBus = Arc<dyn MessageBus>;

/// Errors raised by the bus layer
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("bus is disconnected")]
    Disconnected,
    #[error("no broker acknowledgement after {0}s")]
    ConnectTimeout(u64),
    #[error("broker connection failed: {0}")]
    Connection(String),
    #[error("MQTT client error: {0}")]
    Client(#[from] rumqttc::ClientError),
    #[error("invalid topic: '{0}'")]
    InvalidTopic(String),
    #[error("unknown subscription #{0}")]
    UnknownSubscription(u64),
}

/// Opaque token returned by `subscribe`, used to detach exactly one handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionHandle(u64);

impl SubscriptionHandle {
    pub fn id(&self) -> u64 {
        self.0
    }
}

/// Publish/subscribe contract. Every method is safe to call concurrently
/// from any number of simulators.
pub trait MessageBus: Send + Sync {
    /// Fire-and-forget publish. Fails with `Disconnected` while the link is down.
    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BusError>;

    /// Attach `handler` to every topic matching `pattern`.
    /// The handler survives reconnections until `unsubscribe` is called.
    fn subscribe(&self, pattern: &str, handler: MessageHandler) -> Result<SubscriptionHandle, BusError>;

    /// Detach one handler. Works while disconnected.
    fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<(), BusError>;

    fn is_connected(&self) -> bool;
}

/// MQTT topic filter matching
pub fn topic_matches(pattern: &str, topic: &str) -> bool {
    let mut levels = topic.split('/');
    for filter in pattern.split('/') {
        match filter {
            "#" => return true,
            "+" => {
                if levels.next().is_none() {
                    return false;
                }
            }
            literal => {
                if levels.next() != Some(literal) {
                    return false;
                }
            }
        }
    }
    levels.next().is_none()
}

/// Checks a subscription pattern: wildcards must fill a whole level and `#` must be last.
pub fn validate_pattern(pattern: &str) -> Result<(), BusError> {
    if pattern.is_empty() {
        return Err(BusError::InvalidTopic(pattern.to_string()));
    }
    let levels: Vec<&str> = pattern.split('/').collect();
    for (index, level) in levels.iter().enumerate() {
        let has_wildcard = level.contains('+') || level.contains('#');
        let is_whole = *level == "+" || (*level == "#" && index == levels.len() - 1);
        if has_wildcard && !is_whole {
            return Err(BusError::InvalidTopic(pattern.to_string()));
        }
    }
    Ok(())
}

/// Checks a publish topic: non-empty, no wildcard.
pub fn validate_topic(topic: &str) -> Result<(), BusError> {
    if topic.is_empty() || topic.contains('+') || topic.contains('#') {
        return Err(BusError::InvalidTopic(topic.to_string()));
    }
    Ok(())
}

struct Subscription {
    pattern: String,
    handler: MessageHandler,
}

/// Handlers registered on a bus.
///
/// Several handlers may share a pattern; the transport only needs to
/// subscribe on the first one and unsubscribe after the last one.
#[derive(Default)]
pub struct SubscriptionRegistry {
    next_id: u64,
    // BTreeMap keeps dispatch in registration order
    entries: BTreeMap<u64, Subscription>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler. The boolean is true when the pattern was not registered before.
    pub fn insert(&mut self, pattern: &str, handler: MessageHandler) -> (SubscriptionHandle, bool) {
        let first = !self.entries.values().any(|s| s.pattern == pattern);
        self.next_id += 1;
        let id = self.next_id;
        self.entries.insert(id, Subscription { pattern: pattern.to_string(), handler });
        (SubscriptionHandle(id), first)
    }

    /// Removes a handler. Returns its pattern and whether it was the last one using it.
    pub fn remove(&mut self, handle: SubscriptionHandle) -> Option<(String, bool)> {
        let removed = self.entries.remove(&handle.0)?;
        let last = !self.entries.values().any(|s| s.pattern == removed.pattern);
        Some((removed.pattern, last))
    }

    /// Handlers interested in `topic`, cloned so they can be called without holding a lock.
    pub fn matching(&self, topic: &str) -> Vec<MessageHandler> {
        self.entries
            .values()
            .filter(|s| topic_matches(&s.pattern, topic))
            .map(|s| Arc::clone(&s.handler))
            .collect()
    }

    /// Distinct registered patterns, used to re-subscribe after a reconnect.
    pub fn patterns(&self) -> Vec<String> {
        let distinct: BTreeSet<&str> = self.entries.values().map(|s| s.pattern.as_str()).collect();
        distinct.into_iter().map(str::to_string).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> MessageHandler {
        Arc::new(|_, _| {})
    }

    #[test]
    fn test_single_level_wildcard() {
        assert!(topic_matches("devices/+/commands", "devices/SN-001/commands"));
        assert!(topic_matches("devices/+/telemetry", "devices/abc/telemetry"));
        assert!(!topic_matches("devices/+/commands", "devices/SN-001/telemetry"));
        assert!(!topic_matches("devices/+/commands", "devices/a/b/commands"));
        assert!(!topic_matches("devices/+/commands", "devices/commands"));
    }

    #[test]
    fn test_exact_and_multi_level() {
        assert!(topic_matches("devices/SN-001/commands", "devices/SN-001/commands"));
        assert!(!topic_matches("devices/SN-001/commands", "devices/SN-002/commands"));
        assert!(topic_matches("devices/#", "devices/SN-001/telemetry"));
        assert!(topic_matches("devices/#", "devices"));
        assert!(!topic_matches("devices/SN-001", "devices/SN-001/commands"));
    }

    #[test]
    fn test_pattern_validation() {
        assert!(validate_pattern("devices/+/commands").is_ok());
        assert!(validate_pattern("devices/#").is_ok());
        assert!(validate_pattern("").is_err());
        assert!(validate_pattern("devices/#/commands").is_err());
        assert!(validate_pattern("devices/sn+/commands").is_err());
        assert!(validate_topic("devices/+/commands").is_err());
        assert!(validate_topic("devices/SN-001/commands").is_ok());
    }

    #[test]
    fn test_registry_pattern_refcount() {
        let mut registry = SubscriptionRegistry::new();
        let (a, first_a) = registry.insert("devices/+/telemetry", noop());
        let (b, first_b) = registry.insert("devices/+/telemetry", noop());
        assert!(first_a);
        assert!(!first_b);
        assert_eq!(registry.patterns(), vec!["devices/+/telemetry".to_string()]);

        assert_eq!(registry.remove(a), Some(("devices/+/telemetry".to_string(), false)));
        assert_eq!(registry.remove(b), Some(("devices/+/telemetry".to_string(), true)));
        assert!(registry.remove(b).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_registry_matching() {
        let mut registry = SubscriptionRegistry::new();
        registry.insert("devices/SN-001/commands", noop());
        registry.insert("devices/+/commands", noop());
        registry.insert("devices/+/telemetry", noop());

        assert_eq!(registry.matching("devices/SN-001/commands").len(), 2);
        assert_eq!(registry.matching("devices/SN-002/commands").len(), 1);
        assert_eq!(registry.matching("other/topic").len(), 0);
        assert_eq!(registry.len(), 3);
    }
}
