//! rumqttc-backed bus.
//!
//! Two background tasks per connection:
//! - the event loop task polls rumqttc, dispatches incoming publishes to the
//!   registered handlers and re-subscribes every pattern on each ConnAck;
//! - the forwarder task drains an unbounded request queue into the
//!   `AsyncClient`, so `publish`/`subscribe` never wait on rumqttc's bounded
//!   request channel and per-publisher ordering is kept.

use super::{validate_pattern, validate_topic, BusError, MessageBus, MessageHandler, SubscriptionHandle, SubscriptionRegistry};
use crate::config::MqttConf;
use crate::health::HealthTracker;
use parking_lot::Mutex;
use rumqttc::{AsyncClient, Event, EventLoop, Incoming, MqttOptions, QoS};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

const QOS: QoS = QoS::AtLeastOnce;
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);

#[derive(Debug)]
enum Request {
    Publish { topic: String, payload: Vec<u8> },
    Subscribe(String),
    Unsubscribe(String),
}

pub struct MqttBus {
    registry: Arc<Mutex<SubscriptionRegistry>>,
    connected: Arc<AtomicBool>,
    requests: mpsc::UnboundedSender<Request>,
    shutdown: CancellationToken,
}

/// State shared between the bus handle and its event loop task
struct EventLoopLink {
    registry: Arc<Mutex<SubscriptionRegistry>>,
    connected: Arc<AtomicBool>,
    requests: mpsc::UnboundedSender<Request>,
    health: HealthTracker,
    shutdown: CancellationToken,
    reconnect_delay: Duration,
}

impl MqttBus {
    /// Opens the broker connection and waits for the first ConnAck.
    ///
    /// Later connection losses are handled in the background: the event loop
    /// retries after `reconnect_delay_secs`, doubling up to 30s, and
    /// re-subscribes on success.
    pub async fn connect(conf: &MqttConf, health: HealthTracker) -> Result<Self, BusError> {
        let client_id = format!("{}-{}", conf.client_id, Uuid::new_v4().simple());
        let mut opts = MqttOptions::new(client_id.clone(), conf.host.clone(), conf.port);
        opts.set_keep_alive(Duration::from_secs(conf.keep_alive_secs));
        opts.set_clean_session(true);

        let (client, eventloop) = AsyncClient::new(opts, conf.request_capacity);

        let registry = Arc::new(Mutex::new(SubscriptionRegistry::new()));
        let connected = Arc::new(AtomicBool::new(false));
        let shutdown = CancellationToken::new();
        let (requests, queue) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();

        tokio::spawn(forward_requests(client, queue, shutdown.clone()));
        tokio::spawn(drive_event_loop(
            EventLoopLink {
                registry: Arc::clone(&registry),
                connected: Arc::clone(&connected),
                requests: requests.clone(),
                health,
                shutdown: shutdown.clone(),
                reconnect_delay: Duration::from_secs(conf.reconnect_delay_secs),
            },
            eventloop,
            ready_tx,
        ));

        info!("connecting to MQTT broker {}:{} as {}", conf.host, conf.port, client_id);

        match timeout(Duration::from_secs(conf.connect_timeout_secs), ready_rx).await {
            Ok(Ok(())) => Ok(Self { registry, connected, requests, shutdown }),
            Ok(Err(_)) => {
                shutdown.cancel();
                Err(BusError::Connection("event loop stopped before ConnAck".into()))
            }
            Err(_) => {
                shutdown.cancel();
                Err(BusError::ConnectTimeout(conf.connect_timeout_secs))
            }
        }
    }

    /// Stops both background tasks and sends a DISCONNECT.
    pub fn disconnect(&self) {
        self.shutdown.cancel();
    }

    fn enqueue(&self, request: Request) -> Result<(), BusError> {
        self.requests.send(request).map_err(|_| BusError::Disconnected)
    }
}

impl Drop for MqttBus {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl MessageBus for MqttBus {
    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BusError> {
        validate_topic(topic)?;
        if !self.is_connected() {
            return Err(BusError::Disconnected);
        }
        self.enqueue(Request::Publish { topic: topic.to_string(), payload })
    }

    fn subscribe(&self, pattern: &str, handler: MessageHandler) -> Result<SubscriptionHandle, BusError> {
        validate_pattern(pattern)?;
        if !self.is_connected() {
            return Err(BusError::Disconnected);
        }
        let (handle, first) = self.registry.lock().insert(pattern, handler);
        if first {
            self.enqueue(Request::Subscribe(pattern.to_string()))?;
            debug!("subscribed to {}", pattern);
        }
        Ok(handle)
    }

    fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<(), BusError> {
        let (pattern, last) = self
            .registry
            .lock()
            .remove(handle)
            .ok_or(BusError::UnknownSubscription(handle.id()))?;
        // While disconnected the pattern is simply not re-subscribed
        if last && self.is_connected() {
            self.enqueue(Request::Unsubscribe(pattern.clone()))?;
            debug!("unsubscribed from {}", pattern);
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

async fn forward_requests(
    client: AsyncClient,
    mut queue: mpsc::UnboundedReceiver<Request>,
    shutdown: CancellationToken,
) {
    loop {
        let request = tokio::select! {
            _ = shutdown.cancelled() => break,
            request = queue.recv() => match request {
                Some(request) => request,
                None => break,
            },
        };

        let result = match request {
            Request::Publish { topic, payload } => client.publish(topic, QOS, false, payload).await,
            Request::Subscribe(pattern) => client.subscribe(pattern, QOS).await,
            Request::Unsubscribe(pattern) => client.unsubscribe(pattern).await,
        };
        if let Err(e) = result {
            warn!("MQTT request dropped: {}", e);
        }
    }

    if let Err(e) = client.try_disconnect() {
        debug!("MQTT disconnect not sent: {}", e);
    }
}

impl EventLoopLink {
    /// ConnAck: marks the link up and queues a SUBSCRIBE for every registered pattern.
    fn on_connected(&self) {
        self.connected.store(true, Ordering::SeqCst);
        self.health.mark_bus_connected();

        let patterns = self.registry.lock().patterns();
        if !patterns.is_empty() {
            info!("re-subscribing {} topic patterns", patterns.len());
        }
        for pattern in patterns {
            if self.requests.send(Request::Subscribe(pattern)).is_err() {
                break;
            }
        }
    }

    /// Only the first error after a ConnAck counts as a lost connection.
    fn on_connection_error(&self, error: &dyn std::fmt::Display) {
        if self.connected.swap(false, Ordering::SeqCst) {
            warn!("MQTT connection lost: {}", error);
            self.health.mark_bus_disconnected();
        } else {
            debug!("MQTT connection attempt failed: {}", error);
        }
    }

    fn dispatch(&self, topic: &str, payload: &[u8]) {
        let handlers = self.registry.lock().matching(topic);
        if handlers.is_empty() {
            debug!("no handler for {}", topic);
        }
        for handler in handlers {
            handler(topic, payload);
        }
    }
}

async fn drive_event_loop(link: EventLoopLink, mut eventloop: EventLoop, ready: oneshot::Sender<()>) {
    let mut ready = Some(ready);
    let mut backoff = link.reconnect_delay;

    loop {
        let event = tokio::select! {
            _ = link.shutdown.cancelled() => break,
            event = eventloop.poll() => event,
        };

        match event {
            Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                link.on_connected();
                backoff = link.reconnect_delay;
                match ready.take() {
                    Some(tx) => {
                        let _ = tx.send(());
                        info!("connected to MQTT broker");
                    }
                    None => info!("reconnected to MQTT broker"),
                }
            }
            Ok(Event::Incoming(Incoming::Publish(publish))) => link.dispatch(&publish.topic, &publish.payload),
            Ok(_) => {}
            Err(e) => {
                link.on_connection_error(&e);
                tokio::select! {
                    _ = link.shutdown.cancelled() => break,
                    _ = sleep(backoff) => {}
                }
                backoff = (backoff * 2).min(MAX_RECONNECT_DELAY);
            }
        }
    }

    link.connected.store(false, Ordering::SeqCst);
    debug!("MQTT event loop stopped");
}
