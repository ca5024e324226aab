//! MQTT bus client.
//!
//! Wraps a `rumqttc` client and its event loop. The event loop runs on its own
//! task, reconnects with jittered exponential backoff, and routes incoming
//! publishes to [`Subscription`] streams by wildcard pattern.
//!
//! Publishing never blocks: while connected a publish is handed to the client
//! request queue, while disconnected it is held in a bounded local queue. On
//! every (re)connection all subscriptions are reissued first, then the bridge
//! announces itself online, then queued publishes are flushed in order. The
//! session lock is held from the state change until the replay is handed to
//! the client, so no concurrent publish can overtake it.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rumqttc::{AsyncClient, Event, EventLoop, LastWill, MqttOptions, Outgoing, Packet, QoS};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use zigbridge_common::{Availability, Backoff, BackoffConfig, MqttConfig, TopicBuilder, topic_matches};

use crate::error::{BridgeError, Result};

/// A message received from the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// A publish waiting to be handed to the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundPublish {
    pub topic: String,
    pub payload: Vec<u8>,
    pub retain: bool,
}

/// A request for the MQTT client, in the order it must be issued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusRequest {
    Subscribe(String),
    Publish(OutboundPublish),
}

/// Anything that can publish to the bus.
///
/// Implemented by [`BusClient`] and by [`MemoryBus`] for tests.
pub trait BusPublisher: Send + Sync {
    /// Publish a payload. Must not block on network I/O.
    fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool) -> Result<()>;

    /// Publish a JSON document.
    fn publish_json(&self, topic: &str, value: &serde_json::Value, retain: bool) -> Result<()> {
        let payload = serde_json::to_vec(value)?;
        self.publish(topic, payload, retain)
    }
}

/// Stream of messages matching one subscription pattern.
#[derive(Debug)]
pub struct Subscription {
    pattern: String,
    rx: mpsc::UnboundedReceiver<BusMessage>,
}

impl Subscription {
    /// The pattern this subscription was created with.
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Wait for the next matching message. `None` once the client is gone.
    pub async fn next(&mut self) -> Option<BusMessage> {
        self.rx.recv().await
    }
}

/// Connection-independent session bookkeeping.
///
/// Holds everything that must survive a reconnect: the subscription set, the
/// publishes made while offline, and the birth message.
#[derive(Debug)]
pub struct SessionState {
    connected: bool,
    subscriptions: Vec<(String, mpsc::UnboundedSender<BusMessage>)>,
    queue: VecDeque<OutboundPublish>,
    max_queued: usize,
    birth: Option<OutboundPublish>,
}

impl SessionState {
    /// Create an empty, disconnected session.
    pub fn new(max_queued: usize) -> Self {
        Self {
            connected: false,
            subscriptions: Vec::new(),
            queue: VecDeque::new(),
            max_queued,
            birth: None,
        }
    }

    /// Set the message published on every connection, before queued publishes.
    pub fn with_birth(mut self, birth: OutboundPublish) -> Self {
        self.birth = Some(birth);
        self
    }

    /// Whether the broker connection is currently up.
    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Number of publishes held while disconnected.
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Patterns that are reissued on every connection.
    pub fn patterns(&self) -> Vec<String> {
        let mut patterns: Vec<String> = Vec::new();
        for (pattern, _) in &self.subscriptions {
            if !patterns.contains(pattern) {
                patterns.push(pattern.clone());
            }
        }
        patterns
    }

    /// Register a subscription. Returns the request to issue now, if connected.
    pub fn subscribe(
        &mut self,
        pattern: &str,
        tx: mpsc::UnboundedSender<BusMessage>,
    ) -> Option<BusRequest> {
        self.subscriptions.push((pattern.to_string(), tx));
        self.connected
            .then(|| BusRequest::Subscribe(pattern.to_string()))
    }

    /// Submit a publish. Returns the request to issue now, if connected.
    pub fn publish(&mut self, publish: OutboundPublish) -> Result<Option<BusRequest>> {
        if self.connected {
            return Ok(Some(BusRequest::Publish(publish)));
        }
        if self.queue.len() >= self.max_queued {
            return Err(BridgeError::publish(
                publish.topic,
                format!("offline queue full ({} messages)", self.max_queued),
            ));
        }
        self.queue.push_back(publish);
        Ok(None)
    }

    /// Mark the session connected and return the requests to replay.
    ///
    /// Subscriptions come first so command topics are live before anything
    /// queued goes out.
    pub fn on_connected(&mut self) -> Vec<BusRequest> {
        self.connected = true;
        let mut requests: Vec<BusRequest> = self
            .patterns()
            .into_iter()
            .map(BusRequest::Subscribe)
            .collect();
        if let Some(birth) = &self.birth {
            requests.push(BusRequest::Publish(birth.clone()));
        }
        requests.extend(self.queue.drain(..).map(BusRequest::Publish));
        requests
    }

    /// Mark the session disconnected. Returns whether it was connected before.
    pub fn on_disconnected(&mut self) -> bool {
        std::mem::replace(&mut self.connected, false)
    }

    /// Deliver a message to every matching subscription.
    ///
    /// Subscriptions whose receiver was dropped are pruned.
    pub fn route(&mut self, message: &BusMessage) -> usize {
        let mut delivered = 0;
        self.subscriptions.retain(|(pattern, tx)| {
            if !topic_matches(pattern, &message.topic) {
                return !tx.is_closed();
            }
            match tx.send(message.clone()) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(_) => false,
            }
        });
        delivered
    }
}

/// MQTT client handle. Cheap to clone.
#[derive(Clone)]
pub struct BusClient {
    inner: Arc<BusInner>,
}

struct BusInner {
    client: AsyncClient,
    session: Arc<Mutex<SessionState>>,
    topics: TopicBuilder,
    connected_rx: watch::Receiver<bool>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for BusClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusClient")
            .field("base_topic", &self.inner.topics.base())
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl BusClient {
    /// Create the client and start its event loop.
    ///
    /// Fails only on unusable options. An unreachable broker is retried in the
    /// background; use [`wait_connected`](Self::wait_connected) to wait for it.
    pub fn connect(config: &MqttConfig, backoff: BackoffConfig) -> Result<Self> {
        config
            .validate()
            .map_err(|e| BridgeError::MqttConnection(e.to_string()))?;

        let topics = TopicBuilder::new(config.base_topic.clone());
        let bridge_state = topics.bridge_state();

        let mut options = MqttOptions::new(config.client_id(), &config.host, config.port);
        options.set_keep_alive(Duration::from_secs(config.keep_alive_secs));
        options.set_clean_session(true);
        options.set_last_will(LastWill::new(
            bridge_state.clone(),
            Availability::Offline.as_str(),
            QoS::AtLeastOnce,
            true,
        ));
        if let Some(username) = &config.username {
            options.set_credentials(username, config.password.clone().unwrap_or_default());
        }

        // Room for a full offline queue plus the subscriptions replayed before it.
        let (client, eventloop) = AsyncClient::new(options, config.max_queued_publishes + 64);

        let session = Arc::new(Mutex::new(
            SessionState::new(config.max_queued_publishes).with_birth(OutboundPublish {
                topic: bridge_state,
                payload: Availability::Online.as_str().as_bytes().to_vec(),
                retain: true,
            }),
        ));
        let (connected_tx, connected_rx) = watch::channel(false);
        let cancel = CancellationToken::new();

        tracing::info!(
            broker = %config.broker_addr(),
            client_id = %config.client_id(),
            base_topic = %config.base_topic,
            "Connecting to MQTT broker"
        );

        let task = tokio::spawn(run_event_loop(
            eventloop,
            client.clone(),
            session.clone(),
            connected_tx,
            Backoff::new(backoff),
            cancel.clone(),
        ));

        Ok(Self {
            inner: Arc::new(BusInner {
                client,
                session,
                topics,
                connected_rx,
                cancel,
                task: Mutex::new(Some(task)),
            }),
        })
    }

    /// Topic builder for this client's base topic.
    pub fn topics(&self) -> &TopicBuilder {
        &self.inner.topics
    }

    /// Whether the broker connection is currently up.
    pub fn is_connected(&self) -> bool {
        *self.inner.connected_rx.borrow()
    }

    /// Wait until the broker connection is up.
    pub async fn wait_connected(&self, timeout: Duration) -> Result<()> {
        let mut rx = self.inner.connected_rx.clone();
        match tokio::time::timeout(timeout, rx.wait_for(|connected| *connected)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(BridgeError::MqttConnection(
                "event loop stopped".to_string(),
            )),
            Err(_) => Err(BridgeError::MqttConnection(format!(
                "no connection after {}s",
                timeout.as_secs()
            ))),
        }
    }

    /// Subscribe to a topic pattern.
    ///
    /// The subscription is reissued automatically after every reconnect.
    pub fn subscribe(&self, pattern: &str) -> Result<Subscription> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut session = self.inner.session.lock();
        if let Some(request) = session.subscribe(pattern, tx) {
            self.inner.client.apply(request)?;
        }
        drop(session);
        tracing::debug!(pattern = %pattern, "Subscribed");
        Ok(Subscription {
            pattern: pattern.to_string(),
            rx,
        })
    }

    /// Announce the bridge offline and close the connection.
    ///
    /// The explicit offline publish is needed because a clean disconnect
    /// does not trigger the last will.
    pub async fn disconnect(&self) -> Result<()> {
        let topic = self.inner.topics.bridge_state();
        if self.is_connected() {
            if let Err(e) = self.publish(&topic, Availability::Offline.as_str().into(), true) {
                tracing::warn!(error = %e, "Failed to publish offline state");
            }
        }

        if let Err(e) = self.inner.client.disconnect().await {
            tracing::debug!(error = %e, "MQTT disconnect request failed");
        }

        let task = self.inner.task.lock().take();
        if let Some(task) = task {
            if tokio::time::timeout(Duration::from_secs(2), task).await.is_err() {
                tracing::warn!("MQTT event loop did not stop in time");
            }
        }
        self.inner.cancel.cancel();

        tracing::info!("Disconnected from MQTT broker");
        Ok(())
    }
}

impl BusPublisher for BusClient {
    fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool) -> Result<()> {
        let publish = OutboundPublish {
            topic: topic.to_string(),
            payload,
            retain,
        };
        if !submit(&self.inner.session, &self.inner.client, publish)? {
            tracing::debug!(topic = %topic, "Broker offline, publish queued");
        }
        Ok(())
    }
}

/// Where session requests are issued. Must not block.
trait RequestSink {
    fn apply(&self, request: BusRequest) -> Result<()>;
}

impl RequestSink for AsyncClient {
    fn apply(&self, request: BusRequest) -> Result<()> {
        match request {
            BusRequest::Subscribe(pattern) => self
                .try_subscribe(pattern.clone(), QoS::AtLeastOnce)
                .map_err(|e| BridgeError::Subscribe {
                    pattern,
                    message: e.to_string(),
                }),
            BusRequest::Publish(publish) => self
                .try_publish(
                    publish.topic.clone(),
                    QoS::AtLeastOnce,
                    publish.retain,
                    publish.payload,
                )
                .map_err(|e| BridgeError::publish(publish.topic, e.to_string())),
        }
    }
}

/// Issue a publish now or queue it. Returns whether it was issued.
fn submit(
    session: &Mutex<SessionState>,
    sink: &impl RequestSink,
    publish: OutboundPublish,
) -> Result<bool> {
    let mut session = session.lock();
    match session.publish(publish)? {
        Some(request) => sink.apply(request).map(|()| true),
        None => Ok(false),
    }
}

/// Mark the session connected and issue its replay under one lock.
fn replay(session: &Mutex<SessionState>, sink: &impl RequestSink) -> usize {
    let mut session = session.lock();
    let requests = session.on_connected();
    let replayed = requests.len();
    for request in requests {
        if let Err(e) = sink.apply(request) {
            tracing::warn!(error = %e, "Failed to replay request after connect");
        }
    }
    replayed
}

/// Drive the MQTT event loop until cancelled or cleanly disconnected.
async fn run_event_loop(
    mut eventloop: EventLoop,
    client: AsyncClient,
    session: Arc<Mutex<SessionState>>,
    connected_tx: watch::Sender<bool>,
    mut backoff: Backoff,
    cancel: CancellationToken,
) {
    loop {
        let polled = tokio::select! {
            _ = cancel.cancelled() => break,
            polled = eventloop.poll() => polled,
        };

        match polled {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                if backoff.attempts() > 0 {
                    tracing::info!(attempts = backoff.attempts(), "MQTT connection restored");
                } else {
                    tracing::info!(code = ?ack.code, "Connected to MQTT broker");
                }
                backoff.reset();

                let replayed = replay(&session, &client);
                tracing::debug!(requests = replayed, "Session replayed");
                connected_tx.send_replace(true);
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let message = BusMessage {
                    topic: publish.topic,
                    payload: publish.payload.to_vec(),
                };
                let delivered = session.lock().route(&message);
                tracing::trace!(topic = %message.topic, delivered, "MQTT message received");
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                session.lock().on_disconnected();
                connected_tx.send_replace(false);
                break;
            }
            Ok(_) => {}
            Err(e) => {
                let was_connected = session.lock().on_disconnected();
                connected_tx.send_replace(false);
                let delay = backoff.next_delay();
                if was_connected {
                    tracing::warn!(error = %e, "MQTT connection lost");
                }
                tracing::debug!(
                    error = %e,
                    attempt = backoff.attempts(),
                    retry_in_ms = delay.as_millis() as u64,
                    "MQTT connection error, retrying"
                );
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
    tracing::debug!("MQTT event loop stopped");
}

/// In-memory publisher that records every publish.
///
/// Used by tests and dry runs.
#[derive(Debug, Default, Clone)]
pub struct MemoryBus {
    published: Arc<Mutex<Vec<OutboundPublish>>>,
}

impl MemoryBus {
    /// Create an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything published so far.
    pub fn published(&self) -> Vec<OutboundPublish> {
        self.published.lock().clone()
    }

    /// Publishes on one topic, decoded as JSON where possible.
    pub fn json_on(&self, topic: &str) -> Vec<serde_json::Value> {
        self.published
            .lock()
            .iter()
            .filter(|p| p.topic == topic)
            .map(|p| {
                serde_json::from_slice(&p.payload).unwrap_or_else(|_| {
                    serde_json::Value::String(String::from_utf8_lossy(&p.payload).into_owned())
                })
            })
            .collect()
    }

    /// Forget everything recorded so far.
    pub fn clear(&self) {
        self.published.lock().clear();
    }
}

impl BusPublisher for MemoryBus {
    fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool) -> Result<()> {
        self.published.lock().push(OutboundPublish {
            topic: topic.to_string(),
            payload,
            retain,
        });
        Ok(())
    }
}
