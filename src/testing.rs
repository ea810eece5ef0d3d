//! In-process broker for tests
//!
//! [`InMemoryBroker`] implements the connector traits of all four backends,
//! records every frame that reaches it, and fans frames out to in-process
//! subscribers. Fault knobs let tests make connects and sends fail, hang or
//! break.
//!
//! ```
//! use courier::testing::InMemoryBroker;
//!
//! let broker = InMemoryBroker::new();
//! broker.fail_next_connects(2);
//! broker.fail_next_sends(1);
//! assert!(broker.frames().is_empty());
//! ```

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::backends::amqp::{AmqpChannel, AmqpConnector, AmqpProperties};
use crate::backends::log::{LogConnector, LogProducer, LogRecord};
use crate::backends::mqtt::{MqttConnector, MqttPublish, MqttSession, MqttSessionOptions};
use crate::backends::socket::{PublisherSocket, SocketConnector};
use crate::message::{Delivery, Headers};
use crate::transport::{BackendKind, Subscription, TransportError};

/// A frame accepted by the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveredFrame {
    pub backend: BackendKind,
    /// Exchange, socket topic, log topic or MQTT topic
    pub topic: String,
    /// Routing key or record key; the topic again where there is none
    pub key: String,
    pub payload: Vec<u8>,
    pub headers: Headers,
    pub correlation_id: Option<String>,
    pub message_id: Option<String>,
    /// AMQP only
    pub delivery_mode: Option<u8>,
    /// MQTT only
    pub qos: Option<u8>,
    pub retain: bool,
    /// Id of the handle that sent the frame
    pub connection: u64,
}

impl DeliveredFrame {
    fn new(backend: BackendKind, topic: impl Into<String>, key: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            backend,
            topic: topic.into(),
            key: key.into(),
            payload,
            headers: Headers::new(),
            correlation_id: None,
            message_id: None,
            delivery_mode: None,
            qos: None,
            retain: false,
            connection: 0,
        }
    }
}

struct Subscriber {
    filter: String,
    sender: mpsc::UnboundedSender<Delivery>,
}

#[derive(Default)]
struct BrokerState {
    frames: Mutex<Vec<DeliveredFrame>>,
    subscribers: Mutex<Vec<Subscriber>>,
    client_ids: Mutex<Vec<String>>,
    send_delay: Mutex<Duration>,
    connect_delay: Mutex<Duration>,

    fail_connects: AtomicU32,
    fail_sends: AtomicU32,
    reject_sends: AtomicU32,
    hang_sends: AtomicBool,
    generation: AtomicU64,

    next_id: AtomicU64,
    connect_attempts: AtomicU64,
    connects: AtomicU64,
    closed: AtomicU64,
    confirm_selects: AtomicU64,
    exclusivity_violations: AtomicU64,
    acks: AtomicU64,
    nacks: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Decrement `counter` if it is positive; true when it was
fn take_one(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

/// Shared in-process broker; clones observe the same state
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<BrokerState>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `n` connect or subscribe attempts fail with a transient error
    pub fn fail_next_connects(&self, n: u32) {
        self.state.fail_connects.store(n, Ordering::SeqCst);
    }

    /// The next `n` sends fail with a transient error
    pub fn fail_next_sends(&self, n: u32) {
        self.state.fail_sends.store(n, Ordering::SeqCst);
    }

    /// The next `n` sends are refused by the broker (permanent)
    pub fn reject_next_sends(&self, n: u32) {
        self.state.reject_sends.store(n, Ordering::SeqCst);
    }

    /// While set, sends never complete
    pub fn hang_sends(&self, hang: bool) {
        self.state.hang_sends.store(hang, Ordering::SeqCst);
    }

    pub fn set_send_delay(&self, delay: Duration) {
        *lock(&self.state.send_delay) = delay;
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        *lock(&self.state.connect_delay) = delay;
    }

    /// Every handle opened so far stops being usable
    pub fn break_connections(&self) {
        self.state.generation.fetch_add(1, Ordering::SeqCst);
    }

    /// Every frame accepted so far, in arrival order
    pub fn frames(&self) -> Vec<DeliveredFrame> {
        lock(&self.state.frames).clone()
    }

    /// Frames published to `topic`
    pub fn frames_for(&self, topic: &str) -> Vec<DeliveredFrame> {
        lock(&self.state.frames)
            .iter()
            .filter(|f| f.topic == topic)
            .cloned()
            .collect()
    }

    /// Connect and subscribe attempts, failed ones included
    pub fn connect_attempts(&self) -> u64 {
        self.state.connect_attempts.load(Ordering::SeqCst)
    }

    /// Handles opened successfully
    pub fn connects(&self) -> u64 {
        self.state.connects.load(Ordering::SeqCst)
    }

    /// Handles closed by their owner
    pub fn closed_handles(&self) -> u64 {
        self.state.closed.load(Ordering::SeqCst)
    }

    pub fn confirm_selects(&self) -> u64 {
        self.state.confirm_selects.load(Ordering::SeqCst)
    }

    /// Times a handle was used by two sends at once
    pub fn exclusivity_violations(&self) -> u64 {
        self.state.exclusivity_violations.load(Ordering::SeqCst)
    }

    /// MQTT client ids seen, in connect order
    pub fn client_ids(&self) -> Vec<String> {
        lock(&self.state.client_ids).clone()
    }

    pub fn acks(&self) -> u64 {
        self.state.acks.load(Ordering::SeqCst)
    }

    pub fn nacks(&self) -> u64 {
        self.state.nacks.load(Ordering::SeqCst)
    }

    /// Hand a raw payload to every subscriber of `source`, as if another
    /// producer had published it. Returns the number of receivers.
    pub fn inject(&self, source: &str, payload: &[u8]) -> usize {
        self.fan_out(&DeliveredFrame::new(BackendKind::Amqp, source, source, payload.to_vec()))
    }

    /// End every open subscription
    pub fn close_subscriptions(&self) {
        lock(&self.state.subscribers).clear();
    }

    fn fan_out(&self, frame: &DeliveredFrame) -> usize {
        let mut subscribers = lock(&self.state.subscribers);
        subscribers.retain(|s| !s.sender.is_closed());

        let mut receivers = 0;
        for subscriber in subscribers.iter() {
            let filter = &subscriber.filter;
            if !filter.is_empty() && *filter != frame.topic && *filter != frame.key {
                continue;
            }
            let source = if filter.is_empty() { &frame.topic } else { filter };
            let delivery = Delivery {
                source: source.clone(),
                payload: frame.payload.clone(),
                headers: frame.headers.clone(),
                correlation_id: frame.correlation_id.clone(),
                message_id: frame.message_id.clone(),
            };
            if subscriber.sender.send(delivery).is_ok() {
                receivers += 1;
            }
        }
        receivers
    }

    async fn admit_connect(&self) -> Result<(), TransportError> {
        self.state.connect_attempts.fetch_add(1, Ordering::SeqCst);
        let delay = *lock(&self.state.connect_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if take_one(&self.state.fail_connects) {
            return Err(TransportError::Connection("injected connect failure".to_string()));
        }
        Ok(())
    }

    async fn open_handle(&self, backend: BackendKind) -> Result<MemoryHandle, TransportError> {
        self.admit_connect().await?;
        self.state.connects.fetch_add(1, Ordering::SeqCst);
        Ok(MemoryHandle {
            broker: self.clone(),
            backend,
            id: self.state.next_id.fetch_add(1, Ordering::SeqCst) + 1,
            generation: self.state.generation.load(Ordering::SeqCst),
            closed: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
        })
    }

    async fn open_subscription(&self, filter: &str) -> Result<Box<dyn Subscription>, TransportError> {
        self.admit_connect().await?;
        let (sender, receiver) = mpsc::unbounded_channel();
        lock(&self.state.subscribers).push(Subscriber {
            filter: filter.to_string(),
            sender,
        });
        Ok(Box::new(MemorySubscription {
            broker: self.clone(),
            receiver,
        }))
    }
}

impl std::fmt::Debug for InMemoryBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryBroker")
            .field("frames", &lock(&self.state.frames).len())
            .field("connects", &self.connects())
            .field("closed", &self.closed_handles())
            .finish()
    }
}

/// Handle given out by [`InMemoryBroker`] for every backend
pub struct MemoryHandle {
    broker: InMemoryBroker,
    backend: BackendKind,
    id: u64,
    generation: u64,
    closed: AtomicBool,
    in_flight: AtomicUsize,
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MemoryHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    fn usable(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
            && self.generation == self.broker.state.generation.load(Ordering::SeqCst)
    }

    fn shut(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.broker.state.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    async fn deliver(&self, mut frame: DeliveredFrame) -> Result<(), TransportError> {
        if !self.usable() {
            return Err(TransportError::Closed);
        }
        let state = &self.broker.state;

        if self.in_flight.fetch_add(1, Ordering::SeqCst) > 0 {
            state.exclusivity_violations.fetch_add(1, Ordering::SeqCst);
        }
        let _in_flight = InFlight(&self.in_flight);

        let delay = *lock(&state.send_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if state.hang_sends.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if take_one(&state.fail_sends) {
            return Err(TransportError::Send("injected send failure".to_string()));
        }
        if take_one(&state.reject_sends) {
            return Err(TransportError::Rejected("injected rejection".to_string()));
        }

        frame.backend = self.backend;
        frame.connection = self.id;
        lock(&state.frames).push(frame.clone());
        self.broker.fan_out(&frame);
        Ok(())
    }
}

impl Drop for MemoryHandle {
    fn drop(&mut self) {
        self.shut();
    }
}

#[async_trait]
impl AmqpChannel for MemoryHandle {
    fn is_open(&self) -> bool {
        self.usable()
    }

    async fn confirm_select(&self) -> Result<(), TransportError> {
        self.broker
            .state
            .confirm_selects
            .fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        properties: &AmqpProperties,
        body: &[u8],
        _await_confirm: bool,
    ) -> Result<(), TransportError> {
        let mut frame = DeliveredFrame::new(BackendKind::Amqp, exchange, routing_key, body.to_vec());
        frame.headers = properties.headers.clone();
        frame.correlation_id = properties.correlation_id.clone();
        frame.message_id = properties.message_id.clone();
        frame.delivery_mode = Some(properties.delivery_mode);
        self.deliver(frame).await
    }

    fn close(&self) {
        self.shut();
    }
}

#[async_trait]
impl PublisherSocket for MemoryHandle {
    fn is_open(&self) -> bool {
        self.usable()
    }

    async fn send_frames(&self, mut frames: Vec<Vec<u8>>) -> Result<(), TransportError> {
        let payload = frames.pop().unwrap_or_default();
        let topic = frames
            .first()
            .map(|t| String::from_utf8_lossy(t).into_owned())
            .unwrap_or_default();
        let frame = DeliveredFrame::new(BackendKind::Socket, topic.clone(), topic, payload);
        self.deliver(frame).await
    }

    fn close(&self) {
        self.shut();
    }
}

#[async_trait]
impl LogProducer for MemoryHandle {
    fn is_ready(&self) -> bool {
        self.usable()
    }

    async fn send(&self, record: &LogRecord, timeout: Duration) -> Result<(), TransportError> {
        let mut frame = DeliveredFrame::new(
            BackendKind::Log,
            record.topic.clone(),
            record.key.clone(),
            record.payload.clone(),
        );
        frame.headers = record.headers.clone();
        tokio::time::timeout(timeout, self.deliver(frame))
            .await
            .map_err(|_| TransportError::Timeout(timeout))?
    }

    fn close(&self) {
        self.shut();
    }
}

#[async_trait]
impl MqttSession for MemoryHandle {
    fn is_connected(&self) -> bool {
        self.usable()
    }

    async fn publish(&self, message: MqttPublish) -> Result<(), TransportError> {
        let mut frame = DeliveredFrame::new(
            BackendKind::Mqtt,
            message.topic.clone(),
            message.topic,
            message.payload,
        );
        frame.qos = Some(message.qos);
        frame.retain = message.retain;
        self.deliver(frame).await
    }

    fn disconnect(&self) {
        self.shut();
    }
}

struct MemorySubscription {
    broker: InMemoryBroker,
    receiver: mpsc::UnboundedReceiver<Delivery>,
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn next(&mut self) -> Result<Option<Delivery>, TransportError> {
        Ok(self.receiver.recv().await)
    }

    async fn ack(&mut self) -> Result<(), TransportError> {
        self.broker.state.acks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn nack(&mut self) -> Result<(), TransportError> {
        self.broker.state.nacks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl AmqpConnector for InMemoryBroker {
    async fn open_channel(&self) -> Result<Box<dyn AmqpChannel>, TransportError> {
        Ok(Box::new(self.open_handle(BackendKind::Amqp).await?))
    }

    async fn open_consumer(&self, queue: &str) -> Result<Box<dyn Subscription>, TransportError> {
        self.open_subscription(queue).await
    }
}

#[async_trait]
impl SocketConnector for InMemoryBroker {
    async fn open_publisher(
        &self,
        _endpoint: &str,
    ) -> Result<Box<dyn PublisherSocket>, TransportError> {
        Ok(Box::new(self.open_handle(BackendKind::Socket).await?))
    }

    async fn open_subscriber(
        &self,
        _endpoint: &str,
        topic: &str,
    ) -> Result<Box<dyn Subscription>, TransportError> {
        self.open_subscription(topic).await
    }
}

#[async_trait]
impl LogConnector for InMemoryBroker {
    async fn create_producer(&self) -> Result<Box<dyn LogProducer>, TransportError> {
        Ok(Box::new(self.open_handle(BackendKind::Log).await?))
    }

    async fn open_consumer(&self, topic: &str) -> Result<Box<dyn Subscription>, TransportError> {
        self.open_subscription(topic).await
    }
}

#[async_trait]
impl MqttConnector for InMemoryBroker {
    async fn connect(
        &self,
        options: &MqttSessionOptions,
    ) -> Result<Box<dyn MqttSession>, TransportError> {
        let handle = self.open_handle(BackendKind::Mqtt).await?;
        lock(&self.state.client_ids).push(options.client_id.clone());
        Ok(Box::new(handle))
    }

    async fn subscribe(
        &self,
        _options: &MqttSessionOptions,
        topic: &str,
        _qos: u8,
    ) -> Result<Box<dyn Subscription>, TransportError> {
        self.open_subscription(topic).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_failures_are_consumed() {
        let broker = InMemoryBroker::new();
        broker.fail_next_connects(1);

        assert!(AmqpConnector::open_channel(&broker).await.is_err());
        assert!(AmqpConnector::open_channel(&broker).await.is_ok());
        assert_eq!(broker.connect_attempts(), 2);
        assert_eq!(broker.connects(), 1);
    }

    #[tokio::test]
    async fn test_break_connections_affects_existing_handles_only() {
        let broker = InMemoryBroker::new();
        let old = LogConnector::create_producer(&broker).await.unwrap();
        broker.break_connections();
        let fresh = LogConnector::create_producer(&broker).await.unwrap();

        assert!(!old.is_ready());
        assert!(fresh.is_ready());
    }

    #[tokio::test]
    async fn test_fan_out_to_matching_subscribers() {
        let broker = InMemoryBroker::new();
        let mut orders = LogConnector::open_consumer(&broker, "orders").await.unwrap();
        let _audit = LogConnector::open_consumer(&broker, "audit").await.unwrap();

        assert_eq!(broker.inject("orders", b"{}"), 1);
        let delivery = orders.next().await.unwrap().unwrap();
        assert_eq!(delivery.source, "orders");
        assert_eq!(delivery.payload, b"{}");

        broker.close_subscriptions();
        assert_eq!(orders.next().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_close_is_counted_once() {
        let broker = InMemoryBroker::new();
        let session = MqttConnector::connect(
            &broker,
            &MqttSessionOptions {
                client_id: "probe".into(),
                host: "localhost".into(),
                port: 1883,
                username: String::new(),
                password: Default::default(),
                clean_session: true,
                keep_alive: Duration::from_secs(30),
            },
        )
        .await
        .unwrap();

        session.disconnect();
        drop(session);
        assert_eq!(broker.closed_handles(), 1);
        assert_eq!(broker.client_ids(), vec!["probe".to_string()]);
    }
}
