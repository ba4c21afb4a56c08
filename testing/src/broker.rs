//! In-memory broker for fast, deterministic tests.
//!
//! Implements the broker transport traits with the AMQP semantics the reliability layer
//! depends on:
//!
//! - exchanges (direct, topic, fanout) routing to bound queues; the nameless default
//!   exchange routes to the queue named by the routing key
//! - round-robin delivery across a queue's consumers, bounded by channel prefetch
//! - ack, reject and reject-with-requeue (requeued messages go back to the head of the
//!   queue flagged as redelivered)
//! - unacknowledged deliveries are requeued when their consumer, channel or connection
//!   goes away
//!
//! Fault injection covers the failure modes under test: refused dials, an unexpected
//! drop of every live connection, and failing publishes.
//!
//! # Example
//!
//! ```
//! use checkin_messaging_testing::InMemoryBroker;
//!
//! let broker = InMemoryBroker::new();
//! broker.enqueue("checkins", br#"not json"#.to_vec());
//! assert_eq!(broker.ready_count("checkins"), 1);
//!
//! // Simulate the broker dropping every client connection
//! broker.drop_connections();
//! ```

use async_stream::stream;
use checkin_messaging_core::broker::{
    Acknowledger, Broker, BrokerChannel, BrokerConnection, BrokerError, BrokerFuture,
    CloseReason, Delivery, DeliveryStream, ExchangeKind, ExchangeSpec, PublishProperties,
    QueueSpec,
};
use checkin_messaging_core::config::ConnectionConfig;
use checkin_messaging_core::error::MessagingError;
use checkin_messaging_core::message::Message;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::{Future, ready};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::{mpsc, watch};

/// A publish the broker accepted.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedMessage {
    /// Target exchange
    pub exchange: String,
    /// Routing key
    pub routing_key: String,
    /// Raw payload
    pub body: Vec<u8>,
    /// Transport properties
    pub properties: PublishProperties,
}

impl PublishedMessage {
    /// Parse the payload as an envelope.
    #[must_use]
    pub fn message(&self) -> Option<Message> {
        Message::from_json(&self.body).ok()
    }
}

/// Broker-side counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BrokerStats {
    /// Successful dials
    pub dials: u32,
    /// Accepted publishes
    pub published: u32,
    /// Deliveries pushed to consumers
    pub delivered: u32,
    /// Deliveries acknowledged
    pub acked: u32,
    /// Deliveries rejected with requeue
    pub requeued: u32,
    /// Deliveries rejected without requeue
    pub rejected: u32,
}

#[derive(Clone)]
struct StoredMessage {
    body: Vec<u8>,
    headers: HashMap<String, Value>,
    redelivered: bool,
}

struct Unacked {
    message: StoredMessage,
    consumer_id: u64,
}

struct ConsumerSlot {
    id: u64,
    connection_id: u64,
    channel_id: u64,
    auto_ack: bool,
    prefetch: u16,
    in_flight: usize,
    sender: mpsc::UnboundedSender<Delivery>,
}

impl ConsumerSlot {
    fn has_capacity(&self) -> bool {
        self.auto_ack || self.prefetch == 0 || self.in_flight < usize::from(self.prefetch)
    }
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<StoredMessage>,
    unacked: HashMap<u64, Unacked>,
    consumers: Vec<ConsumerSlot>,
    next_consumer: usize,
}

impl QueueState {
    /// Remove a consumer and put its unacknowledged deliveries back, in delivery order.
    fn release_consumer(&mut self, consumer_id: u64) {
        self.consumers.retain(|c| c.id != consumer_id);

        let mut tags: Vec<u64> = self
            .unacked
            .iter()
            .filter(|(_, unacked)| unacked.consumer_id == consumer_id)
            .map(|(tag, _)| *tag)
            .collect();
        tags.sort_unstable();
        for tag in tags.into_iter().rev() {
            if let Some(unacked) = self.unacked.remove(&tag) {
                let mut message = unacked.message;
                message.redelivered = true;
                self.ready.push_front(message);
            }
        }

        if self.next_consumer >= self.consumers.len() {
            self.next_consumer = 0;
        }
    }
}

struct Binding {
    queue: String,
    exchange: String,
    routing_key: String,
}

#[derive(Default)]
struct Inner {
    exchanges: HashMap<String, ExchangeKind>,
    queues: HashMap<String, QueueState>,
    bindings: Vec<Binding>,
    connections: HashMap<u64, Arc<ConnectionShared>>,
    published: Vec<PublishedMessage>,
    rejected: Vec<Vec<u8>>,
    qos: Vec<(u16, u32)>,
    stats: BrokerStats,
}

impl Inner {
    fn route(&self, exchange: &str, routing_key: &str) -> Result<Vec<String>, BrokerError> {
        if exchange.is_empty() {
            return Ok(self
                .queues
                .contains_key(routing_key)
                .then(|| routing_key.to_string())
                .into_iter()
                .collect());
        }

        let Some(kind) = self.exchanges.get(exchange) else {
            return Err(BrokerError::operation(
                "basic.publish",
                format!("no exchange '{exchange}'"),
            ));
        };

        let mut queues: Vec<String> = self
            .bindings
            .iter()
            .filter(|b| b.exchange == exchange && binding_matches(*kind, &b.routing_key, routing_key))
            .map(|b| b.queue.clone())
            .collect();
        queues.sort_unstable();
        queues.dedup();
        Ok(queues)
    }

    /// Push ready messages to consumers with spare prefetch capacity.
    fn dispatch(&mut self, state: &Arc<BrokerState>, queue_name: &str) {
        let Some(queue) = self.queues.get_mut(queue_name) else {
            return;
        };

        while !queue.ready.is_empty() && !queue.consumers.is_empty() {
            let count = queue.consumers.len();
            let Some(index) = (0..count)
                .map(|offset| (queue.next_consumer + offset) % count)
                .find(|&i| queue.consumers[i].has_capacity())
            else {
                return;
            };
            let Some(message) = queue.ready.pop_front() else {
                return;
            };
            queue.next_consumer = (index + 1) % count;

            let delivery_tag = state.next_id();
            let consumer = &mut queue.consumers[index];
            let delivery = Delivery {
                delivery_tag,
                body: message.body.clone(),
                headers: message.headers.clone(),
                redelivered: message.redelivered,
                acker: Box::new(MemoryAcker {
                    state: Arc::downgrade(state),
                    connection: self.connections.get(&consumer.connection_id).cloned(),
                    queue: queue_name.to_string(),
                    delivery_tag,
                }),
            };

            if consumer.sender.send(delivery).is_err() {
                // The stream was dropped without unregistering; treat as a cancelled consumer.
                let consumer_id = consumer.id;
                queue.ready.push_front(message);
                queue.release_consumer(consumer_id);
                continue;
            }

            self.stats.delivered += 1;
            if consumer.auto_ack {
                self.stats.acked += 1;
            } else {
                consumer.in_flight += 1;
                let consumer_id = consumer.id;
                queue.unacked.insert(
                    delivery_tag,
                    Unacked {
                        message,
                        consumer_id,
                    },
                );
            }
        }
    }

    fn release_consumers(&mut self, state: &Arc<BrokerState>, owned: impl Fn(&ConsumerSlot) -> bool) {
        let names: Vec<String> = self.queues.keys().cloned().collect();
        for name in names {
            if let Some(queue) = self.queues.get_mut(&name) {
                let ids: Vec<u64> = queue
                    .consumers
                    .iter()
                    .filter(|c| owned(c))
                    .map(|c| c.id)
                    .collect();
                for id in ids {
                    queue.release_consumer(id);
                }
            }
            self.dispatch(state, &name);
        }
    }
}

fn binding_matches(kind: ExchangeKind, pattern: &str, routing_key: &str) -> bool {
    match kind {
        ExchangeKind::Direct => pattern == routing_key,
        ExchangeKind::Topic => topic_matches(pattern, routing_key),
        // Header matching is not modelled; headers exchanges behave like fanout.
        ExchangeKind::Fanout | ExchangeKind::Headers => true,
    }
}

/// AMQP topic match: `*` matches exactly one word, `#` zero or more words.
///
/// ```
/// use checkin_messaging_testing::broker::topic_matches;
///
/// assert!(topic_matches("checkin.*", "checkin.performed"));
/// assert!(topic_matches("#", "employee.created"));
/// assert!(!topic_matches("checkin.*", "checkin.performed.late"));
/// ```
#[must_use]
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    words_match(&pattern, &key)
}

fn words_match(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| words_match(rest, &key[skip..])),
        Some((&"*", rest)) => !key.is_empty() && words_match(rest, &key[1..]),
        Some((word, rest)) => key.first() == Some(word) && words_match(rest, &key[1..]),
    }
}

struct BrokerState {
    inner: Mutex<Inner>,
    refuse_dials: AtomicBool,
    failing_publishes: AtomicU32,
    next_id: AtomicU64,
}

impl BrokerState {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// In-memory implementation of [`Broker`].
///
/// Cloning yields another handle to the same broker.
#[derive(Clone)]
pub struct InMemoryBroker {
    state: Arc<BrokerState>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    /// Create an empty broker.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(BrokerState {
                inner: Mutex::new(Inner::default()),
                refuse_dials: AtomicBool::new(false),
                failing_publishes: AtomicU32::new(0),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    /// Refuse (or accept again) new connections.
    pub fn refuse_connections(&self, refuse: bool) {
        self.state.refuse_dials.store(refuse, Ordering::SeqCst);
        tracing::debug!(refuse, "In-memory broker dial refusal toggled");
    }

    /// Close every live connection as if the broker went away.
    ///
    /// Delivery streams end, unacknowledged deliveries are requeued and every
    /// connection's close notification fires with a non-local reason.
    ///
    /// Returns the number of connections dropped.
    pub fn drop_connections(&self) -> usize {
        let mut inner = self.state.lock();
        let connections: Vec<Arc<ConnectionShared>> =
            inner.connections.drain().map(|(_, c)| c).collect();

        for connection in &connections {
            connection.shut(CloseReason {
                reason: "CONNECTION_FORCED - broker forced connection closure".to_string(),
                initiated_locally: false,
            });
        }
        let ids: Vec<u64> = connections.iter().map(|c| c.id).collect();
        inner.release_consumers(&self.state, |c| ids.contains(&c.connection_id));
        tracing::debug!(dropped = connections.len(), "In-memory broker dropped its connections");
        connections.len()
    }

    /// Make the next `count` publishes fail.
    pub fn fail_next_publishes(&self, count: u32) {
        self.state.failing_publishes.store(count, Ordering::SeqCst);
        tracing::debug!(count, "In-memory broker will fail the next publishes");
    }

    /// Put a raw payload straight onto `queue`, declaring it if needed.
    pub fn enqueue(&self, queue: &str, body: Vec<u8>) {
        let mut inner = self.state.lock();
        inner.queues.entry(queue.to_string()).or_default().ready.push_back(StoredMessage {
            body,
            headers: HashMap::new(),
            redelivered: false,
        });
        inner.dispatch(&self.state, queue);
    }

    /// Put an envelope straight onto `queue`, declaring it if needed.
    ///
    /// # Errors
    ///
    /// Returns [`MessagingError::InvalidMessage`] if the envelope cannot be encoded.
    pub fn enqueue_message(&self, queue: &str, message: &Message) -> Result<(), MessagingError> {
        self.enqueue(queue, message.to_json()?);
        Ok(())
    }

    /// Number of live connections.
    #[must_use]
    pub fn live_connections(&self) -> usize {
        self.state.lock().connections.len()
    }

    /// Broker-side counters.
    #[must_use]
    pub fn stats(&self) -> BrokerStats {
        self.state.lock().stats
    }

    /// Every accepted publish, in order.
    #[must_use]
    pub fn published(&self) -> Vec<PublishedMessage> {
        self.state.lock().published.clone()
    }

    /// Payloads rejected without requeue, in order.
    #[must_use]
    pub fn rejected(&self) -> Vec<Vec<u8>> {
        self.state.lock().rejected.clone()
    }

    /// Every QoS setting applied on any channel, in order.
    #[must_use]
    pub fn qos_history(&self) -> Vec<(u16, u32)> {
        self.state.lock().qos.clone()
    }

    /// Messages waiting on `queue`.
    #[must_use]
    pub fn ready_count(&self, queue: &str) -> usize {
        self.state.lock().queues.get(queue).map_or(0, |q| q.ready.len())
    }

    /// Deliveries of `queue` awaiting acknowledgement.
    #[must_use]
    pub fn unacked_count(&self, queue: &str) -> usize {
        self.state.lock().queues.get(queue).map_or(0, |q| q.unacked.len())
    }

    /// Active consumers of `queue`.
    #[must_use]
    pub fn consumer_count(&self, queue: &str) -> usize {
        self.state.lock().queues.get(queue).map_or(0, |q| q.consumers.len())
    }

    /// Whether `queue` has been declared.
    #[must_use]
    pub fn has_queue(&self, queue: &str) -> bool {
        self.state.lock().queues.contains_key(queue)
    }

    /// Kind of `exchange`, if declared.
    #[must_use]
    pub fn exchange_kind(&self, exchange: &str) -> Option<ExchangeKind> {
        self.state.lock().exchanges.get(exchange).copied()
    }
}

impl fmt::Debug for InMemoryBroker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.state.lock();
        f.debug_struct("InMemoryBroker")
            .field("exchanges", &inner.exchanges.len())
            .field("queues", &inner.queues.len())
            .field("connections", &inner.connections.len())
            .field("stats", &inner.stats)
            .finish()
    }
}

impl Broker for InMemoryBroker {
    fn connect<'a>(
        &'a self,
        _config: &'a ConnectionConfig,
    ) -> BrokerFuture<'a, Arc<dyn BrokerConnection>> {
        Box::pin(async move {
            if self.state.refuse_dials.load(Ordering::SeqCst) {
                tracing::debug!("In-memory broker refused a dial");
                return Err(BrokerError::ConnectionFailed(
                    "connection refused".to_string(),
                ));
            }

            let (closed, _) = watch::channel(None);
            let shared = Arc::new(ConnectionShared {
                id: self.state.next_id(),
                open: AtomicBool::new(true),
                closed,
            });
            {
                let mut inner = self.state.lock();
                inner.connections.insert(shared.id, Arc::clone(&shared));
                inner.stats.dials += 1;
            }

            Ok(Arc::new(MemoryConnection {
                state: Arc::clone(&self.state),
                shared,
            }) as Arc<dyn BrokerConnection>)
        })
    }
}

struct ConnectionShared {
    id: u64,
    open: AtomicBool,
    closed: watch::Sender<Option<CloseReason>>,
}

impl ConnectionShared {
    fn shut(&self, reason: CloseReason) {
        self.open.store(false, Ordering::SeqCst);
        self.closed.send_replace(Some(reason));
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

struct MemoryConnection {
    state: Arc<BrokerState>,
    shared: Arc<ConnectionShared>,
}

impl BrokerConnection for MemoryConnection {
    fn open_channel(&self) -> BrokerFuture<'_, Arc<dyn BrokerChannel>> {
        let result = if self.shared.is_open() {
            Ok(Arc::new(MemoryChannel {
                id: self.state.next_id(),
                state: Arc::clone(&self.state),
                connection: Arc::clone(&self.shared),
                open: AtomicBool::new(true),
                prefetch: AtomicU16::new(0),
            }) as Arc<dyn BrokerChannel>)
        } else {
            Err(BrokerError::ChannelClosed("connection closed".to_string()))
        };
        Box::pin(ready(result))
    }

    fn closed(&self) -> Pin<Box<dyn Future<Output = CloseReason> + Send + 'static>> {
        let mut receiver = self.shared.closed.subscribe();
        Box::pin(async move {
            let dropped = || CloseReason {
                reason: "connection dropped".to_string(),
                initiated_locally: false,
            };
            match receiver.wait_for(Option::is_some).await {
                Ok(reason) => reason.clone().unwrap_or_else(dropped),
                Err(_) => dropped(),
            }
        })
    }

    fn is_open(&self) -> bool {
        self.shared.is_open()
    }

    fn close(&self) -> BrokerFuture<'_, ()> {
        self.shared.shut(CloseReason {
            reason: "closed by client".to_string(),
            initiated_locally: true,
        });
        let mut inner = self.state.lock();
        inner.connections.remove(&self.shared.id);
        let id = self.shared.id;
        inner.release_consumers(&self.state, |c| c.connection_id == id);
        Box::pin(ready(Ok(())))
    }
}

struct MemoryChannel {
    id: u64,
    state: Arc<BrokerState>,
    connection: Arc<ConnectionShared>,
    open: AtomicBool,
    prefetch: AtomicU16,
}

impl MemoryChannel {
    fn ensure_open(&self) -> Result<(), BrokerError> {
        if !self.connection.is_open() {
            return Err(BrokerError::ChannelClosed("connection closed".to_string()));
        }
        if !self.open.load(Ordering::SeqCst) {
            return Err(BrokerError::ChannelClosed("channel closed".to_string()));
        }
        Ok(())
    }

    fn declare_exchange_now(&self, spec: &ExchangeSpec) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let mut inner = self.state.lock();
        match inner.exchanges.get(&spec.name) {
            Some(kind) if *kind != spec.kind => Err(BrokerError::operation(
                "exchange.declare",
                format!(
                    "PRECONDITION_FAILED - inequivalent arg 'type' for exchange '{}': received '{}' but current is '{kind}'",
                    spec.name, spec.kind
                ),
            )),
            Some(_) => Ok(()),
            None => {
                inner.exchanges.insert(spec.name.clone(), spec.kind);
                Ok(())
            }
        }
    }

    fn bind_queue_now(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let mut inner = self.state.lock();
        if !inner.queues.contains_key(queue) {
            return Err(BrokerError::operation("queue.bind", format!("no queue '{queue}'")));
        }
        if !inner.exchanges.contains_key(exchange) {
            return Err(BrokerError::operation(
                "queue.bind",
                format!("no exchange '{exchange}'"),
            ));
        }
        let exists = inner
            .bindings
            .iter()
            .any(|b| b.queue == queue && b.exchange == exchange && b.routing_key == routing_key);
        if !exists {
            inner.bindings.push(Binding {
                queue: queue.to_string(),
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
            });
        }
        Ok(())
    }

    fn publish_now(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: &PublishProperties,
    ) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let injected = self
            .state
            .failing_publishes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            tracing::debug!(exchange, routing_key, "In-memory broker failed a publish on request");
            return Err(BrokerError::operation("basic.publish", "injected failure"));
        }

        let mut inner = self.state.lock();
        let queues = inner.route(exchange, routing_key)?;
        inner.published.push(PublishedMessage {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            body: payload.to_vec(),
            properties: properties.clone(),
        });
        inner.stats.published += 1;

        for name in queues {
            if let Some(queue) = inner.queues.get_mut(&name) {
                queue.ready.push_back(StoredMessage {
                    body: payload.to_vec(),
                    headers: properties.headers.clone(),
                    redelivered: false,
                });
            }
            inner.dispatch(&self.state, &name);
        }
        Ok(())
    }

    fn qos_now(&self, prefetch_count: u16, prefetch_size: u32) -> Result<(), BrokerError> {
        self.ensure_open()?;
        self.prefetch.store(prefetch_count, Ordering::SeqCst);
        let mut inner = self.state.lock();
        inner.qos.push((prefetch_count, prefetch_size));
        for queue in inner.queues.values_mut() {
            for consumer in queue.consumers.iter_mut().filter(|c| c.channel_id == self.id) {
                consumer.prefetch = prefetch_count;
            }
        }
        Ok(())
    }

    fn consume_now(&self, queue: &str, auto_ack: bool) -> Result<DeliveryStream, BrokerError> {
        self.ensure_open()?;
        let (sender, mut receiver) = mpsc::unbounded_channel();
        let consumer_id = self.state.next_id();
        {
            let mut inner = self.state.lock();
            let Some(state) = inner.queues.get_mut(queue) else {
                return Err(BrokerError::operation(
                    "basic.consume",
                    format!("NOT_FOUND - no queue '{queue}'"),
                ));
            };
            state.consumers.push(ConsumerSlot {
                id: consumer_id,
                connection_id: self.connection.id,
                channel_id: self.id,
                auto_ack,
                prefetch: self.prefetch.load(Ordering::SeqCst),
                in_flight: 0,
                sender,
            });
            inner.dispatch(&self.state, queue);
        }

        let release = ConsumerRelease {
            state: Arc::downgrade(&self.state),
            queue: queue.to_string(),
            consumer_id,
        };
        let deliveries = stream! {
            let _release = release;
            while let Some(delivery) = receiver.recv().await {
                yield Ok::<_, BrokerError>(delivery);
            }
        };
        Ok(Box::pin(deliveries))
    }
}

impl BrokerChannel for MemoryChannel {
    fn declare_exchange<'a>(&'a self, spec: &'a ExchangeSpec) -> BrokerFuture<'a, ()> {
        Box::pin(ready(self.declare_exchange_now(spec)))
    }

    fn declare_queue<'a>(&'a self, spec: &'a QueueSpec) -> BrokerFuture<'a, ()> {
        let result = self.ensure_open().map(|()| {
            self.state.lock().queues.entry(spec.name.clone()).or_default();
        });
        Box::pin(ready(result))
    }

    fn bind_queue<'a>(
        &'a self,
        queue: &'a str,
        exchange: &'a str,
        routing_key: &'a str,
    ) -> BrokerFuture<'a, ()> {
        Box::pin(ready(self.bind_queue_now(queue, exchange, routing_key)))
    }

    fn publish<'a>(
        &'a self,
        exchange: &'a str,
        routing_key: &'a str,
        payload: &'a [u8],
        properties: &'a PublishProperties,
    ) -> BrokerFuture<'a, ()> {
        Box::pin(ready(self.publish_now(exchange, routing_key, payload, properties)))
    }

    fn qos(&self, prefetch_count: u16, prefetch_size: u32) -> BrokerFuture<'_, ()> {
        Box::pin(ready(self.qos_now(prefetch_count, prefetch_size)))
    }

    fn consume<'a>(
        &'a self,
        queue: &'a str,
        _consumer_tag: &'a str,
        auto_ack: bool,
    ) -> BrokerFuture<'a, DeliveryStream> {
        Box::pin(ready(self.consume_now(queue, auto_ack)))
    }

    fn close(&self) -> BrokerFuture<'_, ()> {
        self.open.store(false, Ordering::SeqCst);
        let id = self.id;
        self.state
            .lock()
            .release_consumers(&self.state, |c| c.channel_id == id);
        Box::pin(ready(Ok(())))
    }
}

/// Unregisters a consumer when its delivery stream is dropped.
struct ConsumerRelease {
    state: Weak<BrokerState>,
    queue: String,
    consumer_id: u64,
}

impl Drop for ConsumerRelease {
    fn drop(&mut self) {
        let Some(state) = self.state.upgrade() else {
            return;
        };
        let mut inner = state.lock();
        if let Some(queue) = inner.queues.get_mut(&self.queue) {
            queue.release_consumer(self.consumer_id);
        }
        inner.dispatch(&state, &self.queue);
    }
}

#[derive(Clone, Copy)]
enum Settlement {
    Ack,
    Requeue,
    Reject,
}

struct MemoryAcker {
    state: Weak<BrokerState>,
    connection: Option<Arc<ConnectionShared>>,
    queue: String,
    delivery_tag: u64,
}

impl MemoryAcker {
    fn settle(&self, settlement: Settlement) -> Result<(), BrokerError> {
        let operation = match settlement {
            Settlement::Ack => "basic.ack",
            Settlement::Requeue | Settlement::Reject => "basic.reject",
        };

        if !self.connection.as_ref().is_some_and(|c| c.is_open()) {
            return Err(BrokerError::ChannelClosed("connection closed".to_string()));
        }
        let Some(state) = self.state.upgrade() else {
            return Err(BrokerError::ChannelClosed("broker is gone".to_string()));
        };

        let mut guard = state.lock();
        let inner = &mut *guard;
        let unknown_tag = || {
            BrokerError::operation(
                operation,
                format!("PRECONDITION_FAILED - unknown delivery tag {}", self.delivery_tag),
            )
        };
        let queue = inner.queues.get_mut(&self.queue).ok_or_else(unknown_tag)?;
        let unacked = queue.unacked.remove(&self.delivery_tag).ok_or_else(unknown_tag)?;

        if let Some(consumer) = queue.consumers.iter_mut().find(|c| c.id == unacked.consumer_id) {
            consumer.in_flight = consumer.in_flight.saturating_sub(1);
        }

        match settlement {
            Settlement::Ack => inner.stats.acked += 1,
            Settlement::Requeue => {
                let mut message = unacked.message;
                message.redelivered = true;
                queue.ready.push_front(message);
                inner.stats.requeued += 1;
            }
            Settlement::Reject => {
                inner.rejected.push(unacked.message.body);
                inner.stats.rejected += 1;
            }
        }

        inner.dispatch(&state, &self.queue);
        Ok(())
    }
}

impl Acknowledger for MemoryAcker {
    fn ack(&self) -> BrokerFuture<'_, ()> {
        Box::pin(ready(self.settle(Settlement::Ack)))
    }

    fn reject(&self, requeue: bool) -> BrokerFuture<'_, ()> {
        let settlement = if requeue {
            Settlement::Requeue
        } else {
            Settlement::Reject
        };
        Box::pin(ready(self.settle(settlement)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_patterns() {
        assert!(topic_matches("checkin.performed", "checkin.performed"));
        assert!(topic_matches("checkin.*", "checkin.performed"));
        assert!(topic_matches("*.performed", "checkout.performed"));
        assert!(topic_matches("employee.#", "employee"));
        assert!(topic_matches("employee.#", "employee.created.v2"));
        assert!(topic_matches("#.created", "employee.created"));
        assert!(!topic_matches("checkin.*", "checkin"));
        assert!(!topic_matches("checkin.*", "checkout.performed"));
    }

    #[test]
    fn enqueue_declares_queue() {
        let broker = InMemoryBroker::new();
        assert!(!broker.has_queue("checkins"));

        broker.enqueue("checkins", b"{}".to_vec());
        assert!(broker.has_queue("checkins"));
        assert_eq!(broker.ready_count("checkins"), 1);
        assert_eq!(broker.consumer_count("checkins"), 0);
    }
}
