//! Multi-worker consumer with QoS and bounded redelivery.
//!
//! # Lifecycle
//!
//! ```text
//! Stopped ──start()──► Starting ──► Running ──stop()──► Stopping ──► Stopped
//! ```
//!
//! `start` on a consumer that is not stopped fails with
//! [`MessagingError::AlreadyRunning`]; `stop` on one that is not running fails with
//! [`MessagingError::NotRunning`].
//!
//! # Workers
//!
//! A run owns exactly `concurrent_consumers` independent workers pulling from the same
//! queue. Within one worker deliveries are processed in broker order; across workers no
//! ordering is attempted. When a delivery stream closes for any reason other than
//! cancellation, the worker sleeps `retry_delay` and re-opens it, which is how a run
//! survives a reconnect without anyone calling `start` again.
//!
//! # Per-delivery decisions
//!
//! | Situation | Outcome |
//! |-----------|---------|
//! | envelope does not parse | reject, no requeue |
//! | no handler for the type | reject, no requeue |
//! | handler succeeded | ack |
//! | handler failed, `retry < max_retries` | retry + 1, reject with requeue |
//! | handler failed, budget spent | reject, no requeue (dropped) |
//! | handler failed while the run is stopping | reject with requeue, retry unchanged |
//!
//! In auto-ack mode the broker settles deliveries on send, so none of these send an ack
//! or a reject.

use crate::connection::ConnectionManager;
use crate::metrics::ConsumerMetrics;
use checkin_messaging_core::broker::{Delivery, DeliveryStream};
use checkin_messaging_core::config::ConsumerConfig;
use checkin_messaging_core::error::{MessagingError, Result};
use checkin_messaging_core::handler::{MessageHandler, ProcessingContext};
use checkin_messaging_core::message::Message;
use checkin_messaging_core::registry::HandlerRegistry;
use futures::StreamExt;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Lifecycle state of a [`Consumer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    /// Not running; `start` is allowed
    Stopped,
    /// Applying QoS and spawning workers
    Starting,
    /// Workers are pulling deliveries
    Running,
    /// Cancellation requested; waiting for workers to exit
    Stopping,
}

impl fmt::Display for ConsumerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stopped => write!(f, "stopped"),
            Self::Starting => write!(f, "starting"),
            Self::Running => write!(f, "running"),
            Self::Stopping => write!(f, "stopping"),
        }
    }
}

/// How a single delivery was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Handler succeeded and the delivery was acknowledged
    Acked,
    /// Auto-ack mode: the broker settled the delivery on send
    AutoAcked,
    /// Handler failed with retry budget left, or failed while the run was stopping; requeued
    Requeued,
    /// Unparsable or unroutable; rejected without requeue
    Rejected,
    /// Handler failed with no retry budget left; rejected without requeue
    Dropped,
}

impl Outcome {
    /// Metric label for this outcome.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Acked => "acked",
            Self::AutoAcked => "auto_acked",
            Self::Requeued => "requeued",
            Self::Rejected => "rejected",
            Self::Dropped => "dropped",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What to do with a message whose handler failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDecision {
    /// Increment the retry counter and requeue
    Requeue,
    /// Give up on the message
    Drop,
}

/// Decide the fate of a failed message that has been retried `retry` times.
#[must_use]
pub const fn decide_failure(retry: u32, max_retries: u32) -> FailureDecision {
    if retry < max_retries {
        FailureDecision::Requeue
    } else {
        FailureDecision::Drop
    }
}

/// Retry counts of requeued messages, keyed by message id.
///
/// A broker requeue returns the original bytes, not the envelope with its incremented
/// counter, so the consumer remembers the count itself. Entries are removed when the
/// message is acknowledged or dropped here, when the consumer stops, when they outlive
/// the tracker's TTL, or when the tracker is full and they are the oldest. A message
/// settled by some other consumer therefore only lingers until it expires.
#[derive(Debug)]
pub struct RedeliveryTracker {
    entries: Mutex<HashMap<String, Tracked>>,
    capacity: usize,
    ttl: Duration,
}

#[derive(Debug, Clone, Copy)]
struct Tracked {
    retry: u32,
    recorded: Instant,
}

impl RedeliveryTracker {
    /// Entries kept before the oldest is evicted.
    pub const DEFAULT_CAPACITY: usize = 10_000;
    /// How long an entry survives without being refreshed.
    pub const DEFAULT_TTL: Duration = Duration::from_secs(3600);

    /// Create an empty tracker with the default limits.
    #[must_use]
    pub fn new() -> Self {
        Self::with_limits(Self::DEFAULT_CAPACITY, Self::DEFAULT_TTL)
    }

    /// Create an empty tracker holding at most `capacity` entries, each for at most `ttl`.
    #[must_use]
    pub fn with_limits(capacity: usize, ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
            ttl,
        }
    }

    /// Remember that `message_id` has been retried `retry` times.
    pub fn record(&self, message_id: &str, retry: u32) {
        let now = Instant::now();
        let mut entries = self.lock();
        entries.retain(|_, tracked| now.saturating_duration_since(tracked.recorded) < self.ttl);

        if !entries.contains_key(message_id) && entries.len() >= self.capacity {
            let oldest = entries
                .iter()
                .min_by_key(|(_, tracked)| tracked.recorded)
                .map(|(id, _)| id.clone());
            if let Some(oldest) = oldest {
                entries.remove(&oldest);
                tracing::debug!(message_id = %oldest, capacity = self.capacity, "Redelivery tracker full, evicted oldest entry");
            }
        }

        entries.insert(
            message_id.to_string(),
            Tracked {
                retry,
                recorded: now,
            },
        );
    }

    /// Retries recorded for `message_id`, unless the entry has expired.
    #[must_use]
    pub fn retries(&self, message_id: &str) -> Option<u32> {
        let now = Instant::now();
        self.lock()
            .get(message_id)
            .filter(|tracked| now.saturating_duration_since(tracked.recorded) < self.ttl)
            .map(|tracked| tracked.retry)
    }

    /// Forget `message_id`.
    pub fn forget(&self, message_id: &str) {
        self.lock().remove(message_id);
    }

    /// Forget everything; returns how many entries were dropped.
    pub fn clear(&self) -> usize {
        let mut entries = self.lock();
        let count = entries.len();
        entries.clear();
        count
    }

    /// Number of messages currently tracked.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether no message is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Stamp `message` with the larger of its own and the tracked retry count.
    fn apply(&self, message: &mut Message) {
        if let Some(tracked) = self.retries(&message.id) {
            message.retry = message.retry.max(tracked);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Tracked>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for RedeliveryTracker {
    fn default() -> Self {
        Self::new()
    }
}

struct RunHandle {
    token: CancellationToken,
    supervisor: JoinHandle<()>,
}

/// Consumes a queue with a pool of workers and dispatches by message type.
///
/// # Example
///
/// ```rust,ignore
/// let consumer = Consumer::new(Arc::clone(&manager), ConsumerConfig::new("checkins"));
/// consumer.register_handler("checkin.performed", Arc::new(MyHandler));
///
/// let shutdown = CancellationToken::new();
/// consumer.start(&shutdown).await?;
/// // ...
/// consumer.stop().await?;
/// ```
pub struct Consumer {
    connection: Arc<ConnectionManager>,
    config: Arc<ConsumerConfig>,
    registry: Arc<HandlerRegistry>,
    tracker: Arc<RedeliveryTracker>,
    state: Arc<watch::Sender<ConsumerState>>,
    run: tokio::sync::Mutex<Option<RunHandle>>,
}

impl Consumer {
    /// Create a stopped consumer with its own empty registry.
    #[must_use]
    pub fn new(connection: Arc<ConnectionManager>, config: ConsumerConfig) -> Self {
        Self::with_registry(connection, config, Arc::new(HandlerRegistry::new()))
    }

    /// Create a stopped consumer dispatching through a shared registry.
    #[must_use]
    pub fn with_registry(
        connection: Arc<ConnectionManager>,
        config: ConsumerConfig,
        registry: Arc<HandlerRegistry>,
    ) -> Self {
        let (state, _) = watch::channel(ConsumerState::Stopped);
        Self {
            connection,
            config: Arc::new(config),
            registry,
            tracker: Arc::new(RedeliveryTracker::new()),
            state: Arc::new(state),
            run: tokio::sync::Mutex::new(None),
        }
    }

    /// The consumer settings.
    #[must_use]
    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    /// The handler registry.
    #[must_use]
    pub const fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    /// Retry counts of messages this consumer has requeued.
    #[must_use]
    pub const fn redeliveries(&self) -> &Arc<RedeliveryTracker> {
        &self.tracker
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConsumerState {
        *self.state.borrow()
    }

    /// Watch lifecycle transitions.
    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<ConsumerState> {
        self.state.subscribe()
    }

    /// Register `handler` for `message_type`. Safe before or during a run.
    ///
    /// Returns the handler that was replaced, if any.
    pub fn register_handler(
        &self,
        message_type: impl Into<String>,
        handler: Arc<dyn MessageHandler>,
    ) -> Option<Arc<dyn MessageHandler>> {
        self.registry.register(message_type, handler)
    }

    /// Remove the handler for `message_type`. Safe before or during a run.
    pub fn unregister_handler(&self, message_type: &str) -> Option<Arc<dyn MessageHandler>> {
        self.registry.unregister(message_type)
    }

    /// Apply QoS and launch the workers.
    ///
    /// The run is bound to a child of `shutdown`: cancelling `shutdown` stops the run just
    /// like [`stop`](Self::stop) does.
    ///
    /// # Errors
    ///
    /// - [`MessagingError::InvalidConfig`] if the consumer settings fail validation
    /// - [`MessagingError::AlreadyRunning`] unless the consumer is stopped
    /// - [`MessagingError::NotConnected`] (or a broker error) if QoS cannot be applied
    pub async fn start(&self, shutdown: &CancellationToken) -> Result<()> {
        if let Err(e) = self.config.validate() {
            tracing::error!(queue = %self.config.queue_name, error = %e, "Refusing to start consumer");
            return Err(e.into());
        }

        let mut run = self.run.lock().await;

        let current = self.state();
        if current != ConsumerState::Stopped {
            tracing::warn!(state = %current, "Refusing to start a consumer that is not stopped");
            return Err(MessagingError::AlreadyRunning);
        }

        self.state.send_replace(ConsumerState::Starting);

        if self.config.prefetch_size != 0 {
            tracing::debug!(
                prefetch_size = self.config.prefetch_size,
                "prefetch_size is passed to the broker as-is; some brokers ignore it"
            );
        }
        if let Err(e) = self
            .connection
            .set_qos(self.config.prefetch_count, self.config.prefetch_size)
            .await
        {
            self.state.send_replace(ConsumerState::Stopped);
            tracing::error!(queue = %self.config.queue_name, error = %e, "Failed to start consumer");
            return Err(e);
        }

        let token = shutdown.child_token();
        let mut workers = JoinSet::new();
        for index in 0..self.config.concurrent_consumers {
            let worker = Worker {
                index,
                consumer_tag: format!("{}-{index}", self.config.consumer_tag),
                connection: Arc::clone(&self.connection),
                config: Arc::clone(&self.config),
                registry: Arc::clone(&self.registry),
                tracker: Arc::clone(&self.tracker),
                token: token.clone(),
            };
            workers.spawn(worker.run());
        }

        self.state.send_replace(ConsumerState::Running);
        tracing::info!(
            queue = %self.config.queue_name,
            workers = self.config.concurrent_consumers,
            prefetch_count = self.config.prefetch_count,
            max_retries = self.config.max_retries,
            auto_ack = self.config.auto_ack,
            "Consumer started"
        );

        let state = Arc::clone(&self.state);
        let queue = self.config.queue_name.clone();
        let supervisor = tokio::spawn(async move {
            while let Some(result) = workers.join_next().await {
                if let Err(e) = result {
                    tracing::error!(queue = %queue, error = %e, "Consumer worker terminated abnormally");
                }
            }
            state.send_replace(ConsumerState::Stopped);
            tracing::info!(queue = %queue, "Consumer stopped");
        });

        *run = Some(RunHandle { token, supervisor });
        Ok(())
    }

    /// Cancel the run and wait for every worker to exit.
    ///
    /// Workers notice cancellation between deliveries. An in-flight handler is not
    /// interrupted; its context is cancelled and the worker waits for it to return.
    ///
    /// # Errors
    ///
    /// Returns [`MessagingError::NotRunning`] unless the consumer is running.
    pub async fn stop(&self) -> Result<()> {
        let mut run = self.run.lock().await;

        if self.state() != ConsumerState::Running {
            return Err(MessagingError::NotRunning);
        }
        let Some(handle) = run.take() else {
            return Err(MessagingError::NotRunning);
        };

        self.state.send_replace(ConsumerState::Stopping);
        tracing::info!(queue = %self.config.queue_name, "Stopping consumer");
        handle.token.cancel();

        if let Err(e) = handle.supervisor.await {
            tracing::error!(error = %e, "Consumer supervisor terminated abnormally");
        }
        let forgotten = self.tracker.clear();
        if forgotten > 0 {
            tracing::debug!(queue = %self.config.queue_name, forgotten, "Cleared redelivery tracker");
        }
        self.state.send_replace(ConsumerState::Stopped);
        Ok(())
    }
}

impl Drop for Consumer {
    fn drop(&mut self) {
        if let Some(handle) = self.run.get_mut().take() {
            handle.token.cancel();
        }
    }
}

impl fmt::Debug for Consumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Consumer")
            .field("queue", &self.config.queue_name)
            .field("state", &self.state())
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

struct Worker {
    index: usize,
    consumer_tag: String,
    connection: Arc<ConnectionManager>,
    config: Arc<ConsumerConfig>,
    registry: Arc<HandlerRegistry>,
    tracker: Arc<RedeliveryTracker>,
    token: CancellationToken,
}

impl Worker {
    async fn run(self) {
        let queue = self.config.queue_name.as_str();
        tracing::debug!(worker = self.index, consumer_tag = %self.consumer_tag, queue, "Worker started");

        while !self.token.is_cancelled() {
            match self
                .connection
                .consume(queue, &self.consumer_tag, self.config.auto_ack)
                .await
            {
                Ok(stream) => {
                    self.pump(stream).await;
                    if self.token.is_cancelled() {
                        break;
                    }
                    let error = MessagingError::ConsumeFailed {
                        queue: queue.to_string(),
                        reason: "delivery stream closed".to_string(),
                    };
                    tracing::warn!(worker = self.index, error = %error, "Delivery stream ended, re-opening");
                }
                Err(e) => {
                    let error = MessagingError::ConsumeFailed {
                        queue: queue.to_string(),
                        reason: e.to_string(),
                    };
                    tracing::warn!(worker = self.index, error = %error, "Could not open delivery stream");
                }
            }

            tokio::select! {
                () = self.token.cancelled() => break,
                () = tokio::time::sleep(self.config.retry_delay) => {}
            }
            ConsumerMetrics::record_stream_reopen();
        }

        tracing::debug!(worker = self.index, queue, "Worker stopped");
    }

    async fn pump(&self, mut stream: DeliveryStream) {
        loop {
            let next = tokio::select! {
                biased;
                () = self.token.cancelled() => return,
                next = stream.next() => next,
            };

            match next {
                Some(Ok(delivery)) => {
                    let outcome = self.process(&delivery).await;
                    self.settle(&delivery, outcome).await;
                    ConsumerMetrics::record_outcome(outcome.as_str());
                }
                Some(Err(e)) => {
                    tracing::warn!(worker = self.index, error = %e, "Delivery stream failed");
                    return;
                }
                None => return,
            }
        }
    }

    async fn process(&self, delivery: &Delivery) -> Outcome {
        let mut message = match Message::from_json(&delivery.body) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(
                    worker = self.index,
                    delivery_tag = delivery.delivery_tag,
                    error = %e,
                    "Rejecting delivery that is not a valid envelope"
                );
                return self.settled_by_broker_or(Outcome::Rejected);
            }
        };

        // Transport headers win over envelope headers.
        message
            .headers
            .extend(delivery.headers.iter().map(|(k, v)| (k.clone(), v.clone())));
        self.tracker.apply(&mut message);

        let Some(handler) = self.registry.get(&message.message_type) else {
            tracing::warn!(
                worker = self.index,
                message_id = %message.id,
                message_type = %message.message_type,
                "No handler registered for message type, rejecting"
            );
            self.tracker.forget(&message.id);
            return self.settled_by_broker_or(Outcome::Rejected);
        };

        let token = self.token.child_token();
        let ctx = ProcessingContext::new(token.clone(), self.config.processing_timeout);
        let started = Instant::now();

        let result = {
            let mut handling = handler.handle(&ctx, &message);
            let first = tokio::time::timeout(self.config.processing_timeout, &mut handling).await;
            match first {
                Ok(result) => result,
                Err(_) => {
                    tracing::warn!(
                        worker = self.index,
                        message_id = %message.id,
                        handler = handler.name(),
                        timeout_ms = self.config.processing_timeout.as_millis(),
                        "Handler exceeded its processing timeout, cancelling"
                    );
                    token.cancel();
                    handling.await
                }
            }
        };

        let elapsed = started.elapsed();
        ConsumerMetrics::record_processing(&message.message_type, elapsed);

        let error = match result {
            Ok(()) => {
                self.tracker.forget(&message.id);
                tracing::debug!(
                    worker = self.index,
                    message_id = %message.id,
                    message_type = %message.message_type,
                    handler = handler.name(),
                    duration_ms = elapsed.as_millis(),
                    "Message handled"
                );
                return self.settled_by_broker_or(Outcome::Acked);
            }
            Err(e) => MessagingError::MessageProcessingFailed {
                message_id: message.id.clone(),
                message_type: message.message_type.clone(),
                reason: e.to_string(),
            },
        };

        if self.config.auto_ack {
            tracing::warn!(worker = self.index, error = %error, "Handler failed in auto-ack mode; message is lost");
            return Outcome::AutoAcked;
        }

        // A shutdown is not the message's fault.
        if self.token.is_cancelled() {
            tracing::info!(
                worker = self.index,
                message_id = %message.id,
                retry = message.retry,
                error = %error,
                "Consumer stopping, requeueing message without spending its retry budget"
            );
            return Outcome::Requeued;
        }

        match decide_failure(message.retry, self.config.max_retries) {
            FailureDecision::Requeue => {
                message.increment_retry();
                self.tracker.record(&message.id, message.retry);
                tracing::warn!(
                    worker = self.index,
                    error = %error,
                    retry = message.retry,
                    max_retries = self.config.max_retries,
                    "Handler failed, requeueing message"
                );
                Outcome::Requeued
            }
            FailureDecision::Drop => {
                self.tracker.forget(&message.id);
                let exhausted = MessagingError::MaxRetriesExceeded {
                    message_id: message.id.clone(),
                    retries: message.retry,
                };
                tracing::error!(
                    worker = self.index,
                    error = %error,
                    reason = %exhausted,
                    "Dropping message"
                );
                Outcome::Dropped
            }
        }
    }

    fn settled_by_broker_or(&self, outcome: Outcome) -> Outcome {
        if self.config.auto_ack {
            Outcome::AutoAcked
        } else {
            outcome
        }
    }

    async fn settle(&self, delivery: &Delivery, outcome: Outcome) {
        let result = match outcome {
            Outcome::Acked => delivery.ack().await,
            Outcome::Requeued => delivery.reject(true).await,
            Outcome::Rejected | Outcome::Dropped => delivery.reject(false).await,
            Outcome::AutoAcked => Ok(()),
        };

        if let Err(e) = result {
            // The broker redelivers unsettled deliveries once the channel is gone.
            tracing::warn!(
                worker = self.index,
                delivery_tag = delivery.delivery_tag,
                outcome = %outcome,
                error = %e,
                "Failed to settle delivery"
            );
        }
    }
}
