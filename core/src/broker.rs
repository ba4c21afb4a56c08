//! Broker transport abstraction.
//!
//! The messaging layer does not implement a wire protocol. It wraps an existing protocol
//! client and adds reliability semantics on top. These traits are the seam between the two:
//!
//! ```text
//! ┌───────────────────────┐
//! │ Publisher / Consumer  │  reliability semantics
//! └──────────┬────────────┘
//!            │
//!            ▼
//! ┌───────────────────────┐
//! │  ConnectionManager    │  reconnect, connectivity gating
//! └──────────┬────────────┘
//!            │  Broker → BrokerConnection → BrokerChannel
//!            ▼
//! ┌───────────────────────┐
//! │ protocol client       │  AMQP (lapin) in production,
//! │                       │  in-memory broker in tests
//! └───────────────────────┘
//! ```
//!
//! # Dyn Compatibility
//!
//! All traits return `Pin<Box<dyn Future>>` instead of using `async fn` so they can be
//! used as trait objects (`Arc<dyn Broker>`). The connection manager swaps the live
//! connection at runtime and needs type-erased handles to do so.

use crate::config::ConnectionConfig;
use futures::Stream;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;

/// Boxed future returned by the broker traits.
pub type BrokerFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, BrokerError>> + Send + 'a>>;

/// Stream of raw deliveries from a queue.
///
/// The stream ends when the consumer is cancelled or the underlying channel closes.
pub type DeliveryStream = Pin<Box<dyn Stream<Item = Result<Delivery, BrokerError>> + Send>>;

/// Errors reported by a broker client.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// Could not dial the broker or the handshake failed
    #[error("Broker connection failed: {0}")]
    ConnectionFailed(String),

    /// The channel or its connection is closed
    #[error("Broker channel closed: {0}")]
    ChannelClosed(String),

    /// The broker rejected or failed an operation
    #[error("Broker operation '{operation}' failed: {reason}")]
    Operation {
        /// The operation that failed (e.g. "basic.publish")
        operation: String,
        /// The reason for failure
        reason: String,
    },
}

impl BrokerError {
    /// Build an [`Operation`](Self::Operation) error.
    #[must_use]
    pub fn operation(operation: impl Into<String>, reason: impl fmt::Display) -> Self {
        Self::Operation {
            operation: operation.into(),
            reason: reason.to_string(),
        }
    }
}

/// Exchange kinds understood by the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExchangeKind {
    /// Exact routing-key match
    Direct,
    /// Pattern routing-key match (`*` one word, `#` zero or more words)
    #[default]
    Topic,
    /// Broadcast to every bound queue
    Fanout,
    /// Match on message headers
    Headers,
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Direct => write!(f, "direct"),
            Self::Topic => write!(f, "topic"),
            Self::Fanout => write!(f, "fanout"),
            Self::Headers => write!(f, "headers"),
        }
    }
}

/// Exchange declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeSpec {
    /// Exchange name
    pub name: String,
    /// Exchange kind
    pub kind: ExchangeKind,
    /// Survives broker restarts
    pub durable: bool,
    /// Deleted when the last queue unbinds
    pub auto_delete: bool,
}

impl ExchangeSpec {
    /// A durable, non-auto-delete exchange of the given kind.
    #[must_use]
    pub fn new(name: impl Into<String>, kind: ExchangeKind) -> Self {
        Self {
            name: name.into(),
            kind,
            durable: true,
            auto_delete: false,
        }
    }
}

/// Queue declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    /// Queue name
    pub name: String,
    /// Survives broker restarts
    pub durable: bool,
    /// Used by only one connection and deleted when it closes
    pub exclusive: bool,
    /// Deleted when the last consumer unsubscribes
    pub auto_delete: bool,
    /// Exchange the broker dead-letters rejected messages to.
    ///
    /// Only declared. The consumer itself never routes to it.
    pub dead_letter_exchange: Option<String>,
}

impl QueueSpec {
    /// A durable, shared, persistent queue.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: true,
            exclusive: false,
            auto_delete: false,
            dead_letter_exchange: None,
        }
    }

    /// Set the dead-letter exchange argument.
    #[must_use]
    pub fn with_dead_letter_exchange(mut self, exchange: impl Into<String>) -> Self {
        self.dead_letter_exchange = Some(exchange.into());
        self
    }
}

/// Transport-level properties attached to a publish.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PublishProperties {
    /// Message id (mirrors the envelope id)
    pub message_id: Option<String>,
    /// Message type (mirrors the envelope type)
    pub message_type: Option<String>,
    /// MIME content type of the payload
    pub content_type: Option<String>,
    /// Persist the message on the broker
    pub persistent: bool,
    /// Transport headers
    pub headers: HashMap<String, Value>,
}

/// Acknowledgement capability for a single delivery.
pub trait Acknowledger: Send + Sync {
    /// Acknowledge the delivery.
    fn ack(&self) -> BrokerFuture<'_, ()>;

    /// Reject the delivery, optionally asking the broker to requeue it.
    fn reject(&self, requeue: bool) -> BrokerFuture<'_, ()>;
}

/// A raw delivery from the broker.
pub struct Delivery {
    /// Channel-scoped delivery tag
    pub delivery_tag: u64,
    /// Raw payload bytes
    pub body: Vec<u8>,
    /// Transport headers
    pub headers: HashMap<String, Value>,
    /// Whether the broker has delivered this message before
    pub redelivered: bool,
    /// Acknowledgement handle
    pub acker: Box<dyn Acknowledger>,
}

impl Delivery {
    /// Acknowledge this delivery.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError`] if the channel is gone or the broker refuses the ack.
    pub async fn ack(&self) -> Result<(), BrokerError> {
        self.acker.ack().await
    }

    /// Reject this delivery.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError`] if the channel is gone or the broker refuses the reject.
    pub async fn reject(&self, requeue: bool) -> Result<(), BrokerError> {
        self.acker.reject(requeue).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("body_len", &self.body.len())
            .field("headers", &self.headers)
            .field("redelivered", &self.redelivered)
            .finish_non_exhaustive()
    }
}

/// Why a connection closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    /// Human-readable reason
    pub reason: String,
    /// Whether the close was requested by this process
    pub initiated_locally: bool,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.initiated_locally {
            write!(f, "closed locally: {}", self.reason)
        } else {
            write!(f, "{}", self.reason)
        }
    }
}

/// Entry point of a broker client: dials connections.
pub trait Broker: Send + Sync {
    /// Dial the broker described by `config`.
    fn connect<'a>(&'a self, config: &'a ConnectionConfig) -> BrokerFuture<'a, Arc<dyn BrokerConnection>>;
}

/// A live connection to the broker.
pub trait BrokerConnection: Send + Sync {
    /// Open a new channel on this connection.
    fn open_channel(&self) -> BrokerFuture<'_, Arc<dyn BrokerChannel>>;

    /// A future that resolves once the connection has closed, for any reason.
    ///
    /// The future does not borrow the connection, so a watcher task can await it
    /// without keeping anything else alive.
    fn closed(&self) -> Pin<Box<dyn Future<Output = CloseReason> + Send + 'static>>;

    /// Whether the connection is currently open.
    fn is_open(&self) -> bool;

    /// Close the connection.
    fn close(&self) -> BrokerFuture<'_, ()>;
}

/// A channel multiplexed over a connection.
pub trait BrokerChannel: Send + Sync {
    /// Declare an exchange.
    fn declare_exchange<'a>(&'a self, spec: &'a ExchangeSpec) -> BrokerFuture<'a, ()>;

    /// Declare a queue.
    fn declare_queue<'a>(&'a self, spec: &'a QueueSpec) -> BrokerFuture<'a, ()>;

    /// Bind a queue to an exchange with a routing key (or pattern).
    fn bind_queue<'a>(
        &'a self,
        queue: &'a str,
        exchange: &'a str,
        routing_key: &'a str,
    ) -> BrokerFuture<'a, ()>;

    /// Publish a payload to an exchange.
    fn publish<'a>(
        &'a self,
        exchange: &'a str,
        routing_key: &'a str,
        payload: &'a [u8],
        properties: &'a PublishProperties,
    ) -> BrokerFuture<'a, ()>;

    /// Limit unacknowledged deliveries pushed to this channel.
    fn qos(&self, prefetch_count: u16, prefetch_size: u32) -> BrokerFuture<'_, ()>;

    /// Start consuming a queue.
    fn consume<'a>(
        &'a self,
        queue: &'a str,
        consumer_tag: &'a str,
        auto_ack: bool,
    ) -> BrokerFuture<'a, DeliveryStream>;

    /// Close the channel.
    fn close(&self) -> BrokerFuture<'_, ()>;
}
