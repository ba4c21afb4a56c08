//! Broker connection manager with bounded auto-reconnect.
//!
//! The [`ConnectionManager`] owns the single connection + channel pair to the broker and
//! recovers from unexpected disconnection without caller intervention.
//!
//! # State Machine
//!
//! ```text
//!                connect()
//! Disconnected ───────────► Connecting ──ok──► Connected
//!      ▲                        │                  │
//!      │                       err            unexpected close
//!      │                        │                  ▼
//!      ├────────────────────────┘             Reconnecting ──ok──► Connected
//!      │                                           │
//!      └──────────── attempts exhausted ───────────┘
//!
//! close() from any state ──► Closed (terminal)
//! ```
//!
//! # Concurrency
//!
//! A single read/write lock guards the connection + channel pair together with the state.
//! Declare/publish/consume operations take it in read mode and never block each other;
//! only a (re)connect takes it in write mode, so no operation can observe a half-swapped
//! channel mid-reconnect.
//!
//! # Ownership
//!
//! The reconnect watcher holds only a weak reference to the manager's internals and no
//! reference at all to anything built on top (publishers, consumers). Ownership is
//! strictly one-directional: consumers and publishers hold the manager, never the reverse.

use crate::metrics::ConnectionMetrics;
use checkin_messaging_core::broker::{
    Broker, BrokerChannel, BrokerConnection, CloseReason, DeliveryStream, ExchangeSpec,
    PublishProperties, QueueSpec,
};
use checkin_messaging_core::config::ConnectionConfig;
use checkin_messaging_core::error::{MessagingError, Result};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::RwLock;

/// Connectivity state of a [`ConnectionManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No live connection
    Disconnected,
    /// Initial dial in progress
    Connecting,
    /// Connection and channel are live
    Connected,
    /// The connection dropped and the reconnect loop is running
    Reconnecting,
    /// Closed explicitly; terminal
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Reconnecting => write!(f, "reconnecting"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Qos {
    prefetch_count: u16,
    prefetch_size: u32,
}

struct Link {
    connection: Arc<dyn BrokerConnection>,
    channel: Arc<dyn BrokerChannel>,
}

struct Inner {
    state: ConnectionState,
    link: Option<Link>,
    /// Bumped on every successful (re)connect so stale watchers can tell they are stale
    generation: u64,
    /// Re-applied to every fresh channel
    qos: Option<Qos>,
}

impl Inner {
    fn channel(&self) -> Result<&Arc<dyn BrokerChannel>> {
        match (self.state, &self.link) {
            (ConnectionState::Connected, Some(link)) => Ok(&link.channel),
            (ConnectionState::Closed, _) => Err(MessagingError::Closed),
            _ => Err(MessagingError::NotConnected),
        }
    }
}

struct Shared {
    broker: Arc<dyn Broker>,
    config: ConnectionConfig,
    inner: RwLock<Inner>,
    /// Set before any resource is released by `close`; checked by the watcher
    closed: AtomicBool,
}

/// Owner of the broker connection + channel pair.
///
/// # Example
///
/// ```rust,ignore
/// use checkin_messaging_runtime::ConnectionManager;
/// use checkin_messaging_core::config::ConnectionConfig;
/// use std::sync::Arc;
///
/// let manager = Arc::new(ConnectionManager::new(broker, ConnectionConfig::default()));
/// manager.connect().await?;
///
/// // Pass the manager to publishers and consumers explicitly
/// let publisher = Publisher::new(Arc::clone(&manager), PublisherConfig::default());
/// ```
pub struct ConnectionManager {
    shared: Arc<Shared>,
}

impl ConnectionManager {
    /// Create a disconnected manager. Nothing is dialed until [`connect`](Self::connect).
    #[must_use]
    pub fn new(broker: Arc<dyn Broker>, config: ConnectionConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                broker,
                config,
                inner: RwLock::new(Inner {
                    state: ConnectionState::Disconnected,
                    link: None,
                    generation: 0,
                    qos: None,
                }),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// The connection settings.
    #[must_use]
    pub fn config(&self) -> &ConnectionConfig {
        &self.shared.config
    }

    /// Dial the broker and open a channel.
    ///
    /// Idempotent: returns immediately if already connected. On success a background
    /// watcher subscribes to the connection's close notification and drives the bounded
    /// reconnect loop if the connection drops unexpectedly.
    ///
    /// # Errors
    ///
    /// - [`MessagingError::Closed`] if the manager was closed
    /// - [`MessagingError::ConnectionFailed`] if dialing, opening the channel or applying
    ///   QoS fails
    pub async fn connect(&self) -> Result<()> {
        self.shared.connect().await
    }

    /// Current connectivity state.
    pub async fn state(&self) -> ConnectionState {
        self.shared.inner.read().await.state
    }

    /// Whether the connection and channel are live.
    pub async fn is_connected(&self) -> bool {
        self.state().await == ConnectionState::Connected
    }

    /// Whether [`close`](Self::close) has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Close the connection permanently.
    ///
    /// The terminal flag is set before any resource is released, so the watcher never
    /// attempts a reconnect afterwards. Calling `close` twice is harmless.
    ///
    /// # Errors
    ///
    /// Returns [`MessagingError::Broker`] if the broker reports an error while closing the
    /// connection. The manager is closed regardless.
    pub async fn close(&self) -> Result<()> {
        self.shared.closed.store(true, Ordering::Release);

        let link = {
            let mut inner = self.shared.inner.write().await;
            inner.state = ConnectionState::Closed;
            inner.link.take()
        };

        let Some(link) = link else {
            return Ok(());
        };

        if let Err(e) = link.channel.close().await {
            tracing::debug!(error = %e, "Channel close reported an error");
        }
        link.connection.close().await?;

        tracing::info!(
            connection_name = %self.shared.config.connection_name,
            "Broker connection closed"
        );
        Ok(())
    }

    /// Declare an exchange.
    ///
    /// # Errors
    ///
    /// Returns [`MessagingError::NotConnected`] while disconnected, or the broker's error.
    pub async fn declare_exchange(&self, spec: &ExchangeSpec) -> Result<()> {
        let inner = self.shared.inner.read().await;
        inner.channel()?.declare_exchange(spec).await?;
        tracing::debug!(exchange = %spec.name, kind = %spec.kind, "Exchange declared");
        Ok(())
    }

    /// Declare a queue.
    ///
    /// # Errors
    ///
    /// Returns [`MessagingError::NotConnected`] while disconnected, or the broker's error.
    pub async fn declare_queue(&self, spec: &QueueSpec) -> Result<()> {
        let inner = self.shared.inner.read().await;
        inner.channel()?.declare_queue(spec).await?;
        tracing::debug!(queue = %spec.name, durable = spec.durable, "Queue declared");
        Ok(())
    }

    /// Bind a queue to an exchange.
    ///
    /// # Errors
    ///
    /// Returns [`MessagingError::NotConnected`] while disconnected, or the broker's error.
    pub async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        let inner = self.shared.inner.read().await;
        inner.channel()?.bind_queue(queue, exchange, routing_key).await?;
        tracing::debug!(queue, exchange, routing_key, "Queue bound");
        Ok(())
    }

    /// Publish a raw payload.
    ///
    /// This is a single attempt. Retrying is the publisher's job.
    ///
    /// # Errors
    ///
    /// Returns [`MessagingError::NotConnected`] while disconnected, or the broker's error.
    pub async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: &PublishProperties,
    ) -> Result<()> {
        let inner = self.shared.inner.read().await;
        inner
            .channel()?
            .publish(exchange, routing_key, payload, properties)
            .await?;
        Ok(())
    }

    /// Open a delivery stream on a queue.
    ///
    /// The stream outlives the read lock. It ends when the channel it was opened on closes,
    /// which is how consumers notice a reconnect and re-open on the fresh channel.
    ///
    /// # Errors
    ///
    /// Returns [`MessagingError::NotConnected`] while disconnected, or the broker's error.
    pub async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        auto_ack: bool,
    ) -> Result<DeliveryStream> {
        let inner = self.shared.inner.read().await;
        let stream = inner.channel()?.consume(queue, consumer_tag, auto_ack).await?;
        Ok(stream)
    }

    /// Set channel QoS (prefetch).
    ///
    /// The setting is remembered and re-applied to the fresh channel after every reconnect.
    ///
    /// # Errors
    ///
    /// Returns [`MessagingError::NotConnected`] while disconnected, or the broker's error.
    pub async fn set_qos(&self, prefetch_count: u16, prefetch_size: u32) -> Result<()> {
        let mut inner = self.shared.inner.write().await;
        inner.channel()?.qos(prefetch_count, prefetch_size).await?;
        inner.qos = Some(Qos {
            prefetch_count,
            prefetch_size,
        });
        tracing::debug!(prefetch_count, prefetch_size, "Channel QoS applied");
        Ok(())
    }
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("connection_name", &self.shared.config.connection_name)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl Shared {
    async fn connect(self: &Arc<Self>) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(MessagingError::Closed);
        }

        let mut inner = self.inner.write().await;
        if self.closed.load(Ordering::Acquire) {
            return Err(MessagingError::Closed);
        }

        if inner.state == ConnectionState::Connected
            && inner.link.as_ref().is_some_and(|link| link.connection.is_open())
        {
            return Ok(());
        }

        let reconnecting = inner.state == ConnectionState::Reconnecting;
        if !reconnecting {
            inner.state = ConnectionState::Connecting;
        }

        match self.dial(inner.qos).await {
            Ok((connection, channel)) => {
                inner.generation += 1;
                let generation = inner.generation;
                let closed = connection.closed();
                inner.link = Some(Link {
                    connection,
                    channel,
                });
                inner.state = ConnectionState::Connected;
                drop(inner);

                tokio::spawn(watch_connection(Arc::downgrade(self), closed, generation));

                tracing::info!(
                    host = %self.config.host,
                    port = self.config.port,
                    vhost = %self.config.vhost,
                    connection_name = %self.config.connection_name,
                    generation,
                    "Connected to message broker"
                );
                ConnectionMetrics::record_established();
                Ok(())
            }
            Err(e) => {
                if !reconnecting {
                    inner.state = ConnectionState::Disconnected;
                }
                tracing::warn!(
                    host = %self.config.host,
                    port = self.config.port,
                    error = %e,
                    "Failed to connect to message broker"
                );
                Err(e)
            }
        }
    }

    async fn dial(
        &self,
        qos: Option<Qos>,
    ) -> Result<(Arc<dyn BrokerConnection>, Arc<dyn BrokerChannel>)> {
        let timeout = self.config.connection_timeout;
        let connection = tokio::time::timeout(timeout, self.broker.connect(&self.config))
            .await
            .map_err(|_| {
                MessagingError::ConnectionFailed(format!(
                    "dial timed out after {}ms",
                    timeout.as_millis()
                ))
            })?
            .map_err(|e| MessagingError::ConnectionFailed(e.to_string()))?;

        let channel = match connection.open_channel().await {
            Ok(channel) => channel,
            Err(e) => {
                let _ = connection.close().await;
                return Err(MessagingError::ConnectionFailed(format!(
                    "failed to open channel: {e}"
                )));
            }
        };

        if let Some(qos) = qos {
            if let Err(e) = channel.qos(qos.prefetch_count, qos.prefetch_size).await {
                let _ = connection.close().await;
                return Err(MessagingError::ConnectionFailed(format!(
                    "failed to re-apply QoS: {e}"
                )));
            }
        }

        Ok((connection, channel))
    }

    /// Bounded reconnect loop.
    ///
    /// Boxed because it re-enters `connect`, which spawns the watcher that calls back here.
    fn reconnect(self: Arc<Self>) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(async move {
            let max_retries = self.config.max_retries;

            for attempt in 1..=max_retries {
                tokio::time::sleep(self.config.retry_delay).await;
                if self.closed.load(Ordering::Acquire) {
                    tracing::debug!("Connection manager closed, abandoning reconnect");
                    return;
                }

                ConnectionMetrics::record_reconnect_attempt();
                match self.connect().await {
                    Ok(()) => {
                        tracing::info!(attempt, max_retries, "Reconnected to message broker");
                        return;
                    }
                    Err(MessagingError::Closed) => return,
                    Err(e) => {
                        tracing::warn!(
                            attempt,
                            max_retries,
                            retry_delay_ms = self.config.retry_delay.as_millis(),
                            error = %e,
                            "Reconnect attempt failed"
                        );
                    }
                }
            }

            let mut inner = self.inner.write().await;
            if inner.state == ConnectionState::Reconnecting {
                inner.state = ConnectionState::Disconnected;
            }
            drop(inner);

            tracing::error!(
                max_retries,
                "Giving up reconnecting to message broker; connection stays down until connect() succeeds"
            );
            ConnectionMetrics::record_reconnect_exhausted();
        })
    }
}

async fn watch_connection(
    shared: Weak<Shared>,
    closed: Pin<Box<dyn Future<Output = CloseReason> + Send>>,
    generation: u64,
) {
    let reason = closed.await;

    let Some(shared) = shared.upgrade() else {
        return;
    };
    if shared.closed.load(Ordering::Acquire) || reason.initiated_locally {
        tracing::debug!(%reason, "Broker connection closed, not reconnecting");
        return;
    }

    {
        let mut inner = shared.inner.write().await;
        if inner.generation != generation || shared.closed.load(Ordering::Acquire) {
            // Someone already replaced this connection, or close() raced us.
            return;
        }
        inner.link = None;
        inner.state = ConnectionState::Reconnecting;
    }

    tracing::warn!(
        %reason,
        max_retries = shared.config.max_retries,
        retry_delay_ms = shared.config.retry_delay.as_millis(),
        "Broker connection lost, reconnecting"
    );
    ConnectionMetrics::record_drop();

    shared.reconnect().await;
}
