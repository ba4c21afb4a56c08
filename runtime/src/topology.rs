//! Exchange, queue and binding declarations.
//!
//! A [`Topology`] is plain data. [`Topology::declare`] pushes it to the broker through a
//! [`ConnectionManager`], in dependency order: exchanges, then queues, then bindings.
//! Declarations are idempotent on the broker, so declaring again after a reconnect is
//! harmless.

use crate::connection::ConnectionManager;
use checkin_messaging_core::broker::{ExchangeKind, ExchangeSpec, QueueSpec};
use checkin_messaging_core::error::Result;

/// A queue-to-exchange binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    /// Bound queue
    pub queue: String,
    /// Source exchange
    pub exchange: String,
    /// Routing key or pattern
    pub routing_key: String,
}

/// Broker objects a service expects to exist.
///
/// # Example
///
/// ```
/// use checkin_messaging_runtime::topology::Topology;
/// use checkin_messaging_core::broker::{ExchangeKind, ExchangeSpec, QueueSpec};
///
/// let topology = Topology::new()
///     .exchange(ExchangeSpec::new("checkin.events", ExchangeKind::Topic))
///     .queue(QueueSpec::new("attendance"))
///     .bind("attendance", "checkin.events", "checkin.*");
///
/// assert_eq!(topology.bindings().len(), 1);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Topology {
    exchanges: Vec<ExchangeSpec>,
    queues: Vec<QueueSpec>,
    bindings: Vec<Binding>,
}

impl Topology {
    /// Empty topology.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Topic exchange `exchange` with a durable `queue` receiving every routing key.
    #[must_use]
    pub fn single_queue(exchange: &str, queue: &str) -> Self {
        Self::new()
            .exchange(ExchangeSpec::new(exchange, ExchangeKind::Topic))
            .queue(QueueSpec::new(queue))
            .bind(queue, exchange, "#")
    }

    /// Add an exchange.
    #[must_use]
    pub fn exchange(mut self, spec: ExchangeSpec) -> Self {
        self.exchanges.push(spec);
        self
    }

    /// Add a queue.
    #[must_use]
    pub fn queue(mut self, spec: QueueSpec) -> Self {
        self.queues.push(spec);
        self
    }

    /// Add a binding.
    #[must_use]
    pub fn bind(
        mut self,
        queue: impl Into<String>,
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
    ) -> Self {
        self.bindings.push(Binding {
            queue: queue.into(),
            exchange: exchange.into(),
            routing_key: routing_key.into(),
        });
        self
    }

    /// Declared exchanges.
    #[must_use]
    pub fn exchanges(&self) -> &[ExchangeSpec] {
        &self.exchanges
    }

    /// Declared queues.
    #[must_use]
    pub fn queues(&self) -> &[QueueSpec] {
        &self.queues
    }

    /// Declared bindings.
    #[must_use]
    pub fn bindings(&self) -> &[Binding] {
        &self.bindings
    }

    /// Declare everything through `connection`.
    ///
    /// # Errors
    ///
    /// Stops at the first failing declaration and returns its error
    /// ([`NotConnected`](checkin_messaging_core::MessagingError::NotConnected) while
    /// disconnected).
    pub async fn declare(&self, connection: &ConnectionManager) -> Result<()> {
        for exchange in &self.exchanges {
            connection.declare_exchange(exchange).await?;
        }
        for queue in &self.queues {
            connection.declare_queue(queue).await?;
        }
        for binding in &self.bindings {
            connection
                .bind_queue(&binding.queue, &binding.exchange, &binding.routing_key)
                .await?;
        }

        tracing::info!(
            exchanges = self.exchanges.len(),
            queues = self.queues.len(),
            bindings = self.bindings.len(),
            "Topology declared"
        );
        Ok(())
    }
}
