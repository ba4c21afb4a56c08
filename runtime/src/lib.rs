//! # Check-in Messaging Runtime
//!
//! Reliability layer over a broker client for the check-in service.
//!
//! ## Core Components
//!
//! - **`ConnectionManager`**: owns the connection + channel pair, reconnects with a bounded
//!   budget after an unexpected close, fails fast with `NotConnected` while down
//! - **Publisher**: fixed-delay retry of a single publish, bounded by an overall timeout
//! - **Consumer**: a pool of workers with QoS, handler dispatch by message type and
//!   bounded redelivery through broker requeue
//!
//! Ownership is one-directional: publishers and consumers hold the connection manager,
//! the manager never holds them. Nothing here is a process-wide singleton.
//!
//! ## Example
//!
//! ```ignore
//! use checkin_messaging_runtime::{ConnectionManager, Consumer, Publisher};
//! use checkin_messaging_core::config::MessagingConfig;
//! use std::sync::Arc;
//!
//! let config = MessagingConfig::from_env()?;
//! let manager = Arc::new(ConnectionManager::new(broker, config.connection));
//! manager.connect().await?;
//!
//! let publisher = Publisher::new(Arc::clone(&manager), config.publisher);
//! let consumer = Consumer::new(Arc::clone(&manager), config.consumer);
//! consumer.register_handler("checkin.performed", Arc::new(MyHandler));
//! consumer.start(&shutdown).await?;
//! ```

/// Fixed-delay retry used by the publisher
pub mod retry;

/// Prometheus metrics for observability
pub mod metrics;

/// Broker connection manager with bounded auto-reconnect
pub mod connection;

/// Reliable publisher and typed event wrappers
pub mod publisher;

/// Multi-worker consumer
pub mod consumer;

/// Exchange, queue and binding declarations
pub mod topology;

/// Message handlers shipped with the runtime
pub mod handlers;

pub use connection::{ConnectionManager, ConnectionState};
pub use consumer::{Consumer, ConsumerState, Outcome, RedeliveryTracker};
pub use handlers::{CacheInvalidationHandler, CacheRule};
pub use publisher::{EventOrigin, Publisher};
pub use topology::Topology;
