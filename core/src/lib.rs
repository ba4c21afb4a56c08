//! # Check-in Messaging Core
//!
//! Core types and traits for the check-in service's messaging reliability layer.
//!
//! This crate holds everything that is independent of a concrete broker client:
//!
//! - **Message**: the self-describing envelope that travels over the broker
//! - **MessageHandler** / **HandlerRegistry**: in-process dispatch by message type
//! - **Broker traits**: the seam over the wrapped protocol client
//! - **Configuration**: connection, consumer and publisher settings
//! - **Errors**: the messaging error taxonomy
//!
//! The reliability semantics (reconnect, publish retry, bounded redelivery) live in
//! `checkin-messaging-runtime`; the production AMQP transport lives in
//! `checkin-messaging-amqp`.
//!
//! ## Delivery Guarantees
//!
//! The layer is **at-least-once** end to end. A message may be handled more than once,
//! so handlers must tolerate duplicates (use [`Message::id`](message::Message) to dedup).
//! No ordering is guaranteed across concurrent consumers.
//!
//! ## Example
//!
//! ```
//! use checkin_messaging_core::message::Message;
//! use serde_json::json;
//!
//! let mut message = Message::new("checkin.performed", json!({ "employee_id": 42 }));
//! message.set_tenant_id("tenant-a");
//! message.set_correlation_id("req-123");
//!
//! let bytes = message.to_json().unwrap();
//! let decoded = Message::from_json(&bytes).unwrap();
//! assert_eq!(decoded, message);
//! ```

// Re-export commonly used types
pub use chrono::{DateTime, Utc};
pub use tokio_util::sync::CancellationToken;

/// Broker transport abstraction (connection, channel, deliveries)
pub mod broker;

/// Cache collaborator consumed by message handlers
pub mod cache;

/// Connection, consumer and publisher configuration
pub mod config;

/// Messaging error taxonomy
pub mod error;

/// Message handler capability and processing context
pub mod handler;

/// Message envelope
pub mod message;

/// Known message types of the check-in domain
pub mod message_types;

/// Handler registry keyed by message type
pub mod registry;

pub use error::{MessagingError, Result};
pub use handler::{HandlerError, MessageHandler, ProcessingContext};
pub use message::Message;
pub use registry::HandlerRegistry;
