//! # Check-in Messaging Testing
//!
//! Testing utilities for the check-in messaging layer.
//!
//! This crate provides:
//! - [`InMemoryBroker`]: a broker transport with AMQP semantics and fault injection
//! - Handlers that record, fail on demand, or stall until cancelled
//! - [`InMemoryCacheInvalidator`]: records evictions
//! - Helpers for polling asynchronous conditions and initialising logs
//! - proptest strategies for envelopes
//!
//! ## Example
//!
//! ```ignore
//! use checkin_messaging_testing::{InMemoryBroker, RecordingHandler};
//! use checkin_messaging_runtime::{ConnectionManager, Consumer};
//!
//! #[tokio::test]
//! async fn consumes_checkins() {
//!     let broker = InMemoryBroker::new();
//!     let manager = Arc::new(ConnectionManager::new(Arc::new(broker.clone()), config));
//!     manager.connect().await.unwrap();
//!
//!     broker.enqueue_message("checkins", &message).unwrap();
//!     // ... start a consumer, assert on the handler
//! }
//! ```

/// In-memory broker with fault injection
pub mod broker;

/// In-memory cache invalidator
pub mod cache;

/// Message handlers for tests
pub mod handlers;

/// Test helpers and utilities.
pub mod helpers {
    use std::future::Future;
    use std::time::Duration;

    /// Poll `condition` every few milliseconds until it holds or `timeout` elapses.
    ///
    /// Returns whether the condition held.
    pub async fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
    where
        F: FnMut() -> bool,
    {
        let poll = async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        };
        tokio::time::timeout(timeout, poll).await.is_ok()
    }

    /// Like [`wait_until`] for conditions that must be awaited.
    pub async fn wait_until_async<F, Fut>(timeout: Duration, mut condition: F) -> bool
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        let poll = async {
            while !condition().await {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        };
        tokio::time::timeout(timeout, poll).await.is_ok()
    }

    /// Install a test log subscriber honouring `RUST_LOG`. Safe to call repeatedly.
    pub fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }
}

/// Property-based testing utilities using proptest.
pub mod properties {
    use checkin_messaging_core::message::Message;
    use checkin_messaging_core::message_types;
    use proptest::prelude::*;
    use serde_json::{Value, json};

    /// A known message type.
    pub fn arb_message_type() -> impl Strategy<Value = String> {
        proptest::sample::select(message_types::KNOWN).prop_map(str::to_string)
    }

    /// A small JSON body.
    pub fn arb_body() -> impl Strategy<Value = Value> {
        (any::<i64>(), "[a-z]{0,12}", any::<bool>())
            .prop_map(|(number, text, flag)| json!({ "n": number, "s": text, "b": flag }))
    }

    /// An envelope with a known type, tenant header and retry counter.
    pub fn arb_message() -> impl Strategy<Value = Message> {
        (arb_message_type(), arb_body(), "[a-z0-9-]{1,16}", 0u32..10).prop_map(
            |(message_type, body, tenant, retry)| {
                let mut message = Message::new(message_type, body);
                message.set_tenant_id(tenant);
                message.retry = retry;
                message
            },
        )
    }
}

pub use broker::{BrokerStats, InMemoryBroker, PublishedMessage};
pub use cache::{InMemoryCacheInvalidator, Invalidation};
pub use handlers::{FailingHandler, RecordingHandler, StallingHandler};
pub use helpers::{init_tracing, wait_until, wait_until_async};
