//! Reliable publisher.
//!
//! A single logical publish is retried against transient failures: up to
//! `max_retries + 1` attempts with a fixed `retry_delay` between them, the whole sequence
//! bounded by `default_timeout`.
//!
//! There is no idempotency. An attempt the broker accepted but whose confirmation the
//! client never saw is retried, so downstream consumers see duplicates. The layer is
//! at-least-once end to end.

use crate::connection::ConnectionManager;
use crate::metrics::PublisherMetrics;
use crate::retry::{RetryError, RetryPolicy, retry_with_predicate};
use checkin_messaging_core::broker::PublishProperties;
use checkin_messaging_core::config::PublisherConfig;
use checkin_messaging_core::error::{MessagingError, Result};
use checkin_messaging_core::message::Message;
use checkin_messaging_core::message_types;
use serde::Serialize;
use serde_json::{Value, json};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

/// Who an event is published on behalf of.
///
/// Travels as envelope headers, never inside the body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventOrigin {
    /// Tenant the event belongs to
    pub tenant_id: String,
    /// Acting user, if any
    pub user_id: Option<String>,
    /// Correlation id for tracing
    pub correlation_id: Option<String>,
}

impl EventOrigin {
    /// Origin scoped to a tenant.
    #[must_use]
    pub fn tenant(tenant_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            ..Self::default()
        }
    }

    /// Set the acting user.
    #[must_use]
    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Set the correlation id.
    #[must_use]
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    fn stamp(&self, message: &mut Message) {
        message.set_tenant_id(self.tenant_id.as_str());
        if let Some(user_id) = &self.user_id {
            message.set_user_id(user_id.as_str());
        }
        if let Some(correlation_id) = &self.correlation_id {
            message.set_correlation_id(correlation_id.as_str());
        }
    }
}

/// Publishes messages through a [`ConnectionManager`].
///
/// # Example
///
/// ```rust,ignore
/// let publisher = Publisher::new(Arc::clone(&manager), PublisherConfig::default());
///
/// let message = Message::new("checkin.performed", json!({ "employee_id": 42 }));
/// publisher.publish("checkin.events", "checkin.performed", &message).await?;
/// ```
#[derive(Debug, Clone)]
pub struct Publisher {
    connection: Arc<ConnectionManager>,
    config: PublisherConfig,
}

impl Publisher {
    /// Create a publisher over `connection`.
    #[must_use]
    pub const fn new(connection: Arc<ConnectionManager>, config: PublisherConfig) -> Self {
        Self { connection, config }
    }

    /// The publisher settings.
    #[must_use]
    pub const fn config(&self) -> &PublisherConfig {
        &self.config
    }

    /// Publish `message` to `exchange` with `routing_key`.
    ///
    /// The message type is independent of `routing_key`; the typed wrappers happen to use
    /// one as the other.
    ///
    /// # Errors
    ///
    /// - [`MessagingError::InvalidMessage`] if the envelope cannot be encoded (not retried)
    /// - [`MessagingError::PublishFailed`] once the attempts are used up or the overall
    ///   timeout elapses; its source is the last error seen, so a publish made while
    ///   disconnected still satisfies [`MessagingError::is_not_connected`]
    pub async fn publish(&self, exchange: &str, routing_key: &str, message: &Message) -> Result<()> {
        let payload = message.to_json()?;
        let properties = PublishProperties {
            message_id: Some(message.id.clone()),
            message_type: Some(message.message_type.clone()),
            content_type: Some("application/json".to_string()),
            persistent: true,
            headers: message.headers.clone(),
        };
        let policy = RetryPolicy::builder()
            .max_retries(self.config.max_retries)
            .delay(self.config.retry_delay)
            .build();

        let last_error: Mutex<Option<MessagingError>> = Mutex::new(None);
        let attempts = AtomicU32::new(0);
        let started = Instant::now();

        let connection = &self.connection;
        let payload = payload.as_slice();
        let properties = &properties;
        let last_error_ref = &last_error;
        let attempts_ref = &attempts;

        let sequence = retry_with_predicate(
            &policy,
            move |attempt| async move {
                attempts_ref.store(attempt, Ordering::Relaxed);
                let result = connection
                    .publish(exchange, routing_key, payload, properties)
                    .await;
                if let Err(e) = &result {
                    *last_error_ref.lock().unwrap_or_else(PoisonError::into_inner) = Some(e.clone());
                }
                result
            },
            MessagingError::is_transient,
        );

        let failure = match tokio::time::timeout(self.config.default_timeout, sequence).await {
            Ok(Ok(())) => {
                let elapsed = started.elapsed();
                tracing::debug!(
                    message_id = %message.id,
                    message_type = %message.message_type,
                    exchange,
                    routing_key,
                    attempts = attempts.load(Ordering::Relaxed),
                    duration_ms = elapsed.as_millis(),
                    "Message published"
                );
                PublisherMetrics::record_publish(elapsed);
                return Ok(());
            }
            Ok(Err(RetryError {
                attempts,
                last_error,
            })) => (attempts, last_error),
            Err(_) => {
                let last = last_error
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .take()
                    .unwrap_or(MessagingError::Timeout);
                tracing::warn!(
                    timeout_ms = self.config.default_timeout.as_millis(),
                    "Publish deadline elapsed before the retry budget was used up"
                );
                (attempts.load(Ordering::Relaxed), last)
            }
        };

        let (attempts, source) = failure;
        let error = MessagingError::PublishFailed {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            attempts,
            source: Box::new(source),
        };
        tracing::error!(
            message_id = %message.id,
            message_type = %message.message_type,
            error = %error,
            "Publish failed"
        );
        PublisherMetrics::record_failure();
        Err(error)
    }

    /// Publish a `checkin.performed` event to the default exchange.
    ///
    /// Returns the published envelope.
    ///
    /// # Errors
    ///
    /// See [`publish`](Self::publish).
    pub async fn publish_checkin_event<T: Serialize + Sync>(
        &self,
        origin: &EventOrigin,
        event: &T,
    ) -> Result<Message> {
        self.publish_typed(message_types::CHECKIN_PERFORMED, origin, to_body(event)?)
            .await
    }

    /// Publish a `checkout.performed` event to the default exchange.
    ///
    /// # Errors
    ///
    /// See [`publish`](Self::publish).
    pub async fn publish_checkout_event<T: Serialize + Sync>(
        &self,
        origin: &EventOrigin,
        event: &T,
    ) -> Result<Message> {
        self.publish_typed(message_types::CHECKOUT_PERFORMED, origin, to_body(event)?)
            .await
    }

    /// Publish an `employee.<action>` event to the default exchange.
    ///
    /// `action` is one of `created`, `updated`, `deleted`.
    ///
    /// # Errors
    ///
    /// Returns [`MessagingError::InvalidMessage`] for any other action, otherwise see
    /// [`publish`](Self::publish).
    pub async fn publish_employee_event<T: Serialize + Sync>(
        &self,
        origin: &EventOrigin,
        action: &str,
        event: &T,
    ) -> Result<Message> {
        let message_type = message_types::employee_event(action).ok_or_else(|| {
            MessagingError::InvalidMessage(format!("unknown employee action '{action}'"))
        })?;
        self.publish_typed(message_type, origin, to_body(event)?).await
    }

    /// Ask every consumer of the default exchange to evict `pattern` from `cache_name`.
    ///
    /// # Errors
    ///
    /// See [`publish`](Self::publish).
    pub async fn publish_cache_invalidation(
        &self,
        origin: &EventOrigin,
        cache_name: &str,
        pattern: &str,
    ) -> Result<Message> {
        let body = json!({ "cache": cache_name, "pattern": pattern });
        self.publish_typed(message_types::CACHE_INVALIDATE, origin, body)
            .await
    }

    async fn publish_typed(
        &self,
        message_type: &str,
        origin: &EventOrigin,
        body: Value,
    ) -> Result<Message> {
        let mut message = Message::new(message_type, body);
        origin.stamp(&mut message);
        self.publish(&self.config.default_exchange, message_type, &message)
            .await?;
        Ok(message)
    }
}

fn to_body<T: Serialize>(event: &T) -> Result<Value> {
    serde_json::to_value(event)
        .map_err(|e| MessagingError::InvalidMessage(format!("Failed to encode body: {e}")))
}
