//! The message envelope that travels over the broker.
//!
//! A [`Message`] is self-describing: it carries its own identity, a dot-namespaced
//! type used for in-process dispatch, an opaque JSON body, a header map for
//! cross-cutting metadata (tenant, user, correlation), its creation time and a retry
//! counter.
//!
//! # Wire Format
//!
//! Messages are serialized as JSON:
//!
//! ```text
//! {
//!   "id": "5b0c…",
//!   "type": "checkin.performed",
//!   "body": { … },
//!   "headers": { "tenant_id": "tenant-a" },
//!   "timestamp": "2025-01-01T00:00:00Z",
//!   "retry": 0
//! }
//! ```
//!
//! The `type` is independent of the broker's own exchange/routing-key mechanism.
//! The routing key is supplied separately by the caller of `Publisher::publish`.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;

use crate::error::MessagingError;

/// Header carrying the tenant the message belongs to.
pub const TENANT_ID_HEADER: &str = "tenant_id";

/// Header carrying the user that caused the message.
pub const USER_ID_HEADER: &str = "user_id";

/// Header carrying the correlation id used for tracing.
pub const CORRELATION_ID_HEADER: &str = "correlation_id";

/// A message envelope.
///
/// # Invariants
///
/// - `id` is assigned once at creation and is stable across redeliveries, so it
///   identifies the logical message for downstream deduplication.
/// - `retry` starts at 0 and only ever grows, by exactly one per requeue-for-retry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Unique identifier of the logical message.
    pub id: String,

    /// Dot-namespaced message type (e.g. `"checkin.performed"`).
    #[serde(rename = "type")]
    pub message_type: String,

    /// Opaque payload. This layer never inspects its structure.
    pub body: Value,

    /// Cross-cutting metadata.
    #[serde(default)]
    pub headers: HashMap<String, Value>,

    /// Creation time, set once.
    pub timestamp: DateTime<Utc>,

    /// Number of times the message has been requeued for retry.
    #[serde(default)]
    pub retry: u32,
}

impl Message {
    /// Create a new message with a fresh id, an empty header map and the current time.
    ///
    /// # Examples
    ///
    /// ```
    /// use checkin_messaging_core::message::Message;
    ///
    /// let message = Message::new("employee.created", serde_json::json!({ "id": 7 }));
    /// assert_eq!(message.retry, 0);
    /// assert!(message.headers.is_empty());
    /// ```
    #[must_use]
    pub fn new(message_type: impl Into<String>, body: Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            message_type: message_type.into(),
            body,
            headers: HashMap::new(),
            timestamp: Utc::now(),
            retry: 0,
        }
    }

    /// Create a message whose body is the JSON form of `payload`.
    ///
    /// # Errors
    ///
    /// Returns [`MessagingError::InvalidMessage`] if `payload` cannot be represented as JSON.
    pub fn from_payload<T: Serialize>(
        message_type: impl Into<String>,
        payload: &T,
    ) -> Result<Self, MessagingError> {
        let body = serde_json::to_value(payload)
            .map_err(|e| MessagingError::InvalidMessage(format!("Failed to encode body: {e}")))?;
        Ok(Self::new(message_type, body))
    }

    /// Decode the body into a concrete type.
    ///
    /// # Errors
    ///
    /// Returns [`MessagingError::InvalidMessage`] if the body does not match `T`.
    pub fn body_as<T: DeserializeOwned>(&self) -> Result<T, MessagingError> {
        serde_json::from_value(self.body.clone()).map_err(|e| {
            MessagingError::InvalidMessage(format!(
                "Body of message {} is not a valid {}: {e}",
                self.id,
                std::any::type_name::<T>()
            ))
        })
    }

    /// Set a header, replacing any previous value under the same key.
    pub fn set_header(&mut self, key: impl Into<String>, value: impl Into<Value>) -> &mut Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Builder-style variant of [`set_header`](Self::set_header).
    #[must_use]
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set_header(key, value);
        self
    }

    /// Get a raw header value.
    #[must_use]
    pub fn header(&self, key: &str) -> Option<&Value> {
        self.headers.get(key)
    }

    /// Get a header decoded into a concrete type.
    ///
    /// Returns `None` when the header is absent or does not decode as `T`.
    #[must_use]
    pub fn header_as<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.headers
            .get(key)
            .and_then(|value| serde_json::from_value(value.clone()).ok())
    }

    fn header_str(&self, key: &str) -> Option<&str> {
        self.headers.get(key).and_then(Value::as_str)
    }

    /// Set the tenant id header.
    pub fn set_tenant_id(&mut self, tenant_id: impl Into<String>) -> &mut Self {
        self.set_header(TENANT_ID_HEADER, tenant_id.into())
    }

    /// The tenant id header, if present and a string.
    #[must_use]
    pub fn tenant_id(&self) -> Option<&str> {
        self.header_str(TENANT_ID_HEADER)
    }

    /// Set the user id header.
    pub fn set_user_id(&mut self, user_id: impl Into<String>) -> &mut Self {
        self.set_header(USER_ID_HEADER, user_id.into())
    }

    /// The user id header, if present and a string.
    #[must_use]
    pub fn user_id(&self) -> Option<&str> {
        self.header_str(USER_ID_HEADER)
    }

    /// Set the correlation id header.
    pub fn set_correlation_id(&mut self, correlation_id: impl Into<String>) -> &mut Self {
        self.set_header(CORRELATION_ID_HEADER, correlation_id.into())
    }

    /// The correlation id header, if present and a string.
    #[must_use]
    pub fn correlation_id(&self) -> Option<&str> {
        self.header_str(CORRELATION_ID_HEADER)
    }

    /// Increment the retry counter in place.
    ///
    /// Returns `self` so redelivery handling can chain further mutations.
    pub const fn increment_retry(&mut self) -> &mut Self {
        self.retry = self.retry.saturating_add(1);
        self
    }

    /// Serialize the envelope to its JSON wire form.
    ///
    /// # Errors
    ///
    /// Returns [`MessagingError::InvalidMessage`] if serialization fails.
    pub fn to_json(&self) -> Result<Vec<u8>, MessagingError> {
        serde_json::to_vec(self)
            .map_err(|e| MessagingError::InvalidMessage(format!("Failed to serialize message: {e}")))
    }

    /// Parse an envelope from its JSON wire form.
    ///
    /// # Errors
    ///
    /// Returns [`MessagingError::InvalidMessage`] if the bytes are not a valid envelope.
    pub fn from_json(bytes: &[u8]) -> Result<Self, MessagingError> {
        serde_json::from_slice(bytes)
            .map_err(|e| MessagingError::InvalidMessage(format!("Failed to parse message: {e}")))
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Message {{ id: {}, type: {}, retry: {} }}",
            self.id, self.message_type, self.retry
        )
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn new_message_has_fresh_identity() {
        let a = Message::new("checkin.performed", json!({}));
        let b = Message::new("checkin.performed", json!({}));

        assert_ne!(a.id, b.id);
        assert_eq!(a.retry, 0);
        assert!(a.headers.is_empty());
    }

    #[test]
    fn named_headers_share_the_header_map() {
        let mut message = Message::new("checkin.performed", json!(null));
        message
            .set_tenant_id("tenant-a")
            .set_user_id("user-1")
            .set_correlation_id("corr-9");

        assert_eq!(message.tenant_id(), Some("tenant-a"));
        assert_eq!(message.user_id(), Some("user-1"));
        assert_eq!(message.correlation_id(), Some("corr-9"));
        assert_eq!(message.header(TENANT_ID_HEADER), Some(&json!("tenant-a")));
        assert_eq!(message.headers.len(), 3);
    }

    #[test]
    fn typed_header_access() {
        let message = Message::new("employee.updated", json!(null))
            .with_header("attempt", 3)
            .with_header("source", "kiosk");

        assert_eq!(message.header_as::<u32>("attempt"), Some(3));
        assert_eq!(message.header_as::<String>("source"), Some("kiosk".to_string()));
        assert_eq!(message.header_as::<u32>("source"), None);
        assert_eq!(message.header_as::<u32>("missing"), None);
    }

    #[test]
    fn non_string_tenant_header_reads_as_none() {
        let message = Message::new("checkin.performed", json!(null)).with_header(TENANT_ID_HEADER, 12);
        assert_eq!(message.tenant_id(), None);
    }

    #[test]
    fn increment_retry_chains() {
        let mut message = Message::new("checkin.performed", json!(null));
        message.increment_retry().increment_retry();
        assert_eq!(message.retry, 2);
    }

    #[test]
    fn wire_format_uses_type_key() {
        let message = Message::new("checkout.performed", json!({ "badge": "A1" }));
        let value: Value = serde_json::from_slice(&message.to_json().unwrap()).unwrap();

        assert_eq!(value["type"], json!("checkout.performed"));
        assert_eq!(value["retry"], json!(0));
        assert!(value["timestamp"].is_string());
        assert!(value.get("message_type").is_none());
    }

    #[test]
    fn from_json_accepts_missing_optional_fields() {
        let raw = br#"{"id":"m-1","type":"tenant.created","body":{"name":"Acme"},"timestamp":"2025-01-01T00:00:00Z"}"#;
        let message = Message::from_json(raw).unwrap();

        assert_eq!(message.id, "m-1");
        assert_eq!(message.retry, 0);
        assert!(message.headers.is_empty());
    }

    #[test]
    fn from_json_rejects_garbage() {
        let err = Message::from_json(b"not json").unwrap_err();
        assert!(matches!(err, MessagingError::InvalidMessage(_)));
    }

    #[test]
    fn body_round_trips_through_payload() {
        #[derive(Debug, PartialEq, Serialize, Deserialize)]
        struct CheckIn {
            employee_id: u64,
            site: String,
        }

        let payload = CheckIn { employee_id: 9, site: "HQ".to_string() };
        let message = Message::from_payload("checkin.performed", &payload).unwrap();
        assert_eq!(message.body_as::<CheckIn>().unwrap(), payload);
        assert!(message.body_as::<Vec<u8>>().is_err());
    }

    proptest! {
        #[test]
        fn json_round_trip_is_lossless(
            message_type in "[a-z]{1,8}\\.[a-z]{1,8}",
            text in ".*",
            number in any::<i64>(),
            headers in proptest::collection::hash_map("[a-z_]{1,12}", ".*", 0..5),
            retry in any::<u32>(),
        ) {
            let mut message = Message::new(message_type, json!({ "text": text, "number": number }));
            for (key, value) in headers {
                message.set_header(key, value);
            }
            message.retry = retry;

            let decoded = Message::from_json(&message.to_json().unwrap()).unwrap();
            prop_assert_eq!(decoded, message);
        }
    }
}
