//! Handler registry keyed by message type.
//!
//! The registry is an open, runtime-extensible map from message type to handler. It has
//! its own lock, independent of the connection manager's, and may be mutated while a
//! consumer is running: every lookup observes the latest committed registration.
//!
//! Registration is last-write-wins. Registering a second handler under the same type
//! replaces the first; handlers never accumulate.

use crate::handler::MessageHandler;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;

/// Errors from registry validation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// Handlers are registered under types missing from the known table
    #[error("Handlers registered for unknown message types: {0:?}")]
    UnknownTypes(Vec<String>),
}

/// Thread-safe map from message type to handler.
///
/// # Example
///
/// ```
/// use checkin_messaging_core::registry::HandlerRegistry;
///
/// let registry = HandlerRegistry::new();
/// assert!(registry.get("checkin.performed").is_none());
/// assert!(registry.is_empty());
/// ```
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn MessageHandler>>>,
}

impl HandlerRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `message_type`, replacing any previous registration.
    ///
    /// Returns the handler that was replaced, if any.
    pub fn register(
        &self,
        message_type: impl Into<String>,
        handler: Arc<dyn MessageHandler>,
    ) -> Option<Arc<dyn MessageHandler>> {
        let message_type = message_type.into();
        tracing::debug!(
            message_type = %message_type,
            handler = handler.name(),
            "Registering message handler"
        );
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(message_type, handler)
    }

    /// Remove the handler for `message_type`.
    ///
    /// Returns the removed handler, if any.
    pub fn unregister(&self, message_type: &str) -> Option<Arc<dyn MessageHandler>> {
        let removed = self
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(message_type);
        if removed.is_some() {
            tracing::debug!(message_type = %message_type, "Unregistered message handler");
        }
        removed
    }

    /// Look up the handler for `message_type`.
    #[must_use]
    pub fn get(&self, message_type: &str) -> Option<Arc<dyn MessageHandler>> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(message_type)
            .cloned()
    }

    /// Whether a handler is registered for `message_type`.
    #[must_use]
    pub fn contains(&self, message_type: &str) -> bool {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(message_type)
    }

    /// All registered message types, sorted.
    #[must_use]
    pub fn registered_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        types.sort();
        types
    }

    /// Number of registrations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Check every registered type against a table of known types.
    ///
    /// Intended to run once at startup, to catch typos in registration strings that would
    /// otherwise surface as silently rejected deliveries.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::UnknownTypes`] listing every registered type not in `known`.
    pub fn validate_against(&self, known: &[&str]) -> Result<(), RegistryError> {
        let unknown: Vec<String> = self
            .registered_types()
            .into_iter()
            .filter(|message_type| !known.contains(&message_type.as_str()))
            .collect();

        if unknown.is_empty() {
            Ok(())
        } else {
            Err(RegistryError::UnknownTypes(unknown))
        }
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("types", &self.registered_types())
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::handler::{HandlerError, ProcessingContext};
    use crate::message::Message;
    use async_trait::async_trait;

    struct Named(&'static str);

    #[async_trait]
    impl MessageHandler for Named {
        async fn handle(&self, _ctx: &ProcessingContext, _message: &Message) -> Result<(), HandlerError> {
            Ok(())
        }

        fn can_handle(&self, _message_type: &str) -> bool {
            true
        }

        fn name(&self) -> &str {
            self.0
        }
    }

    #[test]
    fn last_registration_wins() {
        let registry = HandlerRegistry::new();
        assert!(registry.register("checkin.performed", Arc::new(Named("first"))).is_none());

        let replaced = registry.register("checkin.performed", Arc::new(Named("second")));
        assert_eq!(replaced.map(|h| h.name().to_string()), Some("first".to_string()));

        let active = registry.get("checkin.performed").map(|h| h.name().to_string());
        assert_eq!(active, Some("second".to_string()));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn unregister_removes_entry() {
        let registry = HandlerRegistry::new();
        registry.register("employee.created", Arc::new(Named("h")));

        assert!(registry.unregister("employee.created").is_some());
        assert!(registry.unregister("employee.created").is_none());
        assert!(!registry.contains("employee.created"));
        assert!(registry.is_empty());
    }

    #[test]
    fn lookup_is_exact_and_ignores_can_handle() {
        let registry = HandlerRegistry::new();
        registry.register("checkin.performed", Arc::new(Named("h")));

        // Named::can_handle claims everything, but dispatch keys by registration string only.
        assert!(registry.get("checkin").is_none());
        assert!(registry.get("checkin.performed.v2").is_none());
    }

    #[test]
    fn validate_against_reports_unknown_types() {
        let registry = HandlerRegistry::new();
        registry.register("checkin.performed", Arc::new(Named("a")));
        registry.register("chekin.performed", Arc::new(Named("b")));
        registry.register("zz.unknown", Arc::new(Named("c")));

        let err = registry
            .validate_against(crate::message_types::KNOWN)
            .unwrap_err();
        assert_eq!(
            err,
            RegistryError::UnknownTypes(vec!["chekin.performed".to_string(), "zz.unknown".to_string()])
        );

        registry.unregister("chekin.performed");
        registry.unregister("zz.unknown");
        assert!(registry.validate_against(crate::message_types::KNOWN).is_ok());
    }

    #[test]
    fn registry_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<HandlerRegistry>();
    }
}
