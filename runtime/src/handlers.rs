//! Cache eviction after domain events.
//!
//! [`CacheInvalidationHandler`] turns domain events into tenant-scoped cache evictions.
//! Every rule pattern may contain a `{tenant_id}` placeholder that is filled from the
//! message's tenant header, so one tenant's events never evict another tenant's data.
//!
//! `cache.invalidate` messages carry the cache and pattern in their body and are applied
//! under the sender's tenant prefix.

use async_trait::async_trait;
use checkin_messaging_core::cache::CacheInvalidator;
use checkin_messaging_core::handler::{HandlerError, MessageHandler, ProcessingContext};
use checkin_messaging_core::message::Message;
use checkin_messaging_core::message_types;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;

const TENANT_PLACEHOLDER: &str = "{tenant_id}";

/// One eviction triggered by a message type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheRule {
    /// Cache to evict from
    pub cache_name: String,
    /// Glob pattern, may contain `{tenant_id}`
    pub pattern: String,
}

impl CacheRule {
    /// Create a rule.
    #[must_use]
    pub fn new(cache_name: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self {
            cache_name: cache_name.into(),
            pattern: pattern.into(),
        }
    }

    fn pattern_for(&self, tenant_id: &str) -> String {
        self.pattern.replace(TENANT_PLACEHOLDER, tenant_id)
    }
}

#[derive(Debug, Deserialize)]
struct InvalidationRequest {
    cache: String,
    pattern: String,
}

/// Evicts derived data when domain events arrive.
pub struct CacheInvalidationHandler {
    cache: Arc<dyn CacheInvalidator>,
    rules: HashMap<String, Vec<CacheRule>>,
}

impl CacheInvalidationHandler {
    /// Handler with no rules; only explicit `cache.invalidate` messages evict anything.
    #[must_use]
    pub fn new(cache: Arc<dyn CacheInvalidator>) -> Self {
        Self {
            cache,
            rules: HashMap::new(),
        }
    }

    /// Handler with the check-in service's eviction rules.
    #[must_use]
    pub fn with_default_rules(cache: Arc<dyn CacheInvalidator>) -> Self {
        let attendance = [
            CacheRule::new("attendance", "{tenant_id}:attendance:*"),
            CacheRule::new("dashboard", "{tenant_id}:dashboard:*"),
        ];
        let employees = [
            CacheRule::new("employees", "{tenant_id}:employee:*"),
            CacheRule::new("dashboard", "{tenant_id}:dashboard:*"),
        ];
        let permissions = [CacheRule::new("permissions", "{tenant_id}:permissions:*")];

        let mut handler = Self::new(cache);
        for message_type in [message_types::CHECKIN_PERFORMED, message_types::CHECKOUT_PERFORMED] {
            handler = handler.rules(message_type, attendance.clone());
        }
        for message_type in [
            message_types::EMPLOYEE_CREATED,
            message_types::EMPLOYEE_UPDATED,
            message_types::EMPLOYEE_DELETED,
        ] {
            handler = handler.rules(message_type, employees.clone());
        }
        for message_type in [message_types::ROLE_UPDATED, message_types::PERMISSION_UPDATED] {
            handler = handler.rules(message_type, permissions.clone());
        }
        handler
    }

    /// Add rules for `message_type`.
    #[must_use]
    pub fn rules(
        mut self,
        message_type: impl Into<String>,
        rules: impl IntoIterator<Item = CacheRule>,
    ) -> Self {
        self.rules
            .entry(message_type.into())
            .or_default()
            .extend(rules);
        self
    }

    /// Message types this handler evicts for, sorted.
    #[must_use]
    pub fn message_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.rules.keys().map(String::as_str).collect();
        types.push(message_types::CACHE_INVALIDATE);
        types.sort_unstable();
        types.dedup();
        types
    }

    async fn evict(
        &self,
        ctx: &ProcessingContext,
        cache_name: &str,
        pattern: &str,
    ) -> Result<(), HandlerError> {
        if ctx.is_cancelled() {
            return Err(HandlerError::Cancelled);
        }
        self.cache
            .invalidate_pattern(cache_name, pattern)
            .await
            .map_err(HandlerError::failed)?;
        tracing::debug!(cache = cache_name, pattern, "Cache entries evicted");
        Ok(())
    }
}

#[async_trait]
impl MessageHandler for CacheInvalidationHandler {
    async fn handle(&self, ctx: &ProcessingContext, message: &Message) -> Result<(), HandlerError> {
        let tenant_id = message
            .tenant_id()
            .ok_or_else(|| HandlerError::failed("message carries no tenant id"))?;

        if message.message_type == message_types::CACHE_INVALIDATE {
            let request: InvalidationRequest = message.body_as().map_err(HandlerError::failed)?;
            let pattern = format!("{tenant_id}:{}", request.pattern);
            return self.evict(ctx, &request.cache, &pattern).await;
        }

        let Some(rules) = self.rules.get(&message.message_type) else {
            return Ok(());
        };
        for rule in rules {
            self.evict(ctx, &rule.cache_name, &rule.pattern_for(tenant_id))
                .await?;
        }
        Ok(())
    }

    fn can_handle(&self, message_type: &str) -> bool {
        message_type == message_types::CACHE_INVALIDATE || self.rules.contains_key(message_type)
    }

    fn name(&self) -> &str {
        "cache-invalidation"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rule_fills_tenant_placeholder() {
        let rule = CacheRule::new("employees", "{tenant_id}:employee:*");
        assert_eq!(rule.pattern_for("acme"), "acme:employee:*");
    }
}
