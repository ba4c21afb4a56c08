//! Cache collaborator consumed by message handlers.
//!
//! The messaging core never touches the cache. Business-level handlers use this
//! capability to evict derived data after an event has been processed.

use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors reported by a cache backend.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// The backend could not be reached
    #[error("Cache unavailable: {0}")]
    Unavailable(String),

    /// The pattern was rejected by the backend
    #[error("Invalid cache pattern '{pattern}': {reason}")]
    InvalidPattern {
        /// The rejected pattern
        pattern: String,
        /// The reason for rejection
        reason: String,
    },
}

/// Pattern-based cache eviction.
///
/// `pattern` uses glob syntax (`*` matches any run of characters), scoped to the named
/// cache.
pub trait CacheInvalidator: Send + Sync {
    /// Evict every key of `cache_name` matching `pattern`.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError`] if the eviction could not be performed.
    fn invalidate_pattern<'a>(
        &'a self,
        cache_name: &'a str,
        pattern: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<(), CacheError>> + Send + 'a>>;
}
