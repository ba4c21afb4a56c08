//! In-memory cache invalidator.

use checkin_messaging_core::cache::{CacheError, CacheInvalidator};
use std::future::{Future, ready};
use std::pin::Pin;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// One recorded eviction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invalidation {
    /// Cache evicted from
    pub cache_name: String,
    /// Pattern evicted
    pub pattern: String,
}

/// Records evictions instead of performing them.
///
/// # Example
///
/// ```
/// use checkin_messaging_testing::InMemoryCacheInvalidator;
/// use checkin_messaging_core::cache::CacheInvalidator;
///
/// # async fn example() {
/// let cache = InMemoryCacheInvalidator::new();
/// cache.invalidate_pattern("employees", "acme:employee:*").await.ok();
/// assert_eq!(cache.invalidations().len(), 1);
/// # }
/// ```
#[derive(Debug, Default)]
pub struct InMemoryCacheInvalidator {
    invalidations: Mutex<Vec<Invalidation>>,
    failure: Mutex<Option<CacheError>>,
}

impl InMemoryCacheInvalidator {
    /// Create an empty invalidator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following eviction fail with `error` (or succeed again with `None`).
    pub fn fail_with(&self, error: Option<CacheError>) {
        *lock(&self.failure) = error;
    }

    /// Evictions recorded so far, in order.
    #[must_use]
    pub fn invalidations(&self) -> Vec<Invalidation> {
        lock(&self.invalidations).clone()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl CacheInvalidator for InMemoryCacheInvalidator {
    fn invalidate_pattern<'a>(
        &'a self,
        cache_name: &'a str,
        pattern: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<(), CacheError>> + Send + 'a>> {
        let result = match lock(&self.failure).clone() {
            Some(error) => Err(error),
            None => {
                lock(&self.invalidations).push(Invalidation {
                    cache_name: cache_name.to_string(),
                    pattern: pattern.to_string(),
                });
                Ok(())
            }
        };
        Box::pin(ready(result))
    }
}
