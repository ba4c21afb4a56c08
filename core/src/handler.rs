//! Message handler capability.
//!
//! A [`MessageHandler`] is implemented by business-level collaborators (cache eviction,
//! notifications, projections) and invoked by the consumer for every delivery whose
//! message type it was registered under.
//!
//! Only [`MessageHandler::handle`] is called on the dispatch path. `can_handle` and
//! `name` are self-description: the registry keys strictly by the type string given at
//! registration time and never consults `can_handle`.

use crate::message::Message;
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Error returned by a handler.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    /// The handler could not process the message
    #[error("{0}")]
    Failed(String),

    /// The handler observed cancellation (processing timeout or consumer stop)
    #[error("Processing cancelled")]
    Cancelled,
}

impl HandlerError {
    /// Build a [`Failed`](Self::Failed) error from anything displayable.
    #[must_use]
    pub fn failed(reason: impl std::fmt::Display) -> Self {
        Self::Failed(reason.to_string())
    }
}

/// Per-message processing context.
///
/// The token is cancelled when the processing timeout elapses or when the consumer is
/// stopped. The consumer waits for `handle` to return either way, so a well-behaved
/// handler checks the token at its own suspension points.
#[derive(Debug, Clone)]
pub struct ProcessingContext {
    token: CancellationToken,
    deadline: Instant,
}

impl ProcessingContext {
    /// Create a context whose deadline is `timeout` from now.
    #[must_use]
    pub fn new(token: CancellationToken, timeout: Duration) -> Self {
        Self {
            token,
            deadline: Instant::now() + timeout,
        }
    }

    /// Cancellation token for this message.
    #[must_use]
    pub const fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Whether processing has been cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once processing is cancelled.
    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }

    /// Point in time after which the context is cancelled.
    #[must_use]
    pub const fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Time left before the deadline.
    #[must_use]
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }
}

/// Capability invoked by the consumer for a message type.
///
/// # Example
///
/// ```
/// use async_trait::async_trait;
/// use checkin_messaging_core::handler::{HandlerError, MessageHandler, ProcessingContext};
/// use checkin_messaging_core::message::Message;
///
/// struct AuditLog;
///
/// #[async_trait]
/// impl MessageHandler for AuditLog {
///     async fn handle(&self, _ctx: &ProcessingContext, message: &Message) -> Result<(), HandlerError> {
///         println!("audit: {message}");
///         Ok(())
///     }
///
///     fn can_handle(&self, message_type: &str) -> bool {
///         message_type.starts_with("checkin.")
///     }
///
///     fn name(&self) -> &str {
///         "audit-log"
///     }
/// }
/// ```
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Process a message.
    ///
    /// # Errors
    ///
    /// Returning an error makes the consumer requeue the delivery while the message still
    /// has retry budget, and drop it afterwards.
    async fn handle(&self, ctx: &ProcessingContext, message: &Message) -> Result<(), HandlerError>;

    /// Whether this handler claims the given message type.
    ///
    /// Not consulted by dispatch.
    fn can_handle(&self, message_type: &str) -> bool;

    /// Name used in logs.
    fn name(&self) -> &str;
}
