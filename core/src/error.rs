//! Error taxonomy for the messaging layer.
//!
//! Errors are split by who observes them:
//!
//! - **Callers** see [`MessagingError::NotConnected`] for operations attempted while the
//!   connection is down, and [`MessagingError::PublishFailed`] once a publish has used up
//!   its retry budget.
//! - **Logs and metrics only** see consumer-side failures (`ConsumeFailed`,
//!   `MessageProcessingFailed`, `InvalidMessage`, `MaxRetriesExceeded`). No synchronous
//!   caller is blocked on consumer-side processing.

use crate::broker::BrokerError;
use crate::config::ConfigError;
use thiserror::Error;

/// Convenience alias for messaging results.
pub type Result<T> = std::result::Result<T, MessagingError>;

/// Errors that can occur in the messaging layer.
#[derive(Error, Debug, Clone)]
pub enum MessagingError {
    /// An operation was attempted while the connection manager is disconnected
    #[error("Not connected to the message broker")]
    NotConnected,

    /// Dialing the broker or opening a channel failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// The connection manager was closed and no longer accepts operations
    #[error("Connection manager is closed")]
    Closed,

    /// A publish exhausted its retry budget
    #[error("Publish to exchange '{exchange}' with routing key '{routing_key}' failed after {attempts} attempt(s): {source}")]
    PublishFailed {
        /// The target exchange
        exchange: String,
        /// The routing key used
        routing_key: String,
        /// How many attempts were made
        attempts: u32,
        /// The last error observed
        #[source]
        source: Box<MessagingError>,
    },

    /// A delivery stream closed unexpectedly or could not be opened
    #[error("Consume from queue '{queue}' failed: {reason}")]
    ConsumeFailed {
        /// The queue being consumed
        queue: String,
        /// The reason for failure
        reason: String,
    },

    /// A handler returned an error
    #[error("Processing of message {message_id} ({message_type}) failed: {reason}")]
    MessageProcessingFailed {
        /// Id of the message
        message_id: String,
        /// Type of the message
        message_type: String,
        /// The handler's error
        reason: String,
    },

    /// An envelope could not be encoded or parsed
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// A message used up its own redelivery budget
    #[error("Message {message_id} exceeded its retry budget after {retries} retries")]
    MaxRetriesExceeded {
        /// Id of the message
        message_id: String,
        /// Retries already spent
        retries: u32,
    },

    /// `start` was called on a consumer that is not stopped
    #[error("Consumer is already running")]
    AlreadyRunning,

    /// `stop` was called on a consumer that is not running
    #[error("Consumer is not running")]
    NotRunning,

    /// A component was started with settings that fail validation
    #[error(transparent)]
    InvalidConfig(#[from] ConfigError),

    /// An overall deadline elapsed
    #[error("Operation timed out")]
    Timeout,

    /// The underlying broker client reported an error
    #[error(transparent)]
    Broker(#[from] BrokerError),
}

impl MessagingError {
    /// Whether this error is classified as "not connected".
    ///
    /// Looks through [`PublishFailed`](Self::PublishFailed) to the last cause, so a publish
    /// that ran out of attempts while the connection was down still classifies as
    /// not-connected.
    #[must_use]
    pub fn is_not_connected(&self) -> bool {
        match self {
            Self::NotConnected => true,
            Self::PublishFailed { source, .. } => source.is_not_connected(),
            _ => false,
        }
    }

    /// Whether retrying the same operation could plausibly succeed.
    ///
    /// Encoding problems and consumer lifecycle misuse are permanent; everything that
    /// depends on broker connectivity is transient.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::NotConnected | Self::ConnectionFailed(_) | Self::Timeout | Self::Broker(_)
        )
    }
}
