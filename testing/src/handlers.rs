//! Message handlers for tests.
//!
//! - [`RecordingHandler`]: succeeds and remembers every message it saw
//! - [`FailingHandler`]: fails a configurable number of times, recording the retry counter
//!   of each attempt
//! - [`StallingHandler`]: waits for its processing context to be cancelled

use async_trait::async_trait;
use checkin_messaging_core::handler::{HandlerError, MessageHandler, ProcessingContext};
use checkin_messaging_core::message::Message;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Succeeds for every message and records it.
#[derive(Debug, Default)]
pub struct RecordingHandler {
    name: String,
    delay: Option<Duration>,
    handled: Mutex<Vec<Message>>,
}

impl RecordingHandler {
    /// Create a handler named `name`.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Sleep for `delay` inside every invocation.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Messages handled so far, in order.
    #[must_use]
    pub fn handled(&self) -> Vec<Message> {
        lock(&self.handled).clone()
    }

    /// Ids of the messages handled so far, in order.
    #[must_use]
    pub fn handled_ids(&self) -> Vec<String> {
        lock(&self.handled).iter().map(|m| m.id.clone()).collect()
    }

    /// Number of invocations so far.
    #[must_use]
    pub fn count(&self) -> usize {
        lock(&self.handled).len()
    }
}

#[async_trait]
impl MessageHandler for RecordingHandler {
    async fn handle(&self, _ctx: &ProcessingContext, message: &Message) -> Result<(), HandlerError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        lock(&self.handled).push(message.clone());
        Ok(())
    }

    fn can_handle(&self, _message_type: &str) -> bool {
        true
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Fails the first `failures` invocations, then succeeds.
#[derive(Debug)]
pub struct FailingHandler {
    failures: u32,
    calls: AtomicU32,
    retries_seen: Mutex<Vec<u32>>,
}

impl FailingHandler {
    /// Fail the first `failures` invocations.
    #[must_use]
    pub const fn new(failures: u32) -> Self {
        Self {
            failures,
            calls: AtomicU32::new(0),
            retries_seen: Mutex::new(Vec::new()),
        }
    }

    /// Fail every invocation.
    #[must_use]
    pub const fn always() -> Self {
        Self::new(u32::MAX)
    }

    /// Number of invocations so far.
    #[must_use]
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// The `retry` counter of the message at each invocation.
    #[must_use]
    pub fn retries_seen(&self) -> Vec<u32> {
        lock(&self.retries_seen).clone()
    }
}

#[async_trait]
impl MessageHandler for FailingHandler {
    async fn handle(&self, _ctx: &ProcessingContext, message: &Message) -> Result<(), HandlerError> {
        lock(&self.retries_seen).push(message.retry);
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            Err(HandlerError::failed(format!("simulated failure #{}", call + 1)))
        } else {
            Ok(())
        }
    }

    fn can_handle(&self, _message_type: &str) -> bool {
        true
    }

    fn name(&self) -> &str {
        "failing"
    }
}

/// Blocks until its processing context is cancelled, then reports cancellation.
#[derive(Debug, Default)]
pub struct StallingHandler {
    started: AtomicUsize,
    cancelled: AtomicUsize,
}

impl StallingHandler {
    /// Create a stalling handler.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Invocations started.
    #[must_use]
    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    /// Invocations that observed cancellation.
    #[must_use]
    pub fn cancelled(&self) -> usize {
        self.cancelled.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessageHandler for StallingHandler {
    async fn handle(&self, ctx: &ProcessingContext, _message: &Message) -> Result<(), HandlerError> {
        self.started.fetch_add(1, Ordering::SeqCst);
        ctx.cancelled().await;
        self.cancelled.fetch_add(1, Ordering::SeqCst);
        Err(HandlerError::Cancelled)
    }

    fn can_handle(&self, _message_type: &str) -> bool {
        true
    }

    fn name(&self) -> &str {
        "stalling"
    }
}
