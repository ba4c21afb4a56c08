//! Integration tests for the multi-worker consumer
//!
//! Lifecycle, ack/requeue/reject decisions, bounded redelivery, processing timeouts,
//! and recovery from a dropped connection without restarting the consumer.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

use checkin_messaging_core::broker::QueueSpec;
use checkin_messaging_core::config::{ConnectionConfig, ConsumerConfig};
use checkin_messaging_core::message_types;
use checkin_messaging_core::{CancellationToken, Message, MessagingError};
use checkin_messaging_runtime::{ConnectionManager, Consumer, ConsumerState};
use checkin_messaging_testing::{
    FailingHandler, InMemoryBroker, RecordingHandler, StallingHandler, wait_until,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// Test Fixtures
// ============================================================================

const QUEUE: &str = "checkins";
const WAIT: Duration = Duration::from_secs(5);

async fn connected(broker: &InMemoryBroker) -> Arc<ConnectionManager> {
    let config = ConnectionConfig {
        max_retries: 20,
        retry_delay: Duration::from_millis(20),
        ..ConnectionConfig::default()
    };
    let manager = Arc::new(ConnectionManager::new(Arc::new(broker.clone()), config));
    manager.connect().await.unwrap();
    manager.declare_queue(&QueueSpec::new(QUEUE)).await.unwrap();
    manager
}

fn consumer_config() -> ConsumerConfig {
    ConsumerConfig {
        consumer_tag: "test".to_string(),
        retry_delay: Duration::from_millis(20),
        processing_timeout: Duration::from_secs(2),
        ..ConsumerConfig::new(QUEUE)
    }
}

fn checkin(tenant: &str) -> Message {
    let mut message = Message::new(message_types::CHECKIN_PERFORMED, json!({ "employee_id": 42 }));
    message.set_tenant_id(tenant);
    message
}

async fn started(consumer: &Consumer, broker: &InMemoryBroker, workers: usize) -> CancellationToken {
    let shutdown = CancellationToken::new();
    consumer.start(&shutdown).await.unwrap();
    assert!(
        wait_until(WAIT, || broker.consumer_count(QUEUE) == workers).await,
        "workers did not subscribe"
    );
    shutdown
}

// ============================================================================
// Lifecycle
// ============================================================================

#[tokio::test]
async fn lifecycle_rejects_illegal_transitions() {
    let broker = InMemoryBroker::new();
    let consumer = Consumer::new(connected(&broker).await, consumer_config());
    assert_eq!(consumer.state(), ConsumerState::Stopped);
    assert!(matches!(consumer.stop().await, Err(MessagingError::NotRunning)));

    let shutdown = CancellationToken::new();
    consumer.start(&shutdown).await.unwrap();
    assert_eq!(consumer.state(), ConsumerState::Running);
    assert!(matches!(
        consumer.start(&shutdown).await,
        Err(MessagingError::AlreadyRunning)
    ));

    consumer.stop().await.unwrap();
    assert_eq!(consumer.state(), ConsumerState::Stopped);
    assert!(matches!(consumer.stop().await, Err(MessagingError::NotRunning)));
    assert!(wait_until(WAIT, || broker.consumer_count(QUEUE) == 0).await);

    // A stopped consumer can run again
    consumer.start(&shutdown).await.unwrap();
    consumer.stop().await.unwrap();
}

#[tokio::test]
async fn start_applies_qos() {
    let broker = InMemoryBroker::new();
    let config = ConsumerConfig {
        prefetch_count: 4,
        ..consumer_config()
    };
    let consumer = Consumer::new(connected(&broker).await, config);

    consumer.start(&CancellationToken::new()).await.unwrap();

    assert_eq!(broker.qos_history(), vec![(4, 0)]);
    consumer.stop().await.unwrap();
}

#[tokio::test]
async fn start_fails_while_disconnected() {
    let broker = InMemoryBroker::new();
    let manager = Arc::new(ConnectionManager::new(
        Arc::new(broker.clone()),
        ConnectionConfig::default(),
    ));
    let consumer = Consumer::new(manager, consumer_config());

    let err = consumer.start(&CancellationToken::new()).await.unwrap_err();

    assert!(err.is_not_connected());
    assert_eq!(consumer.state(), ConsumerState::Stopped);
}

#[tokio::test]
async fn start_rejects_invalid_settings() {
    let broker = InMemoryBroker::new();
    let config = ConsumerConfig {
        concurrent_consumers: 0,
        ..consumer_config()
    };
    let consumer = Consumer::new(connected(&broker).await, config);

    let err = consumer.start(&CancellationToken::new()).await.unwrap_err();

    assert!(matches!(err, MessagingError::InvalidConfig(_)));
    assert_eq!(consumer.state(), ConsumerState::Stopped);
    assert!(broker.qos_history().is_empty());
}

#[tokio::test]
async fn cancelling_the_parent_token_stops_the_run() {
    let broker = InMemoryBroker::new();
    let consumer = Consumer::new(connected(&broker).await, consumer_config());
    let shutdown = started(&consumer, &broker, 1).await;
    let mut states = consumer.subscribe_state();

    shutdown.cancel();

    tokio::time::timeout(WAIT, states.wait_for(|s| *s == ConsumerState::Stopped))
        .await
        .unwrap()
        .unwrap();
}

// ============================================================================
// Dispatch
// ============================================================================

#[tokio::test]
async fn handled_messages_are_acknowledged() {
    let broker = InMemoryBroker::new();
    let consumer = Consumer::new(connected(&broker).await, consumer_config());
    let handler = Arc::new(RecordingHandler::new("recorder"));
    consumer.register_handler(message_types::CHECKIN_PERFORMED, handler.clone());
    let _shutdown = started(&consumer, &broker, 1).await;

    let message = checkin("acme");
    broker.enqueue_message(QUEUE, &message).unwrap();

    assert!(wait_until(WAIT, || broker.stats().acked == 1).await);
    assert_eq!(handler.handled(), vec![message]);
    assert_eq!(broker.unacked_count(QUEUE), 0);
    assert_eq!(broker.ready_count(QUEUE), 0);
    consumer.stop().await.unwrap();
}

#[tokio::test]
async fn two_workers_handle_each_message_exactly_once() {
    let broker = InMemoryBroker::new();
    let config = ConsumerConfig {
        concurrent_consumers: 2,
        ..consumer_config()
    };
    let consumer = Consumer::new(connected(&broker).await, config);
    let handler = Arc::new(RecordingHandler::new("recorder").with_delay(Duration::from_millis(50)));
    consumer.register_handler(message_types::CHECKIN_PERFORMED, handler.clone());
    let _shutdown = started(&consumer, &broker, 2).await;

    let first = checkin("acme");
    let second = checkin("acme");
    broker.enqueue_message(QUEUE, &first).unwrap();
    broker.enqueue_message(QUEUE, &second).unwrap();

    assert!(wait_until(WAIT, || broker.stats().acked == 2).await);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut handled = handler.handled_ids();
    handled.sort();
    let mut expected = vec![first.id, second.id];
    expected.sort();
    assert_eq!(handled, expected);
    assert_eq!(broker.stats().delivered, 2);
    consumer.stop().await.unwrap();
}

#[tokio::test]
async fn unroutable_message_is_rejected_without_requeue() {
    let broker = InMemoryBroker::new();
    let consumer = Consumer::new(connected(&broker).await, consumer_config());
    let handler = Arc::new(RecordingHandler::new("recorder"));
    consumer.register_handler(message_types::CHECKIN_PERFORMED, handler.clone());
    let _shutdown = started(&consumer, &broker, 1).await;

    let message = Message::new(message_types::TENANT_CREATED, json!({ "tenant": "acme" }));
    broker.enqueue_message(QUEUE, &message).unwrap();

    assert!(wait_until(WAIT, || broker.stats().rejected == 1).await);
    assert_eq!(handler.count(), 0);
    assert_eq!(broker.stats().requeued, 0);
    assert_eq!(broker.rejected(), vec![message.to_json().unwrap()]);
    consumer.stop().await.unwrap();
}

#[tokio::test]
async fn invalid_envelope_is_rejected_without_requeue() {
    let broker = InMemoryBroker::new();
    let consumer = Consumer::new(connected(&broker).await, consumer_config());
    consumer.register_handler(
        message_types::CHECKIN_PERFORMED,
        Arc::new(RecordingHandler::new("recorder")),
    );
    let _shutdown = started(&consumer, &broker, 1).await;

    broker.enqueue(QUEUE, b"definitely not an envelope".to_vec());

    assert!(wait_until(WAIT, || broker.stats().rejected == 1).await);
    assert_eq!(broker.stats().requeued, 0);
    consumer.stop().await.unwrap();
}

#[tokio::test]
async fn second_registration_replaces_the_first() {
    let broker = InMemoryBroker::new();
    let consumer = Consumer::new(connected(&broker).await, consumer_config());
    let first = Arc::new(RecordingHandler::new("first"));
    let second = Arc::new(RecordingHandler::new("second"));
    assert!(consumer.register_handler(message_types::CHECKIN_PERFORMED, first.clone()).is_none());
    assert!(consumer.register_handler(message_types::CHECKIN_PERFORMED, second.clone()).is_some());
    let _shutdown = started(&consumer, &broker, 1).await;

    broker.enqueue_message(QUEUE, &checkin("acme")).unwrap();

    assert!(wait_until(WAIT, || second.count() == 1).await);
    assert_eq!(first.count(), 0);
    consumer.stop().await.unwrap();
}

#[tokio::test]
async fn handlers_can_be_unregistered_during_a_run() {
    let broker = InMemoryBroker::new();
    let consumer = Consumer::new(connected(&broker).await, consumer_config());
    let handler = Arc::new(RecordingHandler::new("recorder"));
    consumer.register_handler(message_types::CHECKIN_PERFORMED, handler.clone());
    let _shutdown = started(&consumer, &broker, 1).await;

    broker.enqueue_message(QUEUE, &checkin("acme")).unwrap();
    assert!(wait_until(WAIT, || handler.count() == 1).await);

    assert!(consumer.unregister_handler(message_types::CHECKIN_PERFORMED).is_some());
    broker.enqueue_message(QUEUE, &checkin("acme")).unwrap();

    assert!(wait_until(WAIT, || broker.stats().rejected == 1).await);
    assert_eq!(handler.count(), 1);
    consumer.stop().await.unwrap();
}

// ============================================================================
// Redelivery
// ============================================================================

#[tokio::test]
async fn each_requeue_increments_retry_by_one() {
    let broker = InMemoryBroker::new();
    let config = ConsumerConfig {
        max_retries: 3,
        ..consumer_config()
    };
    let consumer = Consumer::new(connected(&broker).await, config);
    let handler = Arc::new(FailingHandler::new(2));
    consumer.register_handler(message_types::CHECKIN_PERFORMED, handler.clone());
    let _shutdown = started(&consumer, &broker, 1).await;

    broker.enqueue_message(QUEUE, &checkin("acme")).unwrap();

    assert!(wait_until(WAIT, || broker.stats().acked == 1).await);
    assert_eq!(handler.retries_seen(), vec![0, 1, 2]);
    assert_eq!(broker.stats().requeued, 2);
    assert_eq!(broker.stats().rejected, 0);
    assert!(consumer.redeliveries().is_empty());
    consumer.stop().await.unwrap();
}

#[tokio::test]
async fn exhausted_message_is_dropped_and_never_redelivered() {
    let broker = InMemoryBroker::new();
    let config = ConsumerConfig {
        max_retries: 2,
        ..consumer_config()
    };
    let consumer = Consumer::new(connected(&broker).await, config);
    let handler = Arc::new(FailingHandler::always());
    consumer.register_handler(message_types::CHECKIN_PERFORMED, handler.clone());
    let _shutdown = started(&consumer, &broker, 1).await;

    let message = checkin("acme");
    broker.enqueue_message(QUEUE, &message).unwrap();

    assert!(wait_until(WAIT, || broker.stats().rejected == 1).await);
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(handler.calls(), 3);
    assert_eq!(handler.retries_seen(), vec![0, 1, 2]);
    assert_eq!(broker.stats().requeued, 2);
    assert_eq!(broker.ready_count(QUEUE), 0);
    assert_eq!(broker.rejected(), vec![message.to_json().unwrap()]);
    assert!(consumer.redeliveries().is_empty());
    consumer.stop().await.unwrap();
}

#[tokio::test]
async fn envelope_retry_counter_is_honoured() {
    let broker = InMemoryBroker::new();
    let config = ConsumerConfig {
        max_retries: 3,
        ..consumer_config()
    };
    let consumer = Consumer::new(connected(&broker).await, config);
    let handler = Arc::new(FailingHandler::always());
    consumer.register_handler(message_types::CHECKIN_PERFORMED, handler.clone());
    let _shutdown = started(&consumer, &broker, 1).await;

    let mut message = checkin("acme");
    message.retry = 3;
    broker.enqueue_message(QUEUE, &message).unwrap();

    assert!(wait_until(WAIT, || broker.stats().rejected == 1).await);
    assert_eq!(handler.calls(), 1);
    assert_eq!(broker.stats().requeued, 0);
    consumer.stop().await.unwrap();
}

#[tokio::test]
async fn auto_ack_mode_never_settles_deliveries() {
    let broker = InMemoryBroker::new();
    let config = ConsumerConfig {
        auto_ack: true,
        ..consumer_config()
    };
    let consumer = Consumer::new(connected(&broker).await, config);
    let handler = Arc::new(FailingHandler::always());
    consumer.register_handler(message_types::CHECKIN_PERFORMED, handler.clone());
    let _shutdown = started(&consumer, &broker, 1).await;

    broker.enqueue_message(QUEUE, &checkin("acme")).unwrap();

    assert!(wait_until(WAIT, || handler.calls() == 1).await);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(handler.calls(), 1);
    assert_eq!(broker.stats().requeued, 0);
    assert_eq!(broker.stats().rejected, 0);
    assert_eq!(broker.unacked_count(QUEUE), 0);
    consumer.stop().await.unwrap();
}

// ============================================================================
// Cancellation
// ============================================================================

#[tokio::test]
async fn processing_timeout_cancels_the_handler_context() {
    let broker = InMemoryBroker::new();
    let config = ConsumerConfig {
        max_retries: 0,
        processing_timeout: Duration::from_millis(50),
        ..consumer_config()
    };
    let consumer = Consumer::new(connected(&broker).await, config);
    let handler = Arc::new(StallingHandler::new());
    consumer.register_handler(message_types::CHECKIN_PERFORMED, handler.clone());
    let _shutdown = started(&consumer, &broker, 1).await;

    broker.enqueue_message(QUEUE, &checkin("acme")).unwrap();

    assert!(wait_until(WAIT, || broker.stats().rejected == 1).await);
    assert_eq!(handler.started(), 1);
    assert_eq!(handler.cancelled(), 1);
    consumer.stop().await.unwrap();
}

#[tokio::test]
async fn stop_cancels_in_flight_handler_and_requeues() {
    let broker = InMemoryBroker::new();
    let config = ConsumerConfig {
        processing_timeout: Duration::from_secs(60),
        ..consumer_config()
    };
    let consumer = Consumer::new(connected(&broker).await, config);
    let handler = Arc::new(StallingHandler::new());
    consumer.register_handler(message_types::CHECKIN_PERFORMED, handler.clone());
    let _shutdown = started(&consumer, &broker, 1).await;

    broker.enqueue_message(QUEUE, &checkin("acme")).unwrap();
    assert!(wait_until(WAIT, || handler.started() == 1).await);

    tokio::time::timeout(WAIT, consumer.stop()).await.unwrap().unwrap();

    assert_eq!(consumer.state(), ConsumerState::Stopped);
    assert_eq!(handler.cancelled(), 1);
    assert_eq!(broker.stats().requeued, 1);
    assert_eq!(broker.ready_count(QUEUE), 1);
}

#[tokio::test]
async fn stop_does_not_spend_the_last_retry() {
    let broker = InMemoryBroker::new();
    let config = ConsumerConfig {
        max_retries: 0,
        processing_timeout: Duration::from_secs(60),
        ..consumer_config()
    };
    let consumer = Consumer::new(connected(&broker).await, config);
    let handler = Arc::new(StallingHandler::new());
    consumer.register_handler(message_types::CHECKIN_PERFORMED, handler.clone());
    let _shutdown = started(&consumer, &broker, 1).await;

    broker.enqueue_message(QUEUE, &checkin("acme")).unwrap();
    assert!(wait_until(WAIT, || handler.started() == 1).await);

    tokio::time::timeout(WAIT, consumer.stop()).await.unwrap().unwrap();

    assert_eq!(handler.cancelled(), 1);
    assert_eq!(broker.stats().rejected, 0);
    assert_eq!(broker.stats().requeued, 1);
    assert_eq!(broker.ready_count(QUEUE), 1);
}

#[tokio::test]
async fn retry_counts_do_not_outlive_a_run() {
    let broker = InMemoryBroker::new();
    let manager = connected(&broker).await;

    let first = Consumer::new(
        Arc::clone(&manager),
        ConsumerConfig {
            max_retries: 1_000_000,
            ..consumer_config()
        },
    );
    first.register_handler(message_types::CHECKIN_PERFORMED, Arc::new(FailingHandler::always()));
    let _first_shutdown = started(&first, &broker, 1).await;

    broker.enqueue_message(QUEUE, &checkin("acme")).unwrap();
    assert!(wait_until(WAIT, || broker.stats().requeued >= 1).await);
    assert_eq!(first.redeliveries().len(), 1);

    first.stop().await.unwrap();
    assert!(first.redeliveries().is_empty());

    // Another consumer settles the message the first one kept requeueing.
    let second = Consumer::new(Arc::clone(&manager), consumer_config());
    let recorder = Arc::new(RecordingHandler::new("recorder"));
    second.register_handler(message_types::CHECKIN_PERFORMED, recorder.clone());
    let _second_shutdown = started(&second, &broker, 1).await;

    assert!(wait_until(WAIT, || broker.stats().acked == 1).await);
    assert_eq!(recorder.count(), 1);
    assert!(first.redeliveries().is_empty());
    assert!(second.redeliveries().is_empty());
    second.stop().await.unwrap();
}

// ============================================================================
// Reconnect
// ============================================================================

#[tokio::test]
async fn consumer_resumes_after_connection_drop_without_restart() {
    let broker = InMemoryBroker::new();
    let consumer = Consumer::new(connected(&broker).await, consumer_config());
    let handler = Arc::new(RecordingHandler::new("recorder"));
    consumer.register_handler(message_types::CHECKIN_PERFORMED, handler.clone());
    let _shutdown = started(&consumer, &broker, 1).await;

    broker.enqueue_message(QUEUE, &checkin("acme")).unwrap();
    assert!(wait_until(WAIT, || handler.count() == 1).await);

    broker.drop_connections();
    assert!(
        wait_until(WAIT, || broker.stats().dials == 2 && broker.consumer_count(QUEUE) == 1).await,
        "consumer did not re-subscribe after reconnect"
    );

    broker.enqueue_message(QUEUE, &checkin("acme")).unwrap();
    assert!(wait_until(WAIT, || handler.count() == 2).await);
    assert_eq!(consumer.state(), ConsumerState::Running);
    assert_eq!(broker.qos_history().len(), 2);
    consumer.stop().await.unwrap();
}
