//! Delivery through the transport adapter path using the loopback transport.

mod common;

use common::{init_tracing, queue, OrderPlaced, Script, ScriptedConsumer};
use quee::{ConsumerOptions, LoopbackTransport, QueueError, QueueSystemBuilder};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn test_transport_retries_then_delivers() {
    init_tracing();
    let transport = Arc::new(LoopbackTransport::new());
    let consumer = ScriptedConsumer::new(Script::FailTimes(1));

    let system = QueueSystemBuilder::with_transport(transport.clone())
        .add_message_tracker(100)
        .unwrap()
        .with_monitor_poll_interval(Duration::from_millis(10))
        .unwrap()
        .add_sender_and_consumer::<OrderPlaced, _>(
            queue("orders"),
            [Duration::from_millis(50)],
            consumer.factory(),
        )
        .unwrap()
        .build()
        .unwrap();

    let running = system.start(CancellationToken::new()).await.unwrap();
    system.send(OrderPlaced::new("T1")).await.unwrap();

    let received = system
        .monitor()
        .unwrap()
        .await_received(&queue("orders"), |_: &OrderPlaced| true, Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(received, Some(OrderPlaced::new("T1")));

    let attempts = consumer.attempts();
    assert_eq!(attempts.len(), 2);
    assert_eq!(attempts[1].retry_number, 1);

    running.shutdown().await;
    assert_eq!(transport.pending_count(&queue("orders")), 0);
}

#[tokio::test]
async fn test_transport_faults_after_schedule_is_exhausted() {
    init_tracing();
    let transport = Arc::new(LoopbackTransport::new());
    let consumer = ScriptedConsumer::new(Script::AlwaysFail);

    let system = QueueSystemBuilder::with_transport(transport)
        .add_message_tracker(100)
        .unwrap()
        .with_monitor_poll_interval(Duration::from_millis(10))
        .unwrap()
        .add_sender::<OrderPlaced>(queue("orders"), [Duration::from_millis(10); 2])
        .unwrap()
        .add_consumer_with_options::<OrderPlaced, _>(
            queue("orders"),
            consumer.factory(),
            ConsumerOptions {
                concurrency_limit: 4,
                prefetch_limit: 0,
            },
        )
        .unwrap()
        .build()
        .unwrap();

    let running = system.start(CancellationToken::new()).await.unwrap();
    system.send(OrderPlaced::new("T2")).await.unwrap();

    system
        .monitor()
        .unwrap()
        .await_faulted(&queue("orders"), |_: &OrderPlaced| true, Duration::from_secs(2))
        .await
        .unwrap()
        .expect("message should fault");

    let faults = consumer.faults();
    assert_eq!(faults.len(), 1);
    assert_eq!(faults[0].exceptions.len(), 3);

    running.shutdown().await;
}

#[tokio::test]
async fn test_send_to_unusable_queue_is_transmission_failure() {
    init_tracing();
    let transport = Arc::new(LoopbackTransport::new());
    transport.deny_queue(&queue("orders"));

    let system = QueueSystemBuilder::with_transport(transport)
        .add_message_tracker(100)
        .unwrap()
        .add_sender::<OrderPlaced>(queue("orders"), [])
        .unwrap()
        .build()
        .unwrap();

    let err = system.send(OrderPlaced::new("T3")).await.unwrap_err();
    assert!(matches!(err, QueueError::TransmissionFailure { .. }));
    assert_eq!(
        system
            .tracking()
            .unwrap()
            .count(&queue("orders"), quee::EventKind::Sent),
        0
    );
}
