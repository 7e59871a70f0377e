//! Tests for the consumer loop.

use super::*;
use crate::delivery::DeliveryQueue;
use crate::testing::ConsumerProbe;
use crate::tracking::{EventKind, TrackingService};
use std::time::Duration;

fn queue() -> QueueName {
    QueueName::new("orders".to_string()).unwrap()
}

struct Harness {
    delivery: DeliveryQueue,
    tracking: Arc<TrackingService>,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

fn start(probe: &ConsumerProbe<String>) -> Harness {
    let delivery = DeliveryQueue::new();
    let tracking = Arc::new(TrackingService::new(100).unwrap());
    let store = delivery.store::<String>(&queue()).unwrap();
    let probe = probe.clone();
    let dispatcher = Dispatcher::new(
        queue(),
        Arc::new(move || probe.clone()),
        Some(tracking.clone()),
    );
    let cancel = CancellationToken::new();
    let handle = ConsumerLoop::new(store, dispatcher).spawn(cancel.clone());

    Harness {
        delivery,
        tracking,
        cancel,
        handle,
    }
}

async fn wait_for(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not met in time");
}

#[tokio::test]
async fn test_loop_consumes_in_fifo_order() {
    let probe = ConsumerProbe::new();
    let harness = start(&probe);

    for payload in ["a", "b", "c"] {
        harness
            .delivery
            .enqueue(MessageEnvelope::new(queue(), payload.to_string(), Duration::ZERO, vec![]))
            .unwrap();
    }

    wait_for(|| probe.consumed().len() == 3).await;
    let order: Vec<String> = probe.consumed().into_iter().map(|m| m.payload).collect();
    assert_eq!(order, vec!["a", "b", "c"]);

    harness.cancel.cancel();
    harness.handle.await.unwrap();
}

#[tokio::test]
async fn test_loop_retries_then_succeeds() {
    let probe = ConsumerProbe::new().fail_first(1);
    let harness = start(&probe);

    harness
        .delivery
        .enqueue(MessageEnvelope::new(
            queue(),
            "flaky".to_string(),
            Duration::ZERO,
            vec![Duration::from_millis(50)],
        ))
        .unwrap();

    wait_for(|| probe.consumed().len() == 1).await;
    assert_eq!(probe.attempts(), 2);
    assert_eq!(probe.consumed()[0].retry_number, 1);
    assert_eq!(harness.tracking.count(&queue(), EventKind::Received), 1);
    assert_eq!(harness.tracking.count(&queue(), EventKind::Faulted), 0);

    harness.cancel.cancel();
    harness.handle.await.unwrap();
}

#[tokio::test]
async fn test_loop_faults_after_schedule() {
    let probe = ConsumerProbe::new().always_fail();
    let harness = start(&probe);

    harness
        .delivery
        .enqueue(MessageEnvelope::new(
            queue(),
            "doomed".to_string(),
            Duration::ZERO,
            vec![Duration::from_millis(10), Duration::from_millis(10)],
        ))
        .unwrap();

    wait_for(|| !probe.faults().is_empty()).await;
    assert_eq!(probe.attempts(), 3);
    assert_eq!(probe.faults()[0].exceptions.len(), 3);
    assert_eq!(harness.tracking.count(&queue(), EventKind::Faulted), 1);
    assert_eq!(harness.delivery.pending_count(&queue()), 0);

    harness.cancel.cancel();
    harness.handle.await.unwrap();
}

#[tokio::test]
async fn test_loop_stops_on_cancel_while_idle() {
    let probe = ConsumerProbe::new();
    let harness = start(&probe);

    harness.cancel.cancel();
    tokio::time::timeout(Duration::from_secs(2), harness.handle)
        .await
        .expect("loop should stop")
        .unwrap();
}

#[tokio::test]
async fn test_loop_does_not_dispatch_before_visibility() {
    let probe = ConsumerProbe::new();
    let harness = start(&probe);

    harness
        .delivery
        .enqueue(MessageEnvelope::new(
            queue(),
            "later".to_string(),
            Duration::from_secs(30),
            vec![],
        ))
        .unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(probe.attempts(), 0);
    assert_eq!(harness.delivery.pending_count(&queue()), 1);

    harness.cancel.cancel();
    harness.handle.await.unwrap();
}

#[tokio::test]
async fn test_loop_survives_panicking_consumer() {
    let probe = ConsumerProbe::new().panic_first(1);
    let harness = start(&probe);

    harness
        .delivery
        .enqueue(MessageEnvelope::new(queue(), "boom".to_string(), Duration::ZERO, vec![]))
        .unwrap();
    wait_for(|| !probe.faults().is_empty()).await;

    harness
        .delivery
        .enqueue(MessageEnvelope::new(queue(), "ok".to_string(), Duration::ZERO, vec![]))
        .unwrap();
    wait_for(|| probe.consumed().len() == 1).await;

    assert!(!harness.handle.is_finished());
    assert_eq!(harness.tracking.count(&queue(), EventKind::Faulted), 1);
    assert_eq!(harness.tracking.count(&queue(), EventKind::Received), 1);
    assert_eq!(harness.delivery.pending_count(&queue()), 0);

    harness.cancel.cancel();
    harness.handle.await.unwrap();
}

#[tokio::test]
async fn test_loop_survives_panicking_fault_handler() {
    let probe = ConsumerProbe::new().fail_first(1).panicking_fault_handler();
    let harness = start(&probe);

    harness
        .delivery
        .enqueue(MessageEnvelope::new(queue(), "doomed".to_string(), Duration::ZERO, vec![]))
        .unwrap();
    wait_for(|| !probe.faults().is_empty()).await;

    harness
        .delivery
        .enqueue(MessageEnvelope::new(queue(), "next".to_string(), Duration::ZERO, vec![]))
        .unwrap();
    wait_for(|| probe.consumed().len() == 1).await;

    assert_eq!(probe.consumed()[0].payload, "next");
    assert_eq!(harness.tracking.count(&queue(), EventKind::Faulted), 1);

    harness.cancel.cancel();
    harness.handle.await.unwrap();
}
