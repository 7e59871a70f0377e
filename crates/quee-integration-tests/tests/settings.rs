//! Queue systems assembled from settings files.

mod common;

use common::{init_tracing, queue, OrderPlaced, Script, ScriptedConsumer};
use quee::{EventKind, QueueSettings, QueueSystemBuilder};
use std::io::Write;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn write_settings(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(".yaml")
        .tempfile()
        .expect("temp file");
    file.write_all(contents.as_bytes()).expect("write settings");
    file
}

#[tokio::test]
async fn test_settings_file_drives_retries_and_tracking() {
    init_tracing();
    let file = write_settings(
        r#"
tracking:
  maximum_messages_per_queue: 3
monitor:
  poll_interval_ms: 10
queues:
  orders:
    retry_delays_ms: [20, 20]
"#,
    );
    let settings = QueueSettings::load(Some(file.path())).unwrap();
    let consumer = ScriptedConsumer::new(Script::AlwaysFail);

    let system = QueueSystemBuilder::from_settings(&settings)
        .unwrap()
        .add_sender_and_consumer::<OrderPlaced, _>(queue("orders"), [], consumer.factory())
        .unwrap()
        .build()
        .unwrap();
    assert_eq!(system.tracking().unwrap().capacity(), 3);
    assert_eq!(system.monitor().unwrap().poll_interval(), Duration::from_millis(10));

    let running = system.start(CancellationToken::new()).await.unwrap();
    system.send(OrderPlaced::new("S1")).await.unwrap();

    system
        .monitor()
        .unwrap()
        .await_faulted(&queue("orders"), |_: &OrderPlaced| true, Duration::from_secs(2))
        .await
        .unwrap()
        .expect("message should fault");
    assert_eq!(consumer.attempts().len(), 3);
    assert_eq!(consumer.faults()[0].exceptions.len(), 3);

    running.shutdown().await;
}

#[tokio::test]
async fn test_tracking_capacity_evicts_oldest_events() {
    init_tracing();
    let file = write_settings("tracking:\n  maximum_messages_per_queue: 2\n");
    let settings = QueueSettings::load(Some(file.path())).unwrap();

    let system = QueueSystemBuilder::from_settings(&settings)
        .unwrap()
        .add_sender::<OrderPlaced>(queue("orders"), [])
        .unwrap()
        .build()
        .unwrap();

    for id in ["A", "B", "C"] {
        system.send(OrderPlaced::new(id)).await.unwrap();
    }

    let tracking = system.tracking().unwrap();
    assert_eq!(tracking.count(&queue("orders"), EventKind::Sent), 2);
    let found = tracking.try_find(&queue("orders"), EventKind::Sent, |o: &OrderPlaced| {
        o.order_id == "A"
    });
    assert!(found.is_none());
}

#[test]
fn test_disabled_tracking_builds_without_monitor() {
    let file = write_settings("tracking:\n  enabled: false\nallow_retries: false\n");
    let settings = QueueSettings::load(Some(file.path())).unwrap();

    let system = QueueSystemBuilder::from_settings(&settings)
        .unwrap()
        .build()
        .unwrap();
    assert!(system.tracking().is_none());
    assert!(system.monitor().is_err());
}

#[test]
fn test_invalid_settings_file_is_rejected() {
    let file = write_settings("queues:\n  orders:\n    concurrency_limit: 0\n");

    let err = QueueSettings::load(Some(file.path())).unwrap_err();
    assert!(matches!(err, quee::QueueError::ValidationError(_)) || err.is_configuration_error());
}
