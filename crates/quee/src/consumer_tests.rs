//! Tests for the consumer contract.

use super::*;
use crate::message::MessageId;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

struct CountingConsumer {
    consumed: Arc<AtomicUsize>,
}

#[async_trait]
impl Consumer<String> for CountingConsumer {
    async fn consume(&self, message: Message<String>) -> anyhow::Result<()> {
        if message.payload == "bad" {
            anyhow::bail!("rejected payload");
        }
        self.consumed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn consume_fault(&self, _message: FaultMessage<String>) -> anyhow::Result<()> {
        Ok(())
    }
}

fn message(payload: &str) -> Message<String> {
    Message {
        message_id: MessageId::new(),
        payload: payload.to_string(),
        retry_number: 0,
    }
}

#[tokio::test]
async fn test_closure_factory_creates_new_instances() {
    let created = Arc::new(AtomicUsize::new(0));
    let consumed = Arc::new(AtomicUsize::new(0));

    let factory = {
        let created = created.clone();
        let consumed = consumed.clone();
        move || {
            created.fetch_add(1, Ordering::SeqCst);
            CountingConsumer {
                consumed: consumed.clone(),
            }
        }
    };

    let first = factory.create_consumer();
    let second = factory.create_consumer();
    first.consume(message("a")).await.unwrap();
    second.consume(message("b")).await.unwrap();

    assert_eq!(created.load(Ordering::SeqCst), 2);
    assert_eq!(consumed.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_consumer_error_is_returned() {
    let consumer = CountingConsumer {
        consumed: Arc::new(AtomicUsize::new(0)),
    };

    let err = consumer.consume(message("bad")).await.unwrap_err();
    assert_eq!(err.to_string(), "rejected payload");
}

#[test]
fn test_consumer_options_defaults() {
    let options = ConsumerOptions::default();
    assert_eq!(options.concurrency_limit, 1);
    assert_eq!(options.prefetch_limit, 0);
}
