//! Single-reader processing loop for the in-process broker.

use crate::delivery::QueueStore;
use crate::dispatch::{DispatchOutcome, Dispatcher};
use crate::message::{MessageEnvelope, Payload, QueueName};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[cfg(test)]
#[path = "consumer_loop_tests.rs"]
mod tests;

/// The only reader of one queue's store.
///
/// Waits for the next visible envelope, dispatches it and re-enqueues retries
/// into the same store. Cancellation is observed only while idle; a dispatch
/// that has started always runs to completion.
pub struct ConsumerLoop<T> {
    store: Arc<QueueStore<MessageEnvelope<T>>>,
    dispatcher: Dispatcher<T>,
}

impl<T: Payload> ConsumerLoop<T> {
    pub fn new(store: Arc<QueueStore<MessageEnvelope<T>>>, dispatcher: Dispatcher<T>) -> Self {
        Self { store, dispatcher }
    }

    pub fn queue_name(&self) -> &QueueName {
        self.store.queue_name()
    }

    /// Process envelopes until `cancel` fires
    pub async fn run(self, cancel: CancellationToken) {
        info!(queue_name = %self.queue_name(), "Starting consumer loop");

        while let Some(envelope) = self.store.next_visible(&cancel).await {
            if let DispatchOutcome::Retry { envelope, .. } = self.dispatcher.dispatch(envelope).await {
                let id = envelope.id().clone();
                let visible_at = envelope.process_not_before();
                if let Err(e) = self.store.push(id, visible_at, envelope) {
                    error!(
                        queue_name = %self.queue_name(),
                        error = %e,
                        "Failed to re-enqueue message for retry"
                    );
                }
            }
        }

        info!(queue_name = %self.queue_name(), "Consumer loop stopped");
    }

    /// Run the loop on its own task
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(cancel))
    }
}
