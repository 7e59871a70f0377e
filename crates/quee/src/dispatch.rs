//! One delivery attempt: consume, then branch on the result.
//!
//! The dispatcher is shared by the in-process consumer loop and the transport
//! subscription. It decides what happens to the envelope but leaves the
//! re-enqueue of a retry to its caller, since only the caller knows where the
//! envelope came from.

use crate::consumer::{describe_panic, ConsumerFactory};
use crate::fault::FaultRouter;
use crate::message::{MessageEnvelope, Payload, QueueName};
use crate::retry::RetryDecision;
use crate::tracking::TrackingService;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

#[cfg(test)]
#[path = "dispatch_tests.rs"]
mod tests;

/// Result of dispatching one envelope
#[derive(Debug)]
pub enum DispatchOutcome<T> {
    /// Consumed successfully; the envelope is discarded
    Received,

    /// Failed with retries left; the envelope must be re-enqueued
    Retry {
        envelope: MessageEnvelope<T>,
        delay: Duration,
    },

    /// Failed with no retries left; already handed to the fault handler
    Faulted,
}

/// Runs delivery attempts for one queue
pub struct Dispatcher<T> {
    queue_name: QueueName,
    factory: Arc<dyn ConsumerFactory<T>>,
    tracking: Option<Arc<TrackingService>>,
    fault_router: FaultRouter,
}

impl<T> Clone for Dispatcher<T> {
    fn clone(&self) -> Self {
        Self {
            queue_name: self.queue_name.clone(),
            factory: self.factory.clone(),
            tracking: self.tracking.clone(),
            fault_router: self.fault_router.clone(),
        }
    }
}

impl<T: Payload> Dispatcher<T> {
    pub fn new(
        queue_name: QueueName,
        factory: Arc<dyn ConsumerFactory<T>>,
        tracking: Option<Arc<TrackingService>>,
    ) -> Self {
        let fault_router = FaultRouter::new(tracking.clone());
        Self {
            queue_name,
            factory,
            tracking,
            fault_router,
        }
    }

    pub fn queue_name(&self) -> &QueueName {
        &self.queue_name
    }

    /// Deliver `envelope` to a freshly created consumer.
    ///
    /// A panic in `consume` is treated as a failed attempt.
    pub async fn dispatch(&self, mut envelope: MessageEnvelope<T>) -> DispatchOutcome<T> {
        let consumer = self.factory.create_consumer();

        debug!(
            queue_name = %self.queue_name,
            message_id = %envelope.id(),
            retry_number = envelope.retry_number(),
            "Dispatching message"
        );

        let attempt = AssertUnwindSafe(consumer.consume(envelope.message()))
            .catch_unwind()
            .await;
        let failure = match attempt {
            Ok(Ok(())) => {
                if let Some(tracking) = &self.tracking {
                    tracking.record_received(&self.queue_name, envelope.payload().clone());
                }
                return DispatchOutcome::Received;
            }
            Ok(Err(e)) => format!("{e:#}"),
            Err(panic) => {
                let failure = describe_panic(&*panic);
                error!(
                    queue_name = %self.queue_name,
                    message_id = %envelope.id(),
                    error = %failure,
                    "Consumer panicked"
                );
                failure
            }
        };

        match envelope.record_failure(failure) {
            RetryDecision::Retry(delay) => {
                warn!(
                    queue_name = %self.queue_name,
                    message_id = %envelope.id(),
                    retry_number = envelope.retry_number(),
                    delay_ms = delay.as_millis() as u64,
                    "Message processing failed, scheduling retry"
                );
                DispatchOutcome::Retry { envelope, delay }
            }
            RetryDecision::Exhausted => {
                self.fault_router.route(envelope, consumer.as_ref()).await;
                DispatchOutcome::Faulted
            }
        }
    }

    /// Fault an envelope that cannot be redelivered.
    ///
    /// `failure` is appended to the envelope's exceptions before the fault
    /// handler runs.
    pub async fn fault(&self, mut envelope: MessageEnvelope<T>, failure: String) {
        envelope.record_terminal_failure(failure);
        let consumer = self.factory.create_consumer();
        self.fault_router.route(envelope, consumer.as_ref()).await;
    }
}
