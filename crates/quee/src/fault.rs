//! Terminal failure handling.

use crate::consumer::{describe_panic, Consumer};
use crate::message::{MessageEnvelope, Payload};
use crate::tracking::TrackingService;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{error, info};

#[cfg(test)]
#[path = "fault_tests.rs"]
mod tests;

/// Routes exhausted envelopes to the consumer's fault handler.
///
/// The `faulted` event is recorded before the handler runs, so it is present
/// even when the handler fails. Handler failures and panics are logged and
/// dropped.
#[derive(Debug, Clone, Default)]
pub struct FaultRouter {
    tracking: Option<Arc<TrackingService>>,
}

impl FaultRouter {
    pub fn new(tracking: Option<Arc<TrackingService>>) -> Self {
        Self { tracking }
    }

    /// Record the fault and invoke `consume_fault` exactly once
    pub async fn route<T>(&self, envelope: MessageEnvelope<T>, consumer: &dyn Consumer<T>)
    where
        T: Payload,
    {
        let queue_name = envelope.target_queue().clone();
        let message_id = envelope.id().clone();

        if let Some(tracking) = &self.tracking {
            tracking.record_faulted(&queue_name, envelope.payload().clone());
        }

        info!(
            queue_name = %queue_name,
            message_id = %message_id,
            attempts = envelope.retry_exceptions().len(),
            "Message faulted after exhausting retries"
        );

        let failure = match AssertUnwindSafe(consumer.consume_fault(envelope.into_fault()))
            .catch_unwind()
            .await
        {
            Ok(Ok(())) => return,
            Ok(Err(e)) => format!("{e:#}"),
            Err(panic) => describe_panic(&*panic),
        };

        error!(
            queue_name = %queue_name,
            message_id = %message_id,
            error = %failure,
            "Fault handler failed"
        );
    }
}
