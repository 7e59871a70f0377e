//! Producer side: wrap payloads in envelopes and hand them off.

use crate::delivery::DeliveryQueue;
use crate::error::QueueError;
use crate::message::{MessageEnvelope, MessageId, Payload, QueueName};
use crate::tracking::TrackingService;
use crate::transport::{encode_envelope, Transport};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error};

#[cfg(test)]
#[path = "sender_tests.rs"]
mod tests;

/// Sends messages of type `T` to one queue
#[async_trait]
pub trait QueueSender<T>: Send + Sync {
    /// Queue this sender writes to
    fn queue_name(&self) -> &QueueName;

    /// Send `payload`, invisible to consumers for `initial_delay`.
    ///
    /// The `sent` event is recorded only after a successful hand-off; any
    /// failure is reported as [`QueueError::TransmissionFailure`].
    async fn send(&self, payload: T, initial_delay: Duration) -> Result<MessageId, QueueError>;
}

fn transmission_failure(queue_name: &QueueName, e: QueueError) -> QueueError {
    match e {
        QueueError::TransmissionFailure { .. } => e,
        other => QueueError::transmission(queue_name.as_str(), other),
    }
}

// ============================================================================
// InMemorySender
// ============================================================================

/// Sender for the in-process broker
pub struct InMemorySender<T> {
    queue_name: QueueName,
    delivery: Arc<DeliveryQueue>,
    retry_delays: Vec<Duration>,
    tracking: Option<Arc<TrackingService>>,
    _payload: std::marker::PhantomData<fn(T)>,
}

impl<T: Payload> InMemorySender<T> {
    /// Create a sender stamping `retry_delays` on every envelope.
    ///
    /// The delays must already reflect the global retry switch.
    pub fn new(
        queue_name: QueueName,
        delivery: Arc<DeliveryQueue>,
        retry_delays: Vec<Duration>,
        tracking: Option<Arc<TrackingService>>,
    ) -> Self {
        Self {
            queue_name,
            delivery,
            retry_delays,
            tracking,
            _payload: std::marker::PhantomData,
        }
    }
}

#[async_trait]
impl<T: Payload> QueueSender<T> for InMemorySender<T> {
    fn queue_name(&self) -> &QueueName {
        &self.queue_name
    }

    async fn send(&self, payload: T, initial_delay: Duration) -> Result<MessageId, QueueError> {
        let envelope = MessageEnvelope::new(
            self.queue_name.clone(),
            payload.clone(),
            initial_delay,
            self.retry_delays.clone(),
        );
        let message_id = envelope.id().clone();

        if let Err(e) = self.delivery.enqueue(envelope) {
            error!(
                queue_name = %self.queue_name,
                message_id = %message_id,
                error = %e,
                "Failed to enqueue message"
            );
            return Err(transmission_failure(&self.queue_name, e));
        }

        if let Some(tracking) = &self.tracking {
            tracking.record_sent(&self.queue_name, payload);
        }

        debug!(
            queue_name = %self.queue_name,
            message_id = %message_id,
            delay_ms = initial_delay.as_millis() as u64,
            "Message enqueued"
        );
        Ok(message_id)
    }
}

// ============================================================================
// TransportSender
// ============================================================================

/// Sender that serializes envelopes and hands them to a transport
pub struct TransportSender<T> {
    queue_name: QueueName,
    transport: Arc<dyn Transport>,
    retry_delays: Vec<Duration>,
    tracking: Option<Arc<TrackingService>>,
    _payload: std::marker::PhantomData<fn(T)>,
}

impl<T> TransportSender<T>
where
    T: Payload + Serialize,
{
    pub fn new(
        queue_name: QueueName,
        transport: Arc<dyn Transport>,
        retry_delays: Vec<Duration>,
        tracking: Option<Arc<TrackingService>>,
    ) -> Self {
        Self {
            queue_name,
            transport,
            retry_delays,
            tracking,
            _payload: std::marker::PhantomData,
        }
    }
}

#[async_trait]
impl<T> QueueSender<T> for TransportSender<T>
where
    T: Payload + Serialize,
{
    fn queue_name(&self) -> &QueueName {
        &self.queue_name
    }

    async fn send(&self, payload: T, initial_delay: Duration) -> Result<MessageId, QueueError> {
        let envelope = MessageEnvelope::new(
            self.queue_name.clone(),
            payload,
            initial_delay,
            self.retry_delays.clone(),
        );
        let message_id = envelope.id().clone();

        let message =
            encode_envelope(&envelope).map_err(|e| transmission_failure(&self.queue_name, e))?;

        if let Err(e) = self
            .transport
            .send(&self.queue_name, message, initial_delay)
            .await
        {
            error!(
                queue_name = %self.queue_name,
                message_id = %message_id,
                error = %e,
                "Failed to send message to transport"
            );
            return Err(transmission_failure(&self.queue_name, e));
        }

        if let Some(tracking) = &self.tracking {
            tracking.record_sent(&self.queue_name, envelope.payload().clone());
        }

        debug!(
            queue_name = %self.queue_name,
            message_id = %message_id,
            delay_ms = initial_delay.as_millis() as u64,
            "Message sent to transport"
        );
        Ok(message_id)
    }
}
