//! Transport contract and the consumer side of transport-backed queues.
//!
//! A [`Transport`] moves opaque byte bodies between processes. Envelopes are
//! encoded as JSON before they reach the transport, and the retry and fault
//! protocol runs on the receiving side exactly as it does in-process: a retry
//! is re-sent through the transport with the scheduled delay.

use crate::consumer::ConsumerOptions;
use crate::dispatch::{DispatchOutcome, Dispatcher};
use crate::error::{QueueError, SerializationError};
use crate::message::{MessageEnvelope, MessageId, Payload, QueueName};
use async_trait::async_trait;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[cfg(test)]
#[path = "transport_tests.rs"]
mod tests;

// ============================================================================
// Wire Types
// ============================================================================

/// Serialized envelope as handed to a transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportMessage {
    /// Envelope id, usable by transports for de-duplication
    pub id: MessageId,
    pub body: Bytes,
}

impl TransportMessage {
    pub fn new(id: MessageId, body: Bytes) -> Self {
        Self { id, body }
    }
}

/// Encode an envelope into its transport form
pub fn encode_envelope<T>(envelope: &MessageEnvelope<T>) -> Result<TransportMessage, QueueError>
where
    T: Serialize,
{
    let body = serde_json::to_vec(envelope).map_err(SerializationError::from)?;
    Ok(TransportMessage::new(envelope.id().clone(), Bytes::from(body)))
}

/// Decode a transport message received on `queue_name`
pub fn decode_envelope<T>(
    queue_name: &QueueName,
    message: &TransportMessage,
) -> Result<MessageEnvelope<T>, QueueError>
where
    T: DeserializeOwned,
{
    let envelope: MessageEnvelope<T> =
        serde_json::from_slice(&message.body).map_err(SerializationError::from)?;

    if envelope.target_queue() != queue_name {
        return Err(SerializationError::QueueMismatch {
            expected: queue_name.to_string(),
            actual: envelope.target_queue().to_string(),
        }
        .into());
    }

    Ok(envelope)
}

// ============================================================================
// Transport Contract
// ============================================================================

/// Subscription tuning forwarded to the transport unchanged
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscribeOptions {
    pub concurrency_limit: u32,
    pub prefetch_limit: u32,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        ConsumerOptions::default().into()
    }
}

impl From<ConsumerOptions> for SubscribeOptions {
    fn from(options: ConsumerOptions) -> Self {
        Self {
            concurrency_limit: options.concurrency_limit,
            prefetch_limit: options.prefetch_limit,
        }
    }
}

/// Receiver of messages from a transport subscription
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Handle one received message
    async fn on_message(&self, message: TransportMessage) -> Result<(), QueueError>;

    /// Called for receive failures and for messages `on_message` rejected
    async fn on_error(&self, queue_name: &QueueName, error: QueueError);
}

/// Interface implemented by queue transports (in-process or remote)
#[async_trait]
pub trait Transport: Send + Sync {
    /// Hand a message to the queue, invisible to receivers for `delay`
    async fn send(
        &self,
        queue_name: &QueueName,
        message: TransportMessage,
        delay: Duration,
    ) -> Result<(), QueueError>;

    /// Start delivering messages from `queue_name` to `handler`
    async fn subscribe(
        &self,
        queue_name: &QueueName,
        handler: Arc<dyn MessageHandler>,
        options: SubscribeOptions,
    ) -> Result<SubscriptionHandle, QueueError>;

    /// Best-effort check that the queue exists; false means it is unusable
    async fn ensure_queue_exists(&self, queue_name: &QueueName) -> bool;
}

/// Handle to a running subscription.
///
/// Dropping the handle stops the subscription; [`close`](Self::close) also
/// waits for in-flight messages to finish.
#[derive(Debug)]
pub struct SubscriptionHandle {
    queue_name: QueueName,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl SubscriptionHandle {
    pub fn new(queue_name: QueueName, cancel: CancellationToken, task: JoinHandle<()>) -> Self {
        Self {
            queue_name,
            cancel,
            task: Some(task),
        }
    }

    pub fn queue_name(&self) -> &QueueName {
        &self.queue_name
    }

    /// Stop receiving and wait for the subscription task to exit
    pub async fn close(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                error!(queue_name = %self.queue_name, error = %e, "Subscription task failed");
            }
        }
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// ============================================================================
// TransportConsumer
// ============================================================================

/// Applies the retry and fault protocol to messages arriving from a transport
pub struct TransportConsumer<T> {
    queue_name: QueueName,
    transport: Arc<dyn Transport>,
    dispatcher: Dispatcher<T>,
}

impl<T> TransportConsumer<T>
where
    T: Payload + Serialize + DeserializeOwned,
{
    pub fn new(transport: Arc<dyn Transport>, dispatcher: Dispatcher<T>) -> Self {
        Self {
            queue_name: dispatcher.queue_name().clone(),
            transport,
            dispatcher,
        }
    }

    pub fn queue_name(&self) -> &QueueName {
        &self.queue_name
    }

    /// Subscribe to the queue.
    ///
    /// Returns `Ok(None)` when the transport reports the queue as unusable; the
    /// consumer is then skipped rather than failing the whole system.
    pub async fn start(
        self: Arc<Self>,
        options: SubscribeOptions,
    ) -> Result<Option<SubscriptionHandle>, QueueError> {
        if !self.transport.ensure_queue_exists(&self.queue_name).await {
            error!(
                queue_name = %self.queue_name,
                "Queue does not exist or is unusable, consumer not started"
            );
            return Ok(None);
        }

        info!(
            queue_name = %self.queue_name,
            concurrency_limit = options.concurrency_limit,
            prefetch_limit = options.prefetch_limit,
            "Subscribing consumer to transport"
        );

        let transport = self.transport.clone();
        let queue_name = self.queue_name.clone();
        let handle = transport.subscribe(&queue_name, self, options).await?;
        Ok(Some(handle))
    }
}

#[async_trait]
impl<T> MessageHandler for TransportConsumer<T>
where
    T: Payload + Serialize + DeserializeOwned,
{
    async fn on_message(&self, message: TransportMessage) -> Result<(), QueueError> {
        let envelope = decode_envelope::<T>(&self.queue_name, &message)?;

        if let DispatchOutcome::Retry { envelope, delay } = self.dispatcher.dispatch(envelope).await {
            let resend = match encode_envelope(&envelope) {
                Ok(encoded) => self.transport.send(&self.queue_name, encoded, delay).await,
                Err(e) => Err(e),
            };

            if let Err(e) = resend {
                error!(
                    queue_name = %self.queue_name,
                    message_id = %envelope.id(),
                    error = %e,
                    "Failed to re-send message for retry, routing to fault handler"
                );
                self.dispatcher
                    .fault(envelope, format!("retry could not be scheduled: {e}"))
                    .await;
            }
        }

        Ok(())
    }

    async fn on_error(&self, queue_name: &QueueName, error: QueueError) {
        error!(
            queue_name = %queue_name,
            error = %error,
            "Transport message could not be processed"
        );
    }
}
