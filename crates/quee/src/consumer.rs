//! Consumer contract implemented by application code.

use crate::message::{FaultMessage, Message};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::any::Any;

#[cfg(test)]
#[path = "consumer_tests.rs"]
mod tests;

/// Handler for messages of type `T` arriving on one queue.
///
/// Any error returned from [`consume`](Consumer::consume) counts as a retryable
/// failure. Once the queue's retry schedule is exhausted the message is handed
/// to [`consume_fault`](Consumer::consume_fault) exactly once.
#[async_trait]
pub trait Consumer<T>: Send + Sync {
    /// Process one delivery attempt
    async fn consume(&self, message: Message<T>) -> anyhow::Result<()>;

    /// Handle a message whose retries are exhausted.
    ///
    /// Errors are logged and dropped; the fault has already been recorded.
    async fn consume_fault(&self, message: FaultMessage<T>) -> anyhow::Result<()>;
}

/// Failure description for a panic raised inside consumer code
pub(crate) fn describe_panic(payload: &(dyn Any + Send)) -> String {
    let detail = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string());
    format!("consumer panicked: {detail}")
}

/// Creates a fresh consumer for every delivered message
pub trait ConsumerFactory<T>: Send + Sync {
    fn create_consumer(&self) -> Box<dyn Consumer<T>>;
}

impl<T, C, F> ConsumerFactory<T> for F
where
    C: Consumer<T> + 'static,
    F: Fn() -> C + Send + Sync,
{
    fn create_consumer(&self) -> Box<dyn Consumer<T>> {
        Box::new(self())
    }
}

/// Transport tuning for a consumer registration
///
/// The in-process broker always runs a single reader and ignores these; they
/// are passed unchanged to [`Transport::subscribe`](crate::transport::Transport::subscribe).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerOptions {
    pub concurrency_limit: u32,
    pub prefetch_limit: u32,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        Self {
            concurrency_limit: 1,
            prefetch_limit: 0,
        }
    }
}
