//! In-process implementation of the transport contract.
//!
//! Messages are held as scheduled byte bodies per queue, so the full
//! encode/send/decode path can be exercised without a remote bus:
//! - delayed visibility through the same store used by the in-process broker
//! - de-duplication of pending message ids
//! - queues that can be marked unusable to simulate missing remote queues
//! - bounded concurrent handler calls per subscription

use crate::delivery::QueueStore;
use crate::error::QueueError;
use crate::message::{QueueName, Timestamp};
use crate::transport::{
    MessageHandler, SubscribeOptions, SubscriptionHandle, Transport, TransportMessage,
};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

#[cfg(test)]
#[path = "loopback_tests.rs"]
mod tests;

/// Loopback transport keeping every queue in memory
#[derive(Default)]
pub struct LoopbackTransport {
    queues: RwLock<HashMap<QueueName, Arc<QueueStore<TransportMessage>>>>,
    unusable: RwLock<HashSet<QueueName>>,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a queue as missing: sends fail and subscriptions are refused
    pub fn deny_queue(&self, queue_name: &QueueName) {
        self.unusable
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(queue_name.clone());
    }

    /// Messages waiting in `queue_name`, visible or not
    pub fn pending_count(&self, queue_name: &QueueName) -> usize {
        self.queues
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(queue_name)
            .map_or(0, |store| store.len())
    }

    fn is_usable(&self, queue_name: &QueueName) -> bool {
        !self
            .unusable
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(queue_name)
    }

    fn store(&self, queue_name: &QueueName) -> Arc<QueueStore<TransportMessage>> {
        if let Some(store) = self
            .queues
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(queue_name)
        {
            return store.clone();
        }

        self.queues
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(queue_name.clone())
            .or_insert_with(|| Arc::new(QueueStore::new(queue_name.clone())))
            .clone()
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn send(
        &self,
        queue_name: &QueueName,
        message: TransportMessage,
        delay: Duration,
    ) -> Result<(), QueueError> {
        if !self.is_usable(queue_name) {
            return Err(QueueError::QueueNotFound {
                queue_name: queue_name.to_string(),
            });
        }

        let id = message.id.clone();
        self.store(queue_name)
            .push(id, Timestamp::after(delay), message)
    }

    async fn subscribe(
        &self,
        queue_name: &QueueName,
        handler: Arc<dyn MessageHandler>,
        options: SubscribeOptions,
    ) -> Result<SubscriptionHandle, QueueError> {
        if !self.is_usable(queue_name) {
            return Err(QueueError::QueueNotFound {
                queue_name: queue_name.to_string(),
            });
        }

        debug!(
            queue_name = %queue_name,
            prefetch_limit = options.prefetch_limit,
            "Prefetch is not applicable to the loopback transport"
        );

        let store = self.store(queue_name);
        let cancel = CancellationToken::new();
        let limit = options.concurrency_limit.max(1) as usize;
        let task = tokio::spawn(receive_loop(
            store,
            handler,
            Arc::new(Semaphore::new(limit)),
            cancel.clone(),
        ));

        Ok(SubscriptionHandle::new(queue_name.clone(), cancel, task))
    }

    async fn ensure_queue_exists(&self, queue_name: &QueueName) -> bool {
        if !self.is_usable(queue_name) {
            return false;
        }
        self.store(queue_name);
        true
    }
}

async fn receive_loop(
    store: Arc<QueueStore<TransportMessage>>,
    handler: Arc<dyn MessageHandler>,
    permits: Arc<Semaphore>,
    cancel: CancellationToken,
) {
    let queue_name = store.queue_name().clone();
    let mut in_flight = JoinSet::new();

    loop {
        let permit = tokio::select! {
            _ = cancel.cancelled() => break,
            permit = permits.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let Some(message) = store.next_visible(&cancel).await else {
            break;
        };

        let handler = handler.clone();
        let task_queue = queue_name.clone();
        in_flight.spawn(async move {
            if let Err(e) = handler.on_message(message).await {
                handler.on_error(&task_queue, e).await;
            }
            drop(permit);
        });

        while let Some(finished) = in_flight.try_join_next() {
            if let Err(e) = finished {
                error!(queue_name = %queue_name, error = %e, "Message handler task failed");
            }
        }
    }

    while let Some(finished) = in_flight.join_next().await {
        if let Err(e) = finished {
            error!(queue_name = %queue_name, error = %e, "Message handler task failed");
        }
    }
}
