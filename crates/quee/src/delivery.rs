//! Time-ordered delivery stores with delayed visibility.
//!
//! Each queue name owns one [`QueueStore`]: a binary heap keyed by
//! `(visible_at, insertion sequence)`. The head is peeked and compared against
//! the clock before anything is removed, so an invisible head never hands out
//! an item early. Items with equal visibility come out in insertion order;
//! items with different visibility come out in visibility order, which means a
//! delayed retry enqueued early can be served after a later immediate send.
//!
//! Stores are unbounded. Producers never wait on a slow consumer.
//!
//! # Example
//!
//! ```rust
//! use quee::delivery::QueueStore;
//! use quee::message::{MessageId, QueueName, Timestamp};
//! use tokio_util::sync::CancellationToken;
//!
//! # tokio_test::block_on(async {
//! let store = QueueStore::new(QueueName::new("orders".to_string()).unwrap());
//! store.push(MessageId::new(), Timestamp::now(), "first").unwrap();
//! store.push(MessageId::new(), Timestamp::now(), "second").unwrap();
//!
//! let cancel = CancellationToken::new();
//! assert_eq!(store.next_visible(&cancel).await, Some("first"));
//! assert_eq!(store.try_pop_visible(), Some("second"));
//! # });
//! ```

use crate::error::QueueError;
use crate::message::{MessageEnvelope, MessageId, QueueName, Timestamp};
use std::any::{type_name, Any};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::future::pending;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

#[cfg(test)]
#[path = "delivery_tests.rs"]
mod tests;

// ============================================================================
// Heap Entries
// ============================================================================

struct Scheduled<I> {
    visible_at: Timestamp,
    sequence: u64,
    id: MessageId,
    item: I,
}

impl<I> PartialEq for Scheduled<I> {
    fn eq(&self, other: &Self) -> bool {
        self.visible_at == other.visible_at && self.sequence == other.sequence
    }
}

impl<I> Eq for Scheduled<I> {}

impl<I> PartialOrd for Scheduled<I> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<I> Ord for Scheduled<I> {
    // BinaryHeap is a max-heap; reverse so the earliest entry is on top.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .visible_at
            .cmp(&self.visible_at)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

struct StoreState<I> {
    heap: BinaryHeap<Scheduled<I>>,
    pending_ids: HashSet<MessageId>,
    next_sequence: u64,
}

// ============================================================================
// QueueStore
// ============================================================================

/// Pending items for a single queue, ordered by visibility time
pub struct QueueStore<I> {
    queue_name: QueueName,
    state: Mutex<StoreState<I>>,
    notify: Notify,
}

impl<I> QueueStore<I> {
    /// Create an empty store for `queue_name`
    pub fn new(queue_name: QueueName) -> Self {
        Self {
            queue_name,
            state: Mutex::new(StoreState {
                heap: BinaryHeap::new(),
                pending_ids: HashSet::new(),
                next_sequence: 0,
            }),
            notify: Notify::new(),
        }
    }

    pub fn queue_name(&self) -> &QueueName {
        &self.queue_name
    }

    fn lock(&self) -> MutexGuard<'_, StoreState<I>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert an item that becomes visible at `visible_at`.
    ///
    /// Fails only when an item with the same id is already pending.
    pub fn push(&self, id: MessageId, visible_at: Timestamp, item: I) -> Result<(), QueueError> {
        {
            let mut state = self.lock();
            if !state.pending_ids.insert(id.clone()) {
                return Err(QueueError::DuplicateMessage {
                    queue_name: self.queue_name.to_string(),
                    message_id: id.to_string(),
                });
            }

            let sequence = state.next_sequence;
            state.next_sequence += 1;
            state.heap.push(Scheduled {
                visible_at,
                sequence,
                id,
                item,
            });
        }

        self.notify.notify_one();
        Ok(())
    }

    /// Remove and return the earliest item if it is visible now
    pub fn try_pop_visible(&self) -> Option<I> {
        let mut state = self.lock();
        Self::pop_if_visible(&mut state)
    }

    fn pop_if_visible(state: &mut StoreState<I>) -> Option<I> {
        let visible = state
            .heap
            .peek()
            .is_some_and(|head| head.visible_at.has_passed());
        if !visible {
            return None;
        }

        let entry = state.heap.pop()?;
        state.pending_ids.remove(&entry.id);
        Some(entry.item)
    }

    /// Visibility time of the earliest pending item
    pub fn next_visible_at(&self) -> Option<Timestamp> {
        self.lock().heap.peek().map(|head| head.visible_at)
    }

    pub fn len(&self) -> usize {
        self.lock().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().heap.is_empty()
    }

    /// Wait until an item is visible and take it.
    ///
    /// Returns `None` once `cancel` fires. Wakes on every push so a newly
    /// enqueued item that is visible sooner than the current head is not
    /// held up behind it.
    pub async fn next_visible(&self, cancel: &CancellationToken) -> Option<I> {
        loop {
            if cancel.is_cancelled() {
                return None;
            }

            let notified = self.notify.notified();
            let wait = {
                let mut state = self.lock();
                if let Some(item) = Self::pop_if_visible(&mut state) {
                    return Some(item);
                }
                state.heap.peek().map(|head| head.visible_at.duration_until())
            };

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return None,
                _ = notified => {}
                _ = async {
                    match wait {
                        Some(delay) => tokio::time::sleep(delay).await,
                        None => pending::<()>().await,
                    }
                } => {}
            }
        }
    }
}

// ============================================================================
// DeliveryQueue
// ============================================================================

/// Registry of per-queue envelope stores for the in-process broker.
///
/// Stores are created lazily on first use and live as long as the
/// `DeliveryQueue`. Each queue is bound to the message type it was first used
/// with; access with another type is rejected.
#[derive(Default)]
pub struct DeliveryQueue {
    stores: RwLock<HashMap<QueueName, Arc<dyn ErasedStore>>>,
}

impl DeliveryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create the store for `queue_name`
    pub fn store<T>(
        &self,
        queue_name: &QueueName,
    ) -> Result<Arc<QueueStore<MessageEnvelope<T>>>, QueueError>
    where
        T: Send + 'static,
    {
        let existing = self
            .stores
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(queue_name)
            .cloned();

        let erased = match existing {
            Some(store) => store,
            None => {
                let mut stores = self.stores.write().unwrap_or_else(PoisonError::into_inner);
                stores
                    .entry(queue_name.clone())
                    .or_insert_with(|| {
                        let store: Arc<dyn ErasedStore> =
                            Arc::new(QueueStore::<MessageEnvelope<T>>::new(queue_name.clone()));
                        store
                    })
                    .clone()
            }
        };

        erased
            .into_any()
            .downcast::<QueueStore<MessageEnvelope<T>>>()
            .map_err(|_| QueueError::MessageTypeMismatch {
                queue_name: queue_name.to_string(),
                expected: type_name::<T>(),
            })
    }

    /// Insert an envelope into its target queue, ordered by `process_not_before`
    pub fn enqueue<T>(&self, envelope: MessageEnvelope<T>) -> Result<(), QueueError>
    where
        T: Send + 'static,
    {
        let store = self.store::<T>(envelope.target_queue())?;
        let id = envelope.id().clone();
        let visible_at = envelope.process_not_before();
        store.push(id, visible_at, envelope)
    }

    /// Take the earliest envelope of `queue_name` if it is visible now
    pub fn try_dequeue_visible<T>(
        &self,
        queue_name: &QueueName,
    ) -> Result<Option<MessageEnvelope<T>>, QueueError>
    where
        T: Send + 'static,
    {
        Ok(self.store::<T>(queue_name)?.try_pop_visible())
    }

    /// Number of envelopes waiting in `queue_name`, visible or not
    pub fn pending_count(&self, queue_name: &QueueName) -> usize {
        self.stores
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(queue_name)
            .map_or(0, |store| store.pending())
    }
}

/// Type-erased view of a store so the registry can hold mixed payload types
trait ErasedStore: Send + Sync {
    fn pending(&self) -> usize;
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<I: Send + 'static> ErasedStore for QueueStore<I> {
    fn pending(&self) -> usize {
        self.len()
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}
