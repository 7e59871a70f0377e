//! Bounded per-queue event log for observing asynchronous delivery.
//!
//! Every queue gets three ring buffers, one per [`EventKind`]. When a buffer is
//! full the oldest event is evicted, so the log is a window onto recent
//! traffic and never a durable record.

use crate::error::{ConfigurationError, QueueError};
use crate::message::{QueueName, Timestamp};
use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

#[cfg(test)]
#[path = "tracking_tests.rs"]
mod tests;

/// Default ring buffer capacity per (queue, kind)
pub const DEFAULT_MAXIMUM_MESSAGES_PER_QUEUE: usize = 100_000;

/// Stage of delivery a tracked event represents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Sent,
    Received,
    Faulted,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sent => write!(f, "sent"),
            Self::Received => write!(f, "received"),
            Self::Faulted => write!(f, "faulted"),
        }
    }
}

/// Immutable record of a payload reaching a delivery stage
#[derive(Clone)]
pub struct TrackedEvent {
    payload: Arc<dyn Any + Send + Sync>,
    recorded_at: Timestamp,
}

impl TrackedEvent {
    fn new<T>(payload: T) -> Self
    where
        T: Send + Sync + 'static,
    {
        Self {
            payload: Arc::new(payload),
            recorded_at: Timestamp::now(),
        }
    }

    /// Payload if it is of type `T`
    pub fn payload<T: 'static>(&self) -> Option<&T> {
        self.payload.downcast_ref::<T>()
    }

    pub fn recorded_at(&self) -> Timestamp {
        self.recorded_at
    }
}

impl std::fmt::Debug for TrackedEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackedEvent")
            .field("recorded_at", &self.recorded_at)
            .finish_non_exhaustive()
    }
}

type EventLog = Arc<Mutex<VecDeque<TrackedEvent>>>;

/// Thread-safe tracker of sent, received and faulted payloads
#[derive(Debug)]
pub struct TrackingService {
    capacity: usize,
    logs: RwLock<HashMap<(QueueName, EventKind), EventLog>>,
}

impl TrackingService {
    /// Create a tracker keeping at most `capacity` events per queue and kind
    pub fn new(capacity: usize) -> Result<Self, QueueError> {
        if capacity < 1 {
            return Err(ConfigurationError::Invalid {
                message: "maximum messages per queue must be at least 1".to_string(),
            }
            .into());
        }

        Ok(Self {
            capacity,
            logs: RwLock::new(HashMap::new()),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn record_sent<T>(&self, queue_name: &QueueName, payload: T)
    where
        T: Send + Sync + 'static,
    {
        self.record(queue_name, EventKind::Sent, payload);
    }

    pub fn record_received<T>(&self, queue_name: &QueueName, payload: T)
    where
        T: Send + Sync + 'static,
    {
        self.record(queue_name, EventKind::Received, payload);
    }

    pub fn record_faulted<T>(&self, queue_name: &QueueName, payload: T)
    where
        T: Send + Sync + 'static,
    {
        self.record(queue_name, EventKind::Faulted, payload);
    }

    /// Append an event, evicting the oldest one when the buffer is full
    pub fn record<T>(&self, queue_name: &QueueName, kind: EventKind, payload: T)
    where
        T: Send + Sync + 'static,
    {
        let log = self.log(queue_name, kind);
        let mut events = log.lock().unwrap_or_else(PoisonError::into_inner);
        while events.len() >= self.capacity {
            events.pop_front();
        }
        events.push_back(TrackedEvent::new(payload));
    }

    /// Oldest retained payload of type `T` matching `predicate`
    pub fn try_find<T, P>(&self, queue_name: &QueueName, kind: EventKind, predicate: P) -> Option<T>
    where
        T: Clone + 'static,
        P: Fn(&T) -> bool,
    {
        let log = self.existing_log(queue_name, kind)?;
        let events = log.lock().unwrap_or_else(PoisonError::into_inner);
        events
            .iter()
            .filter_map(|event| event.payload::<T>())
            .find(|payload| predicate(payload))
            .cloned()
    }

    /// Snapshot of every retained event for a queue and kind, oldest first
    pub fn events(&self, queue_name: &QueueName, kind: EventKind) -> Vec<TrackedEvent> {
        self.existing_log(queue_name, kind)
            .map(|log| {
                log.lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .iter()
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn count(&self, queue_name: &QueueName, kind: EventKind) -> usize {
        self.existing_log(queue_name, kind)
            .map_or(0, |log| log.lock().unwrap_or_else(PoisonError::into_inner).len())
    }

    fn existing_log(&self, queue_name: &QueueName, kind: EventKind) -> Option<EventLog> {
        self.logs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(queue_name.clone(), kind))
            .cloned()
    }

    fn log(&self, queue_name: &QueueName, kind: EventKind) -> EventLog {
        if let Some(log) = self.existing_log(queue_name, kind) {
            return log;
        }

        self.logs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry((queue_name.clone(), kind))
            .or_default()
            .clone()
    }
}

impl Default for TrackingService {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_MAXIMUM_MESSAGES_PER_QUEUE,
            logs: RwLock::new(HashMap::new()),
        }
    }
}
