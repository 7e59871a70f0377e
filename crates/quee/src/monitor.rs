//! Await delivery milestones by polling the tracking log.
//!
//! # Examples
//!
//! ```rust,no_run
//! # async fn example(monitor: quee::QueueMonitor) -> Result<(), quee::QueueError> {
//! use quee::QueueName;
//! use std::time::Duration;
//!
//! let orders = QueueName::new("orders".to_string())?;
//! let received = monitor
//!     .await_received(&orders, |order: &String| order == "order-1", Duration::from_secs(5))
//!     .await?;
//!
//! assert_eq!(received.as_deref(), Some("order-1"));
//! # Ok(())
//! # }
//! ```

use crate::error::{ConfigurationError, QueueError};
use crate::message::QueueName;
use crate::tracking::{EventKind, TrackingService};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[cfg(test)]
#[path = "monitor_tests.rs"]
mod tests;

/// Default interval between tracking log polls
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Polling wait over a [`TrackingService`]
#[derive(Debug, Clone)]
pub struct QueueMonitor {
    tracking: Arc<TrackingService>,
    poll_interval: Duration,
    cancel: CancellationToken,
}

impl QueueMonitor {
    pub fn new(tracking: Arc<TrackingService>) -> Self {
        Self {
            tracking,
            poll_interval: DEFAULT_POLL_INTERVAL,
            cancel: CancellationToken::new(),
        }
    }

    /// Set the poll interval; zero is rejected
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Result<Self, QueueError> {
        if poll_interval.is_zero() {
            return Err(ConfigurationError::Invalid {
                message: "monitor poll interval must be positive".to_string(),
            }
            .into());
        }
        self.poll_interval = poll_interval;
        Ok(self)
    }

    /// Stop waits early when `cancel` fires; a cancelled wait reports not found
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub async fn await_sent<T, P>(
        &self,
        queue_name: &QueueName,
        predicate: P,
        timeout: Duration,
    ) -> Result<Option<T>, QueueError>
    where
        T: Clone + 'static,
        P: Fn(&T) -> bool,
    {
        self.await_event(queue_name, EventKind::Sent, predicate, timeout)
            .await
    }

    pub async fn await_received<T, P>(
        &self,
        queue_name: &QueueName,
        predicate: P,
        timeout: Duration,
    ) -> Result<Option<T>, QueueError>
    where
        T: Clone + 'static,
        P: Fn(&T) -> bool,
    {
        self.await_event(queue_name, EventKind::Received, predicate, timeout)
            .await
    }

    pub async fn await_faulted<T, P>(
        &self,
        queue_name: &QueueName,
        predicate: P,
        timeout: Duration,
    ) -> Result<Option<T>, QueueError>
    where
        T: Clone + 'static,
        P: Fn(&T) -> bool,
    {
        self.await_event(queue_name, EventKind::Faulted, predicate, timeout)
            .await
    }

    /// Poll until a matching event appears, the timeout elapses or the
    /// monitor is cancelled.
    ///
    /// Returns `Ok(None)` on timeout and on cancellation. A zero timeout is a
    /// configuration error.
    pub async fn await_event<T, P>(
        &self,
        queue_name: &QueueName,
        kind: EventKind,
        predicate: P,
        timeout: Duration,
    ) -> Result<Option<T>, QueueError>
    where
        T: Clone + 'static,
        P: Fn(&T) -> bool,
    {
        self.await_event_until(queue_name, kind, predicate, timeout, &self.cancel)
            .await
    }

    /// Like [`await_event`](Self::await_event), but also stops when `cancel`
    /// fires. The monitor-wide token still applies.
    pub async fn await_event_until<T, P>(
        &self,
        queue_name: &QueueName,
        kind: EventKind,
        predicate: P,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Option<T>, QueueError>
    where
        T: Clone + 'static,
        P: Fn(&T) -> bool,
    {
        if timeout.is_zero() {
            return Err(ConfigurationError::Invalid {
                message: "monitor timeout must be positive".to_string(),
            }
            .into());
        }

        let deadline = Instant::now() + timeout;
        loop {
            if let Some(found) = self.tracking.try_find(queue_name, kind, &predicate) {
                return Ok(Some(found));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }

            let pause = self.poll_interval.min(deadline - now);
            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(None),
                _ = cancel.cancelled() => return Ok(None),
                _ = tokio::time::sleep(pause) => {}
            }
        }
    }
}
