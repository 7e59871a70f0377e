//! Message types for queue operations including core domain identifiers.

use crate::error::ValidationError;
use crate::retry::{RetryDecision, RetryPolicy};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

/// Bounds every message type carried by the engine must satisfy
pub trait Payload: Clone + Send + Sync + 'static {}

impl<T> Payload for T where T: Clone + Send + Sync + 'static {}

// ============================================================================
// Core Domain Identifiers
// ============================================================================

/// Validated queue name with length and character restrictions
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueueName(String);

impl QueueName {
    /// Create new queue name with validation
    pub fn new(name: String) -> Result<Self, ValidationError> {
        if name.is_empty() || name.len() > 260 {
            return Err(ValidationError::OutOfRange {
                field: "queue_name".to_string(),
                message: "must be 1-260 characters".to_string(),
            });
        }

        if !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(ValidationError::InvalidFormat {
                field: "queue_name".to_string(),
                message: "only ASCII alphanumeric, hyphens, and underscores allowed".to_string(),
            });
        }

        if name.starts_with('-') || name.ends_with('-') || name.contains("--") {
            return Err(ValidationError::InvalidFormat {
                field: "queue_name".to_string(),
                message: "no leading/trailing hyphens or consecutive hyphens".to_string(),
            });
        }

        Ok(Self(name))
    }

    /// Get queue name as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for QueueName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for QueueName {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s.to_string())
    }
}

impl TryFrom<&str> for QueueName {
    type Error = ValidationError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value.to_string())
    }
}

/// Unique identifier for an envelope, stable across retries
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(String);

impl MessageId {
    /// Generate new random message ID
    pub fn new() -> Self {
        let id = uuid::Uuid::new_v4();
        Self(id.to_string())
    }

    /// Get message ID as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for MessageId {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(ValidationError::Required {
                field: "message_id".to_string(),
            });
        }

        Ok(Self(s.to_string()))
    }
}

/// Timestamp wrapper for consistent time handling
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    /// Create timestamp for current time
    pub fn now() -> Self {
        Self(Utc::now())
    }

    /// Create timestamp from DateTime
    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        Self(dt)
    }

    /// Timestamp `delay` from now, saturating at the latest representable instant
    pub fn after(delay: Duration) -> Self {
        Self::now().saturating_add(delay)
    }

    /// Add a std duration, saturating instead of overflowing
    pub fn saturating_add(&self, delay: Duration) -> Self {
        let shifted = chrono::Duration::from_std(delay)
            .ok()
            .and_then(|delta| self.0.checked_add_signed(delta))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        Self(shifted)
    }

    /// Time left until this instant; zero once it has passed
    pub fn duration_until(&self) -> Duration {
        (self.0 - Utc::now()).to_std().unwrap_or(Duration::ZERO)
    }

    /// Check whether this instant is now or in the past
    pub fn has_passed(&self) -> bool {
        self.0 <= Utc::now()
    }

    /// Get underlying DateTime
    pub fn as_datetime(&self) -> DateTime<Utc> {
        self.0
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.format("%Y-%m-%d %H:%M:%S%.3f UTC"))
    }
}

impl FromStr for Timestamp {
    type Err = chrono::ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let dt = s.parse::<DateTime<Utc>>()?;
        Ok(Self::from_datetime(dt))
    }
}

// ============================================================================
// Envelope
// ============================================================================

/// A payload wrapped with the retry and fault metadata the engine needs.
///
/// The envelope is created by a sender, mutated only by the consumer side when a
/// delivery attempt fails, and dropped on terminal success or terminal fault.
///
/// Invariants maintained by the methods below:
/// - `retry_number <= retry_delays.len()`; when equal the next failure is terminal.
/// - `process_not_before` never moves backwards.
/// - `id` and `target_queue` never change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageEnvelope<T> {
    id: MessageId,
    payload: T,
    target_queue: QueueName,
    process_not_before: Timestamp,
    retry_number: u32,
    retry_delays: Vec<Duration>,
    retry_exceptions: Vec<String>,
}

impl<T> MessageEnvelope<T> {
    /// Create a fresh envelope visible after `initial_delay`
    pub fn new(
        target_queue: QueueName,
        payload: T,
        initial_delay: Duration,
        retry_delays: Vec<Duration>,
    ) -> Self {
        Self {
            id: MessageId::new(),
            payload,
            target_queue,
            process_not_before: Timestamp::after(initial_delay),
            retry_number: 0,
            retry_delays,
            retry_exceptions: Vec::new(),
        }
    }

    pub fn id(&self) -> &MessageId {
        &self.id
    }

    pub fn payload(&self) -> &T {
        &self.payload
    }

    pub fn target_queue(&self) -> &QueueName {
        &self.target_queue
    }

    pub fn process_not_before(&self) -> Timestamp {
        self.process_not_before
    }

    pub fn retry_number(&self) -> u32 {
        self.retry_number
    }

    pub fn retry_delays(&self) -> &[Duration] {
        &self.retry_delays
    }

    pub fn retry_exceptions(&self) -> &[String] {
        &self.retry_exceptions
    }

    /// Check if the envelope may be dispatched now
    pub fn is_visible(&self) -> bool {
        self.process_not_before.has_passed()
    }

    /// Record a failed delivery attempt.
    ///
    /// The failure description is always appended. When the schedule still has
    /// an entry for the current attempt, the retry counter is advanced and the
    /// envelope is pushed back to `now + delay`; otherwise the envelope is left
    /// as-is for fault routing.
    pub(crate) fn record_failure(&mut self, failure: String) -> RetryDecision {
        self.retry_exceptions.push(failure);

        let decision = RetryPolicy::evaluate(self.retry_number, &self.retry_delays);
        if let RetryDecision::Retry(delay) = decision {
            self.retry_number += 1;
            let next = Timestamp::after(delay);
            if next > self.process_not_before {
                self.process_not_before = next;
            }
        }

        decision
    }

    /// Record a failure that ends delivery regardless of the remaining schedule
    pub(crate) fn record_terminal_failure(&mut self, failure: String) {
        self.retry_exceptions.push(failure);
    }

    /// Consume the envelope into the record handed to a fault handler
    pub fn into_fault(self) -> FaultMessage<T> {
        FaultMessage {
            message_id: self.id,
            payload: self.payload,
            exceptions: self.retry_exceptions,
        }
    }
}

impl<T: Clone> MessageEnvelope<T> {
    /// View of the envelope handed to a consumer for one delivery attempt
    pub fn message(&self) -> Message<T> {
        Message {
            message_id: self.id.clone(),
            payload: self.payload.clone(),
            retry_number: self.retry_number,
        }
    }
}

// ============================================================================
// Consumer-facing Views
// ============================================================================

/// A message as delivered to `Consumer::consume`
#[derive(Debug, Clone)]
pub struct Message<T> {
    pub message_id: MessageId,
    pub payload: T,
    /// Number of earlier failed attempts for this message
    pub retry_number: u32,
}

/// A message whose retries are exhausted, as delivered to `Consumer::consume_fault`
#[derive(Debug, Clone)]
pub struct FaultMessage<T> {
    pub message_id: MessageId,
    pub payload: T,
    /// Failure descriptions in attempt order
    pub exceptions: Vec<String>,
}

#[cfg(test)]
#[path = "message_tests.rs"]
mod tests;
