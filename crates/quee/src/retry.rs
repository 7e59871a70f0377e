//! # Retry Policy Module
//!
//! Decides whether a failed delivery may be retried and how long to wait first.
//!
//! Backoff is a fixed schedule registered per queue: the n-th retry waits
//! `retry_delays[n]`. An empty schedule means the first failure is terminal.
//!
//! # Examples
//!
//! ```rust
//! use quee::retry::{RetryDecision, RetryPolicy};
//! use std::time::Duration;
//!
//! let delays = [Duration::from_millis(100), Duration::from_millis(200)];
//!
//! assert_eq!(
//!     RetryPolicy::evaluate(0, &delays),
//!     RetryDecision::Retry(Duration::from_millis(100))
//! );
//! assert_eq!(RetryPolicy::evaluate(2, &delays), RetryDecision::Exhausted);
//! ```

use std::time::Duration;

/// Outcome of evaluating a failed delivery against its retry schedule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Redeliver after the given delay
    Retry(Duration),

    /// No retries left; the envelope goes to fault handling
    Exhausted,
}

impl RetryDecision {
    pub fn is_exhausted(&self) -> bool {
        matches!(self, Self::Exhausted)
    }
}

/// Pure retry decision function over a fixed backoff schedule
#[derive(Debug, Clone, Copy, Default)]
pub struct RetryPolicy;

impl RetryPolicy {
    /// Evaluate a failure for an envelope that has already failed `retry_number` times
    ///
    /// # Arguments
    ///
    /// * `retry_number` - Count of earlier failed attempts (0 on first failure)
    /// * `retry_delays` - The envelope's backoff schedule
    pub fn evaluate(retry_number: u32, retry_delays: &[Duration]) -> RetryDecision {
        match retry_delays.get(retry_number as usize) {
            Some(delay) => RetryDecision::Retry(*delay),
            None => RetryDecision::Exhausted,
        }
    }
}

/// Process-wide retry switch.
///
/// Applied once when an envelope is created, so disabling retries never
/// changes the schedule of envelopes that are already enqueued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryOptions {
    /// When false every queue ignores its registered schedule
    pub allow_retries: bool,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            allow_retries: true,
        }
    }
}

impl RetryOptions {
    /// Options with retries switched off
    pub fn disabled() -> Self {
        Self {
            allow_retries: false,
        }
    }

    /// Schedule to stamp on a new envelope given the registered one
    pub fn effective_delays(&self, registered: &[Duration]) -> Vec<Duration> {
        if self.allow_retries {
            registered.to_vec()
        } else {
            Vec::new()
        }
    }
}

#[cfg(test)]
#[path = "retry_tests.rs"]
mod tests;
