//! Queue system settings.
//!
//! Sources (applied in order, later sources override earlier ones):
//!  1. An optional settings file (YAML or TOML, chosen by extension)
//!  2. Environment variables prefixed `QUEE__` with a double-underscore
//!     separator, e.g. `QUEE__MONITOR__POLL_INTERVAL_MS=50`
//!
//! Every field carries a serde default, so an empty environment produces a
//! valid configuration. Values that cannot be coerced to the right type are
//! parsing errors; values of the right type but out of range are rejected by
//! [`QueueSettings::validate`].

use crate::consumer::ConsumerOptions;
use crate::error::{ConfigurationError, QueueError};
use crate::message::QueueName;
use crate::monitor::DEFAULT_POLL_INTERVAL;
use crate::retry::RetryOptions;
use crate::tracking::DEFAULT_MAXIMUM_MESSAGES_PER_QUEUE;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;

/// Environment variable prefix for settings overrides
pub const ENV_PREFIX: &str = "QUEE";

/// Top-level settings for a queue system
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    /// Global retry switch; when false every queue faults on first failure
    pub allow_retries: bool,

    pub tracking: TrackingSettings,

    pub monitor: MonitorSettings,

    /// Per-queue settings keyed by queue name
    pub queues: BTreeMap<String, QueueEntrySettings>,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            allow_retries: true,
            tracking: TrackingSettings::default(),
            monitor: MonitorSettings::default(),
            queues: BTreeMap::new(),
        }
    }
}

/// Message tracking settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackingSettings {
    pub enabled: bool,

    /// Ring buffer capacity per queue and event kind
    pub maximum_messages_per_queue: usize,
}

impl Default for TrackingSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            maximum_messages_per_queue: DEFAULT_MAXIMUM_MESSAGES_PER_QUEUE,
        }
    }
}

/// Queue monitor settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorSettings {
    pub poll_interval_ms: u64,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: DEFAULT_POLL_INTERVAL.as_millis() as u64,
        }
    }
}

impl MonitorSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Settings for a single queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueEntrySettings {
    /// Backoff schedule in milliseconds; empty means fault on first failure
    pub retry_delays_ms: Vec<u64>,

    pub concurrency_limit: u32,

    pub prefetch_limit: u32,
}

impl Default for QueueEntrySettings {
    fn default() -> Self {
        let options = ConsumerOptions::default();
        Self {
            retry_delays_ms: Vec::new(),
            concurrency_limit: options.concurrency_limit,
            prefetch_limit: options.prefetch_limit,
        }
    }
}

impl QueueEntrySettings {
    pub fn retry_delays(&self) -> Vec<Duration> {
        self.retry_delays_ms
            .iter()
            .map(|ms| Duration::from_millis(*ms))
            .collect()
    }

    pub fn consumer_options(&self) -> ConsumerOptions {
        ConsumerOptions {
            concurrency_limit: self.concurrency_limit,
            prefetch_limit: self.prefetch_limit,
        }
    }
}

impl QueueSettings {
    /// Load settings from an optional file plus `QUEE__` environment overrides, then validate
    pub fn load(path: Option<&Path>) -> Result<Self, QueueError> {
        Self::load_with_environment(
            path,
            config::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        )
    }

    pub(crate) fn load_with_environment(
        path: Option<&Path>,
        environment: config::Environment,
    ) -> Result<Self, QueueError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        let settings: QueueSettings = builder
            .add_source(environment)
            .build()
            .and_then(|config| config.try_deserialize())
            .map_err(|e| ConfigurationError::Parsing {
                message: e.to_string(),
            })?;

        settings.validate()?;
        Ok(settings)
    }

    /// Reject values that deserialize but cannot be used
    pub fn validate(&self) -> Result<(), QueueError> {
        if self.tracking.enabled && self.tracking.maximum_messages_per_queue < 1 {
            return Err(invalid(
                "tracking.maximum_messages_per_queue must be at least 1",
            ));
        }

        if self.monitor.poll_interval_ms == 0 {
            return Err(invalid("monitor.poll_interval_ms must be positive"));
        }

        for (name, entry) in &self.queues {
            QueueName::new(name.clone())?;
            if entry.concurrency_limit < 1 {
                return Err(invalid(&format!(
                    "queues.{name}.concurrency_limit must be at least 1"
                )));
            }
        }

        Ok(())
    }

    pub fn retry_options(&self) -> RetryOptions {
        RetryOptions {
            allow_retries: self.allow_retries,
        }
    }

    /// Settings for `queue_name`, falling back to defaults when absent
    pub fn queue(&self, queue_name: &QueueName) -> QueueEntrySettings {
        self.queues
            .get(queue_name.as_str())
            .cloned()
            .unwrap_or_default()
    }
}

fn invalid(message: &str) -> QueueError {
    ConfigurationError::Invalid {
        message: message.to_string(),
    }
    .into()
}
