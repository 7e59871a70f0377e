//! # Quee
//!
//! Provider-agnostic message delivery engine: typed senders and consumers over
//! named queues, with the same delivery semantics on the in-process broker and
//! on any external transport.
//!
//! This library provides:
//! - Fixed-schedule retries with delayed redelivery
//! - Fault routing once retries are exhausted
//! - A single reader per queue for the in-process broker
//! - Bounded tracking of sent, received and faulted messages, with a monitor
//!   for awaiting them
//!
//! ## Module Organization
//!
//! - [`error`] - Error types for all queue operations
//! - [`message`] - Identifiers, envelopes and consumer-facing message views
//! - [`retry`] - Retry decisions over a backoff schedule
//! - [`delivery`] - Time-ordered per-queue stores
//! - [`consumer`], [`dispatch`], [`fault`], [`consumer_loop`] - Consumption side
//! - [`sender`] - Production side
//! - [`transport`], [`transports`] - Transport contract and implementations
//! - [`tracking`], [`monitor`] - Observability of delivery
//! - [`config`], [`system`] - Settings, assembly and lifecycle

pub mod config;
pub mod consumer;
pub mod consumer_loop;
pub mod delivery;
pub mod dispatch;
pub mod error;
pub mod fault;
pub mod message;
pub mod monitor;
pub mod retry;
pub mod sender;
pub mod system;
pub mod tracking;
pub mod transport;
pub mod transports;

#[cfg(test)]
mod testing;

// Re-export commonly used types at crate root for convenience
pub use config::{MonitorSettings, QueueEntrySettings, QueueSettings, TrackingSettings};
pub use consumer::{Consumer, ConsumerFactory, ConsumerOptions};
pub use error::{
    ConfigurationError, QueueError, RegistrationRole, SerializationError, ValidationError,
};
pub use message::{FaultMessage, Message, MessageEnvelope, MessageId, Payload, QueueName, Timestamp};
pub use monitor::QueueMonitor;
pub use retry::{RetryDecision, RetryOptions, RetryPolicy};
pub use sender::{InMemorySender, QueueSender, TransportSender};
pub use system::{QueueRegistry, QueueSystem, QueueSystemBuilder, RunningQueueSystem};
pub use tracking::{EventKind, TrackedEvent, TrackingService};
pub use transport::{
    MessageHandler, SubscribeOptions, SubscriptionHandle, Transport, TransportConsumer,
    TransportMessage,
};
pub use transports::LoopbackTransport;

#[cfg(test)]
#[path = "lib_tests.rs"]
mod tests;
