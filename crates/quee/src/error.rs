//! Error types for queue operations.
//!
//! Only transmission failures, registration conflicts and configuration errors
//! ever reach application code. Consumption failures are absorbed by the
//! retry/fault protocol and are observable only through tracking.

use thiserror::Error;

/// Comprehensive error type for all queue operations
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Failed to transmit message to queue '{queue_name}': {message}")]
    TransmissionFailure { queue_name: String, message: String },

    #[error("A {role} is already registered for queue '{queue_name}' ({message_type})")]
    RegistrationConflict {
        role: RegistrationRole,
        queue_name: String,
        message_type: &'static str,
    },

    #[error("No sender registered for message type {message_type}")]
    SenderNotRegistered { message_type: &'static str },

    #[error("Queue '{queue_name}' carries a different message type than {expected}")]
    MessageTypeMismatch {
        queue_name: String,
        expected: &'static str,
    },

    #[error("Message '{message_id}' is already pending in queue '{queue_name}'")]
    DuplicateMessage {
        queue_name: String,
        message_id: String,
    },

    #[error("Queue not found or unusable: {queue_name}")]
    QueueNotFound { queue_name: String },

    #[error("Queue system is already running")]
    AlreadyStarted,

    #[error("Serialization failed: {0}")]
    SerializationError(#[from] SerializationError),

    #[error("Configuration error: {0}")]
    ConfigurationError(#[from] ConfigurationError),

    #[error("Validation error: {0}")]
    ValidationError(#[from] ValidationError),
}

impl QueueError {
    /// Check if the error was raised while assembling the queue system
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            Self::RegistrationConflict { .. }
                | Self::ConfigurationError(_)
                | Self::ValidationError(_)
        )
    }

    pub(crate) fn transmission(queue_name: impl Into<String>, cause: impl std::fmt::Display) -> Self {
        Self::TransmissionFailure {
            queue_name: queue_name.into(),
            message: cause.to_string(),
        }
    }
}

/// Side of a queue a registration claims
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationRole {
    Sender,
    Consumer,
}

impl std::fmt::Display for RegistrationRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sender => write!(f, "sender"),
            Self::Consumer => write!(f, "consumer"),
        }
    }
}

/// Errors during envelope serialization/deserialization
#[derive(Debug, Error)]
pub enum SerializationError {
    #[error("JSON serialization failed: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Envelope addressed to '{actual}' arrived on queue '{expected}'")]
    QueueMismatch { expected: String, actual: String },
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Configuration parsing failed: {message}")]
    Parsing { message: String },
}

/// Validation errors
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Required field missing: {field}")]
    Required { field: String },

    #[error("Invalid format for {field}: {message}")]
    InvalidFormat { field: String, message: String },

    #[error("Value out of range for {field}: {message}")]
    OutOfRange { field: String, message: String },
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
