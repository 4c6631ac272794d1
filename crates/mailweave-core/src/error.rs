//! Error types for the core library.

use thiserror::Error;

use crate::provider::ProviderError;
use crate::scheduler::SchedulerError;

/// Errors that can occur in session operations.
#[derive(Debug, Error)]
pub enum Error {
    /// A scheduled provider call failed or was cancelled.
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    /// Decoding a message or composing one failed.
    #[error("MIME error: {0}")]
    Mime(#[from] mailweave_mime::Error),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A background fetch task panicked or was aborted.
    #[error("Task failed: {0}")]
    Task(String),
}

impl Error {
    /// Returns the provider error behind a failed call, if any.
    #[must_use]
    pub const fn provider_error(&self) -> Option<&ProviderError> {
        match self {
            Self::Scheduler(error) => error.provider_error(),
            _ => None,
        }
    }

    /// Returns `true` for a compose request that was rejected before any
    /// network call.
    #[must_use]
    pub const fn is_structure(&self) -> bool {
        matches!(self, Self::Mime(error) if error.is_structure())
    }
}

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;
