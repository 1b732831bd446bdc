//! Error handling for the gantry-common crate.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Engine-wide error type shared by every component.
///
/// This enum provides structured error types with support for error chaining
/// and rich context. Variants map one-to-one onto the failure modes a caller
/// can observe: rejected submissions, illegal state transitions, unknown
/// resources, closed sessions, deadlines, and worker contract violations.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Invalid definition: {message}")]
    Validation { message: String },

    #[error("Dependency cycle detected: {message}")]
    Cycle { message: String },

    #[error("Invalid state transition: {message}")]
    InvalidState { message: String },

    #[error("Resource not found: {message}")]
    NotFound { message: String },

    #[error("Session is closed")]
    SessionClosed,

    #[error("Timeout occurred: {message}")]
    Timeout { message: String },

    #[error("Task {task_id} reported success with unwritten outputs: {missing:?}")]
    IncompleteOutputs {
        task_id: String,
        missing: Vec<String>,
    },

    #[error("{} awaited output(s) ended in error", failures.len())]
    OutputsFailed { failures: Vec<BlobFailure> },

    #[error("Internal error: {message}")]
    Internal {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },
}

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

/// A single failed awaited output, as surfaced by [`EngineError::OutputsFailed`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlobFailure {
    pub blob_id: String,
    pub cause: FailureCause,
}

/// The cause attached to a blob that reached the Error state.
///
/// Unlike [`EngineError`], causes are cloned freely: the same cause travels
/// to listeners, to every downstream dependent, and into the aggregate
/// await result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureCause {
    /// The worker reported a non-retriable application error.
    Application { message: String },
    /// The task exceeded its configured max duration.
    Timeout,
    /// The worker body panicked or the execution slot was lost.
    WorkerCrash { message: String },
    /// No processor is registered for the requested worker library.
    UnknownLibrary { library: String },
    /// The worker reported success without writing every declared output.
    IncompleteOutputs { missing: Vec<String> },
    /// Transient failures exhausted the task's retry budget.
    RetriesExhausted { attempts: u32, last: String },
    /// An input blob of the producing task ended in error.
    UpstreamFailed { blob_id: String },
}

impl fmt::Display for FailureCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Application { message } => write!(f, "application error: {message}"),
            Self::Timeout => write!(f, "task exceeded max duration"),
            Self::WorkerCrash { message } => write!(f, "worker crashed: {message}"),
            Self::UnknownLibrary { library } => {
                write!(f, "no worker registered for library '{library}'")
            }
            Self::IncompleteOutputs { missing } => {
                write!(f, "declared outputs never written: {missing:?}")
            }
            Self::RetriesExhausted { attempts, last } => {
                write!(f, "failed after {attempts} retries, last error: {last}")
            }
            Self::UpstreamFailed { blob_id } => {
                write!(f, "upstream blob {blob_id} ended in error")
            }
        }
    }
}

impl FailureCause {
    /// Whether the scheduler may redispatch a task that failed with this cause.
    ///
    /// Upstream failures are never retriable: redispatching the dependent
    /// cannot heal an input that already reached its terminal Error state.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::Timeout | Self::WorkerCrash { .. })
    }
}

impl EngineError {
    /// Create a validation error with a custom message.
    pub fn validation<S: Into<String>>(message: S) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Create a cycle error with a custom message.
    pub fn cycle<S: Into<String>>(message: S) -> Self {
        Self::Cycle {
            message: message.into(),
        }
    }

    /// Create an invalid-state error with a custom message.
    pub fn invalid_state<S: Into<String>>(message: S) -> Self {
        Self::InvalidState {
            message: message.into(),
        }
    }

    /// Create a not-found error with a custom message.
    pub fn not_found<S: Into<String>>(message: S) -> Self {
        Self::NotFound {
            message: message.into(),
        }
    }

    /// Create a timeout error with a custom message.
    pub fn timeout<S: Into<String>>(message: S) -> Self {
        Self::Timeout {
            message: message.into(),
        }
    }

    /// Create an internal error with a custom message.
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
            source: None,
        }
    }

    /// Create an internal error with a custom message and source error.
    pub fn internal_with_source<S: Into<String>, E: Into<anyhow::Error>>(
        message: S,
        source: E,
    ) -> Self {
        Self::Internal {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// True for errors a caller may resolve by retrying the same call later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}
