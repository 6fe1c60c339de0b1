//! Error types for the kairo runtime.
//!
//! Every failure surfaced to a caller maps to one of the kinds below.
//! Each kind knows the HTTP status the transport should answer with and
//! whether the work queue should redeliver the step that produced it:
//! executor faults are retried (at-least-once delivery), logic errors
//! are acknowledged so the queue does not loop on a bad instruction.

use thiserror::Error;

/// A type alias for `Result<T, Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// The main error type for runtime operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Bad or missing parameters in a request.
    #[error("validation error: {message}")]
    Validation {
        /// Description of the invalid input.
        message: String,
    },

    /// The referenced session (or other resource) does not exist.
    #[error("not found: {resource}")]
    NotFound {
        /// The resource that could not be located.
        resource: String,
    },

    /// The request is valid but the session is in the wrong state.
    #[error("conflict: {message}")]
    Conflict {
        /// Description of the state mismatch.
        message: String,
    },

    /// A transient backend (state store or event stream) fault.
    #[error("store unavailable: {message}")]
    StoreUnavailable {
        /// The underlying error message.
        message: String,
    },

    /// An instruction executor failed.
    #[error("executor fault in '{instruction}': {message}")]
    Executor {
        /// The instruction tag that was executing.
        instruction: String,
        /// The underlying error message.
        message: String,
    },

    /// The runner produced an instruction the engine cannot execute.
    #[error("logic error: {message}")]
    Logic {
        /// Description of the invalid decision.
        message: String,
    },

    /// The work queue rejected or failed a scheduling call.
    #[error("queue error: {message}")]
    Queue {
        /// The underlying error message.
        message: String,
    },

    /// JSON serialization or deserialization failure.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Create a validation error.
    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Create a not-found error for the given resource.
    #[must_use]
    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::NotFound {
            resource: resource.into(),
        }
    }

    /// Create a conflict error.
    #[must_use]
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict {
            message: message.into(),
        }
    }

    /// Create a store-unavailable error.
    #[must_use]
    pub fn store(message: impl Into<String>) -> Self {
        Self::StoreUnavailable {
            message: message.into(),
        }
    }

    /// Create an executor fault for the given instruction tag.
    #[must_use]
    pub fn executor(instruction: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Executor {
            instruction: instruction.into(),
            message: message.into(),
        }
    }

    /// Create a logic error.
    #[must_use]
    pub fn logic(message: impl Into<String>) -> Self {
        Self::Logic {
            message: message.into(),
        }
    }

    /// Create a queue error.
    #[must_use]
    pub fn queue(message: impl Into<String>) -> Self {
        Self::Queue {
            message: message.into(),
        }
    }

    /// The HTTP status code the transport layer should answer with.
    #[must_use]
    pub const fn http_status(&self) -> u16 {
        match self {
            Self::Validation { .. } | Self::Json(_) => 400,
            Self::NotFound { .. } => 404,
            Self::Conflict { .. } => 409,
            Self::StoreUnavailable { .. } => 503,
            Self::Executor { .. } | Self::Queue { .. } => 500,
            // Logic errors are acknowledged with 200 so the queue does
            // not redeliver; the session itself transitions to error.
            Self::Logic { .. } => 200,
        }
    }

    /// Whether the work queue should redeliver the step that hit this error.
    #[must_use]
    pub const fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::StoreUnavailable { .. } | Self::Executor { .. } | Self::Queue { .. }
        )
    }
}

#[cfg(feature = "redis-backend")]
impl From<redis::RedisError> for Error {
    fn from(err: redis::RedisError) -> Self {
        Self::StoreUnavailable {
            message: err.to_string(),
        }
    }
}

#[cfg(feature = "http-queue")]
impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Self::Queue {
            message: err.to_string(),
        }
    }
}
