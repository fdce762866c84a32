//! Error types for the thred engine.
//!
//! Two layers:
//! - [`StoreError`] is what storage backends (keyed store, record store) return.
//! - [`ThredError`] is the engine-level taxonomy surfaced to the dispatcher's caller.
//!
//! Callers are expected to turn a [`ThredError`] into an error event addressed
//! back to the originating participant. [`ErrorCategory`] is the coarse,
//! safe-to-expose classification to build that event from.

use thiserror::Error;

use crate::keyed_store::Resource;

/// Failures raised by a storage backend.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("backend error: {0}")]
    Backend(String),

    #[error("store is closed")]
    Closed,
}

impl StoreError {
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend(message.into())
    }
}

/// Engine-level failures.
#[derive(Debug, Error)]
pub enum ThredError {
    /// A bound event referenced a thred that does not exist (or already ended).
    #[error("thred {thred_id} not found")]
    ThredNotFound { thred_id: String },

    /// A pattern's match predicate failed while testing an unbound event.
    #[error("pattern {pattern_id} failed to apply to event {event_id}: {message}")]
    PatternApplication {
        pattern_id: String,
        event_id: String,
        message: String,
    },

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("missing argument: {0}")]
    MissingArgument(String),

    #[error("invalid argument: {0}")]
    ArgumentValidation(String),

    /// The distributed lock could not be obtained within its retry budget.
    /// The guarded operation was not performed.
    #[error("could not acquire lock on {resources:?} after {attempts} attempts")]
    LockAcquisition {
        resources: Vec<Resource>,
        attempts: u32,
    },

    /// A stored thred references a pattern that is not in the cache.
    #[error("pattern {pattern_id} is not loaded")]
    PatternNotLoaded { pattern_id: String },

    #[error("pattern {pattern_id} has no reaction named {reaction}")]
    UnknownReaction { pattern_id: String, reaction: String },

    #[error("expression `{expression}` failed: {message}")]
    Expression { expression: String, message: String },

    #[error("delivery failed: {0}")]
    Delivery(#[source] anyhow::Error),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ThredError {
    pub fn expression(expression: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Expression {
            expression: expression.into(),
            message: message.into(),
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::ThredNotFound { .. } => ErrorCategory::NotFound,
            Self::Unauthorized(_) => ErrorCategory::Unauthorized,
            Self::MissingArgument(_)
            | Self::ArgumentValidation(_)
            | Self::Expression { .. }
            | Self::PatternApplication { .. } => ErrorCategory::InvalidInput,
            Self::LockAcquisition { .. } | Self::Store(_) | Self::Delivery(_) => {
                ErrorCategory::Unavailable
            }
            Self::PatternNotLoaded { .. }
            | Self::UnknownReaction { .. }
            | Self::Serialization(_) => ErrorCategory::Internal,
        }
    }

    /// True when the operation is known not to have been performed and can be
    /// submitted again as-is.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::LockAcquisition { .. } | Self::Store(_))
    }
}

/// Coarse error classification safe to expose to participants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    NotFound,
    Unauthorized,
    InvalidInput,
    Unavailable,
    Internal,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::Unauthorized => "unauthorized",
            Self::InvalidInput => "invalid_input",
            Self::Unavailable => "unavailable",
            Self::Internal => "internal",
        }
    }
}

pub type Result<T, E = ThredError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_failures_are_retryable_and_unavailable() {
        let err = ThredError::LockAcquisition {
            resources: vec![Resource::thred("t1")],
            attempts: 3,
        };
        assert!(err.is_retryable());
        assert_eq!(err.category(), ErrorCategory::Unavailable);
    }

    #[test]
    fn not_found_is_not_retryable() {
        let err = ThredError::ThredNotFound {
            thred_id: "t1".into(),
        };
        assert!(!err.is_retryable());
        assert_eq!(err.category().as_str(), "not_found");
    }
}
