//! Error types for the engine

use thiserror::Error;

/// Engine result type
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors that can occur in the optimization engine
#[derive(Error, Debug)]
pub enum EngineError {
    /// Input failed validation (bad plan economics, empty eligible set, limit exceeded).
    /// Never retried; the affected group/instance is marked CompleteWithErrors.
    #[error("validation error: {0}")]
    Validation(String),

    /// Relational store failure (transient unless retries are exhausted)
    #[error("store error: {0}")]
    Store(String),

    /// Checkpoint store failure
    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    /// Entity lookup failed
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: u64 },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl EngineError {
    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a store error
    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    /// Create a checkpoint error
    pub fn checkpoint(msg: impl Into<String>) -> Self {
        Self::Checkpoint(msg.into())
    }

    /// Create a not-found error
    pub fn not_found(kind: &'static str, id: u64) -> Self {
        Self::NotFound { kind, id }
    }

    /// Whether this failure is worth retrying with backoff.
    ///
    /// Validation errors and lost claim races are permanent for the work item;
    /// store/checkpoint/IO failures may clear up.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Store(_) | Self::Checkpoint(_) | Self::Io(_)
        )
    }
}
