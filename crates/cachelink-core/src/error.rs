//! Error types for cache operations.

use cachelink_storage::StorageError;

/// Errors raised by [`crate::CacheEngine`] and [`crate::ClearCoordinator`].
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// A required input was missing or malformed. Raised before any backend call.
    #[error("{0}")]
    Validation(String),

    /// The backend failed.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// A batched read returned a different number of replies than requested.
    #[error("cache: mget returned {actual} replies, expected {expected}")]
    CountMismatch { expected: usize, actual: usize },

    /// A background drain task stopped without producing a result.
    #[error("cache: background drain failed: {0}")]
    Drain(String),
}

impl CacheError {
    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Returns `true` for errors caused by caller input.
    #[must_use]
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }
}

/// Result type for cache operations.
pub type CacheResult<T> = Result<T, CacheError>;
