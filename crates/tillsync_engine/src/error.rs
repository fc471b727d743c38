//! Error types for the sync engine.

use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during sync operations.
///
/// Per-item application rejections are not errors at this level; they
/// arrive inside the batch response and are recorded on the affected
/// queue items.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Network or transport error. Affects the whole batch.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// Protocol error (malformed request or response body).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Local persistence failure.
    #[error("storage error: {0}")]
    Storage(#[from] tillsync_queue::StorageError),

    /// The request timed out before a response was received.
    #[error("operation timed out")]
    Timeout,
}

impl SyncError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Returns true if a later cycle may succeed without intervention.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport { retryable, .. } => *retryable,
            SyncError::Timeout => true,
            _ => false,
        }
    }
}
