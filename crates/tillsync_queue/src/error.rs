//! Error types for queue storage operations.

use std::io;
use thiserror::Error;

/// Result type for queue storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur while persisting or loading the queue.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The persisted snapshot could not be parsed.
    #[error("snapshot corrupted: {0}")]
    Corrupted(String),

    /// A referenced item does not exist in the queue.
    #[error("unknown queue item: {0}")]
    UnknownItem(uuid::Uuid),
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Corrupted(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let id = uuid::Uuid::nil();
        let err = StorageError::UnknownItem(id);
        assert!(err.to_string().contains("unknown queue item"));

        let err = StorageError::Corrupted("truncated".into());
        assert_eq!(err.to_string(), "snapshot corrupted: truncated");
    }
}
