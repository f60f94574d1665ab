use thiserror::Error;

/// Result type for repository operations.
pub type Result<T> = std::result::Result<T, StorageError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    #[error("invalid model: {0}")]
    InvalidModel(String),
    #[error("already exists: {0}")]
    Duplicate(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("failed to open log: {0}")]
    LogOpen(String),
    #[error("failed to read log: {0}")]
    LogRead(String),
    #[error("failed to write log: {0}")]
    LogWrite(String),
    #[error("malformed log record: {0}")]
    LogStructure(String),
    #[error("storage backend unavailable: {0}")]
    Unavailable(String),
    #[error("storage operation timed out: {0}")]
    Timeout(String),
    #[error("storage query failed: {0}")]
    Query(String),
    #[error("stored data is invalid: {0}")]
    InvalidData(String),
    #[error("operation cancelled: {0}")]
    Cancelled(String),
    #[error("batch delete failed for {failed} id(s): {first}")]
    BatchDelete {
        failed: usize,
        first: Box<StorageError>,
    },
}

impl StorageError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::Duplicate(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_delete_display_includes_first_cause() {
        let err = StorageError::BatchDelete {
            failed: 3,
            first: Box::new(StorageError::LogWrite("disk full".to_string())),
        };
        assert_eq!(
            err.to_string(),
            "batch delete failed for 3 id(s): failed to write log: disk full"
        );
    }

    #[test]
    fn kind_helpers() {
        assert!(StorageError::NotFound("x".into()).is_not_found());
        assert!(StorageError::Duplicate("x".into()).is_duplicate());
        assert!(!StorageError::Query("x".into()).is_duplicate());
    }
}
