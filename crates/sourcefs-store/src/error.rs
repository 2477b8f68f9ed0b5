use sourcefs_types::Hash;
use thiserror::Error;

/// Errors surfaced by the queued backing store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("local store failure: {0}")]
    LocalStore(String),

    #[error("invalid store configuration: {0}")]
    InvalidConfig(String),

    #[error("proxy hash missing for {hash}")]
    MissingProxyHash { hash: Hash },

    #[error("import failed for {hash}: {reason}")]
    ImportFailed { hash: Hash, reason: String },

    #[error("prefetch failed: {reason}")]
    PrefetchFailed { reason: String },

    #[error("import cancelled")]
    ImportCancelled,
}

impl StoreError {
    /// Clones the error for fan-out to every request in a failed batch.
    ///
    /// I/O errors are not `Clone`, so they collapse to their message.
    pub fn duplicate(&self) -> StoreError {
        match self {
            StoreError::Io(e) => StoreError::LocalStore(e.to_string()),
            StoreError::LocalStore(msg) => StoreError::LocalStore(msg.clone()),
            StoreError::InvalidConfig(msg) => StoreError::InvalidConfig(msg.clone()),
            StoreError::MissingProxyHash { hash } => {
                StoreError::MissingProxyHash { hash: *hash }
            }
            StoreError::ImportFailed { hash, reason } => StoreError::ImportFailed {
                hash: *hash,
                reason: reason.clone(),
            },
            StoreError::PrefetchFailed { reason } => StoreError::PrefetchFailed {
                reason: reason.clone(),
            },
            StoreError::ImportCancelled => StoreError::ImportCancelled,
        }
    }
}

/// Result alias for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_messages_non_empty() {
        let errors = [
            StoreError::LocalStore("rocksdb closed".to_string()),
            StoreError::MissingProxyHash { hash: Hash::zero() },
            StoreError::ImportFailed {
                hash: Hash::zero(),
                reason: "network".to_string(),
            },
            StoreError::PrefetchFailed {
                reason: "timeout".to_string(),
            },
            StoreError::ImportCancelled,
        ];
        for err in errors {
            assert!(!err.to_string().is_empty());
        }
    }

    #[test]
    fn test_duplicate_preserves_message() {
        let err = StoreError::ImportFailed {
            hash: Hash::zero(),
            reason: "boom".to_string(),
        };
        assert_eq!(err.duplicate().to_string(), err.to_string());
    }

    #[test]
    fn test_duplicate_collapses_io_to_message() {
        let err = StoreError::Io(std::io::Error::other("disk gone"));
        let dup = err.duplicate();
        assert!(matches!(dup, StoreError::LocalStore(_)));
        assert!(dup.to_string().contains("disk gone"));
    }
}
