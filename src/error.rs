use std::sync::Arc;

use thiserror::Error;

/// Failures reported by a [`StorageProvider`](crate::traits::StorageProvider).
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Storage quota exceeded while writing '{key}'")]
    QuotaExceeded { key: String },
    #[error("Storage backend error: {0}")]
    Backend(String),
    #[error("Storage is corrupted: {0}")]
    Corrupted(String),
    #[error("Invalid data for '{key}': {reason}")]
    InvalidData { key: String, reason: String },
}

impl StorageError {
    /// Transient failures may go away once some data is evicted. Anything else is surfaced to the caller as-is.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, StorageError::QuotaExceeded { .. } | StorageError::Backend(_))
    }
}

#[derive(Error, Debug, Clone)]
pub enum StoreError {
    #[error(transparent)]
    Storage(Arc<StorageError>),
    #[error("Key '{key}' is not a member of collection {}", collection.as_deref().unwrap_or("<none>"))]
    NotACollectionMember { collection: Option<String>, key: String },
    #[error("Invalid collection update: {0}")]
    InvalidCollection(String),
    #[error("Store has been dropped")]
    StoreGone,
}

impl StoreError {
    pub fn storage(&self) -> Option<&StorageError> {
        match self {
            StoreError::Storage(err) => Some(err),
            _ => None,
        }
    }
}

impl From<StorageError> for StoreError {
    fn from(err: StorageError) -> Self {
        StoreError::Storage(Arc::new(err))
    }
}

pub type Result<T, E = StoreError> = std::result::Result<T, E>;
