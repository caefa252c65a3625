use async_trait::async_trait;
use std::collections::BTreeMap;
use std::collections::BTreeSet;

use crate::error::StorageError;
use crate::value::Value;

/// Persistent key/value backend the store writes through to.
///
/// Every operation may fail. A [recoverable](StorageError::is_recoverable) write failure makes the store evict some
/// data and retry before the failure reaches the caller.
#[async_trait]
pub trait StorageProvider: Send + Sync + 'static {
    /// Name of the backend, used in logs only.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    async fn get_item(&self, key: &str) -> Result<Option<Value>, StorageError>;
    async fn set_item(&self, key: &str, value: &Value) -> Result<(), StorageError>;
    async fn remove_item(&self, key: &str) -> Result<(), StorageError>;
    async fn get_all_keys(&self) -> Result<BTreeSet<String>, StorageError>;
    async fn clear(&self) -> Result<(), StorageError>;

    /// Deep-merge each patch into the persisted value using tombstone semantics.
    async fn multi_merge(&self, entries: &[(String, Value)]) -> Result<(), StorageError>;

    // The following implementations fall back to per-key operations.

    async fn multi_get(&self, keys: &[String]) -> Result<BTreeMap<String, Value>, StorageError> {
        let mut found = BTreeMap::new();
        for key in keys {
            if let Some(value) = self.get_item(key).await? {
                found.insert(key.clone(), value);
            }
        }
        Ok(found)
    }

    async fn multi_set(&self, entries: &[(String, Value)]) -> Result<(), StorageError> {
        for (key, value) in entries {
            self.set_item(key, value).await?;
        }
        Ok(())
    }

    async fn remove_items(&self, keys: &[String]) -> Result<(), StorageError> {
        for key in keys {
            self.remove_item(key).await?;
        }
        Ok(())
    }
}
