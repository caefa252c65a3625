//! In-memory [`StorageProvider`] with an optional key quota and write fault injection.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::time::Duration;

use crate::error::StorageError;
use crate::merge::merge;
use crate::traits::StorageProvider;
use crate::value::Value;

#[derive(Debug, Default)]
struct MemoryState {
    data:        BTreeMap<String, Value>,
    quota:       Option<usize>,
    fail_writes: usize,
    corrupt:     usize,
    reads:       usize,
    writes:      usize,
}

impl MemoryState {
    fn check_write<'k>(&mut self, keys: impl IntoIterator<Item = &'k String>) -> Result<(), StorageError> {
        if self.fail_writes > 0 {
            self.fail_writes -= 1;
            return Err(StorageError::Backend("injected write failure".to_string()));
        }
        if self.corrupt > 0 {
            self.corrupt -= 1;
            return Err(StorageError::Corrupted("injected corruption".to_string()));
        }

        if let Some(quota) = self.quota {
            let mut new_keys = 0;
            let mut first_new = None;
            for key in keys {
                if !self.data.contains_key(key) {
                    new_keys += 1;
                    first_new.get_or_insert_with(|| key.clone());
                }
            }
            if self.data.len() + new_keys > quota {
                return Err(StorageError::QuotaExceeded {
                    key: first_new.unwrap_or_default(),
                });
            }
        }

        self.writes += 1;
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryProvider {
    state:   Mutex<MemoryState>,
    latency: Option<Duration>,
}

impl MemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Limit the number of persisted keys. Writes introducing keys beyond the limit fail with
    /// [`StorageError::QuotaExceeded`].
    pub fn with_quota(self, max_keys: usize) -> Self {
        self.state.lock().quota = Some(max_keys);
        self
    }

    /// Delay every operation, making the backend behave like real I/O.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn with_data(self, data: impl IntoIterator<Item = (String, Value)>) -> Self {
        self.state.lock().data.extend(data);
        self
    }

    /// Make the next `count` write operations fail with a recoverable backend error.
    pub fn fail_next_writes(&self, count: usize) {
        self.state.lock().fail_writes = count;
    }

    /// Make the next `count` write operations fail with an unrecoverable error.
    pub fn corrupt_next_writes(&self, count: usize) {
        self.state.lock().corrupt = count;
    }

    pub fn snapshot(&self) -> BTreeMap<String, Value> {
        self.state.lock().data.clone()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.state.lock().data.contains_key(key)
    }

    pub fn value_of(&self, key: &str) -> Option<Value> {
        self.state.lock().data.get(key).cloned()
    }

    /// Number of successful write operations. A batch counts as one.
    pub fn write_count(&self) -> usize {
        self.state.lock().writes
    }

    /// Number of read operations. A batch counts as one.
    pub fn read_count(&self) -> usize {
        self.state.lock().reads
    }

    async fn io_delay(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl StorageProvider for MemoryProvider {
    fn name(&self) -> &str {
        "memory"
    }

    async fn get_item(&self, key: &str) -> Result<Option<Value>, StorageError> {
        self.io_delay().await;
        let mut state = self.state.lock();
        state.reads += 1;
        Ok(state.data.get(key).cloned())
    }

    async fn multi_get(&self, keys: &[String]) -> Result<BTreeMap<String, Value>, StorageError> {
        self.io_delay().await;
        let mut state = self.state.lock();
        state.reads += 1;
        Ok(keys
            .iter()
            .filter_map(|key| state.data.get(key).map(|value| (key.clone(), value.clone())))
            .collect())
    }

    async fn set_item(&self, key: &str, value: &Value) -> Result<(), StorageError> {
        self.io_delay().await;
        let mut state = self.state.lock();
        state.check_write([&key.to_string()])?;
        state.data.insert(key.to_string(), value.clone());
        Ok(())
    }

    async fn multi_set(&self, entries: &[(String, Value)]) -> Result<(), StorageError> {
        self.io_delay().await;
        let mut state = self.state.lock();
        state.check_write(entries.iter().map(|(key, _)| key))?;
        for (key, value) in entries {
            state.data.insert(key.clone(), value.clone());
        }
        Ok(())
    }

    async fn multi_merge(&self, entries: &[(String, Value)]) -> Result<(), StorageError> {
        self.io_delay().await;
        let mut state = self.state.lock();
        state.check_write(entries.iter().map(|(key, _)| key))?;
        for (key, patch) in entries {
            let merged = merge(state.data.get(key).unwrap_or(&Value::Null), patch, true);
            state.data.insert(key.clone(), merged);
        }
        Ok(())
    }

    async fn remove_item(&self, key: &str) -> Result<(), StorageError> {
        self.io_delay().await;
        self.state.lock().data.remove(key);
        Ok(())
    }

    async fn remove_items(&self, keys: &[String]) -> Result<(), StorageError> {
        self.io_delay().await;
        let mut state = self.state.lock();
        for key in keys {
            state.data.remove(key);
        }
        Ok(())
    }

    async fn get_all_keys(&self) -> Result<BTreeSet<String>, StorageError> {
        self.io_delay().await;
        Ok(self.state.lock().data.keys().cloned().collect())
    }

    async fn clear(&self) -> Result<(), StorageError> {
        self.io_delay().await;
        self.state.lock().data.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn set_get_remove() {
        let provider = MemoryProvider::new();
        provider.set_item("a", &Value::from("one")).await.unwrap();
        assert_eq!(provider.get_item("a").await.unwrap(), Some(Value::from("one")));

        provider.remove_item("a").await.unwrap();
        assert_eq!(provider.get_item("a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn quota_rejects_new_keys_only() {
        let provider = MemoryProvider::new().with_quota(1);
        provider.set_item("a", &Value::from(1)).await.unwrap();
        provider.set_item("a", &Value::from(2)).await.unwrap();

        let err = provider.set_item("b", &Value::from(3)).await.unwrap_err();
        assert!(matches!(err, StorageError::QuotaExceeded { ref key } if key == "b"));
        assert!(err.is_recoverable());
        assert!(!provider.contains_key("b"));
    }

    #[tokio::test]
    async fn injected_failures_are_consumed() {
        let provider = MemoryProvider::new();
        provider.fail_next_writes(1);
        assert!(provider.set_item("a", &Value::from(1)).await.is_err());
        assert!(provider.set_item("a", &Value::from(1)).await.is_ok());
        assert_eq!(provider.write_count(), 1);
    }

    #[tokio::test]
    async fn multi_merge_applies_tombstones() {
        let provider = MemoryProvider::new();
        provider
            .set_item("a", &Value::from(json!({"x": 1, "y": 2})))
            .await
            .unwrap();
        provider
            .multi_merge(&[("a".to_string(), Value::from(json!({"x": null, "z": 3})))])
            .await
            .unwrap();
        assert_eq!(provider.value_of("a"), Some(Value::from(json!({"y": 2, "z": 3}))));
    }
}
