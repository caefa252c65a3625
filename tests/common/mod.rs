#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use rx_store::prelude::*;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::error::Error;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::sync::Notify;

pub type TestResult = Result<(), Box<dyn Error>>;

/// Collects deliveries of a subscription.
#[derive(Clone, Default)]
pub struct Recorder {
    log: Arc<Mutex<Vec<Delivery>>>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn callback(&self) -> impl Fn(Delivery) + Send + Sync + 'static {
        let log = self.log.clone();
        move |delivery| log.lock().push(delivery)
    }

    pub fn count(&self) -> usize {
        self.log.lock().len()
    }

    pub fn deliveries(&self) -> Vec<Delivery> {
        self.log.lock().clone()
    }

    pub fn last(&self) -> Option<Delivery> {
        self.log.lock().last().cloned()
    }

    /// Deliveries telling that `key` is absent.
    pub fn absent_count(&self, key: &str) -> usize {
        self.log
            .lock()
            .iter()
            .filter(|d| d.key() == Some(key) && d.value().is_none())
            .count()
    }
}

pub fn key_delivery(key: &str, value: Option<Value>) -> Delivery {
    Delivery::Key {
        key: key.to_string(),
        value,
    }
}

pub fn json(value: serde_json::Value) -> Value {
    Value::from(value)
}

/// Store configuration shared by the scenario tests.
pub struct Setup {
    pub provider:           Arc<MemoryProvider>,
    pub key_schema:         KeySchema,
    pub default_key_states: BTreeMap<String, Value>,
    pub safe_eviction_keys: Vec<String>,
    pub ram_only_keys:      Vec<String>,
    pub max_cached_keys:    usize,
}

impl Setup {
    pub fn new(provider: MemoryProvider) -> Self {
        Self {
            provider:           Arc::new(provider),
            key_schema:         KeySchema::new()
                .with_collection("report_")
                .with_collection("draft_")
                .with_key("account")
                .with_key("session")
                .with_key("settings"),
            default_key_states: BTreeMap::new(),
            safe_eviction_keys: vec!["report_".to_string()],
            ram_only_keys:      Vec::new(),
            max_cached_keys:    1000,
        }
    }

    pub async fn build(self) -> Result<Arc<Store<MemoryProvider>>, Box<dyn Error>> {
        let provider = self.provider.clone();
        self.build_over(provider).await
    }

    /// Build a store over another backend, usually one wrapping [`Setup::provider`].
    pub async fn build_over<P: StorageProvider>(self, provider: Arc<P>) -> Result<Arc<Store<P>>, Box<dyn Error>> {
        let store = Store::<P>::builder()
            .name("test")
            .provider(provider)
            .key_schema(self.key_schema)
            .default_key_states(self.default_key_states)
            .safe_eviction_keys(self.safe_eviction_keys)
            .ram_only_keys(self.ram_only_keys)
            .max_cached_keys(self.max_cached_keys)
            .build()?;
        store.init().await?;
        Ok(store)
    }
}

/// Backend whose single-key removals are held until the gate is opened.
pub struct GatedRemovals {
    inner:   Arc<MemoryProvider>,
    open:    watch::Sender<bool>,
    blocked: Notify,
}

impl GatedRemovals {
    pub fn new(inner: Arc<MemoryProvider>) -> Self {
        Self {
            inner,
            open: watch::Sender::new(false),
            blocked: Notify::new(),
        }
    }

    /// Resolves once a removal is waiting at the gate.
    pub async fn removal_blocked(&self) {
        self.blocked.notified().await;
    }

    pub fn open(&self) {
        self.open.send_replace(true);
    }
}

#[async_trait]
impl StorageProvider for GatedRemovals {
    async fn get_item(&self, key: &str) -> Result<Option<Value>, StorageError> {
        self.inner.get_item(key).await
    }

    async fn multi_get(&self, keys: &[String]) -> Result<BTreeMap<String, Value>, StorageError> {
        self.inner.multi_get(keys).await
    }

    async fn set_item(&self, key: &str, value: &Value) -> Result<(), StorageError> {
        self.inner.set_item(key, value).await
    }

    async fn multi_set(&self, entries: &[(String, Value)]) -> Result<(), StorageError> {
        self.inner.multi_set(entries).await
    }

    async fn multi_merge(&self, entries: &[(String, Value)]) -> Result<(), StorageError> {
        self.inner.multi_merge(entries).await
    }

    async fn remove_item(&self, key: &str) -> Result<(), StorageError> {
        self.blocked.notify_one();
        let mut open = self.open.subscribe();
        let _ = open.wait_for(|open| *open).await;
        self.inner.remove_item(key).await
    }

    async fn remove_items(&self, keys: &[String]) -> Result<(), StorageError> {
        self.inner.remove_items(keys).await
    }

    async fn get_all_keys(&self) -> Result<BTreeSet<String>, StorageError> {
        self.inner.get_all_keys().await
    }

    async fn clear(&self) -> Result<(), StorageError> {
        self.inner.clear().await
    }
}

pub async fn store(provider: MemoryProvider) -> Result<Arc<Store<MemoryProvider>>, Box<dyn Error>> {
    rx_store::logging::init_tracing();
    Setup::new(provider).build().await
}
