use fieldx_plus::fx_plus;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::fmt::Debug;
use std::sync::Arc;

use crate::cache::CacheStore;
use crate::cache::InFlight;
use crate::error::Result;
use crate::error::StoreError;
use crate::eviction::EvictionPolicy;
use crate::keys::KeySchema;
use crate::merge::apply_merge;
use crate::merge::merge;
use crate::merge::remove_nested_null_values;
use crate::recovery::WriteOp;
use crate::sequencer::MergeBatch;
use crate::sequencer::MergeQueue;
use crate::sequencer::MergeWaiter;
use crate::sequencer::WriteOrder;
use crate::sequencer::WriteTurn;
use crate::subscription::KeyChange;
use crate::subscription::SubscriptionRegistry;
use crate::subscription::Trigger;
use crate::traits::StorageProvider;
use crate::types::ConnectOptions;
use crate::types::ConnectionId;
use crate::types::Delivery;
use crate::types::Update;
use crate::value::Collection;
use crate::value::Value;

/// Backend writes reserved by a commit, to be issued once every earlier write to the same keys is done.
pub(crate) struct PendingWrite {
    ops:        Vec<WriteOp>,
    turn:       WriteTurn,
    _in_flight: InFlight,
}

impl PendingWrite {
    pub(crate) async fn wait(&mut self) {
        self.turn.wait().await;
    }
}

/// The reactive store.
///
/// ```ignore
/// let store = Store::builder()
///     .provider(MemoryProvider::new())
///     .key_schema(KeySchema::new().with_key("session").with_collection("report_"))
///     .safe_eviction_keys(vec!["report_".to_string()])
///     .build()?;
/// store.init().await?;
///
/// let id = store
///     .connect("session", ConnectOptions::new().selector("user.name"), |delivery| {
///         println!("{:?}", delivery.value());
///     })
///     .await?;
/// store.merge("session", json!({"user": {"name": "Ada"}})).await?;
/// store.disconnect(id);
/// ```
///
/// Every mutation is first committed to memory: the cache is updated and subscribers are notified before the
/// backend is even touched. Readers always see the committed state, a failed backend write is never rolled back.
#[fx_plus(
    parent,
    no_new,
    default(off),
    sync,
    builder(
        doc("Builder object of [`Store`].", "", "See [`Store::builder()`] method."),
        method_doc("Implement builder pattern for [`Store`]."),
    )
)]
pub struct Store<P>
where
    P: StorageProvider,
{
    /// Backend the store persists to.
    #[fieldx(get(clone), builder(required, into))]
    provider: Arc<P>,

    /// Store name. Most useful for debugging and logging.
    #[fieldx(get(copy), default("rx-store"))]
    name: &'static str,

    #[fieldx(get, default(KeySchema::default()))]
    key_schema: KeySchema,

    /// Values keys resolve to on initialization when nothing is stored for them, and after a clear.
    #[fieldx(get, default(BTreeMap::new()))]
    default_key_states: BTreeMap<String, Value>,

    /// Keys and collections which may be dropped from storage to make room for new data.
    #[fieldx(get, default(Vec::new()))]
    safe_eviction_keys: Vec<String>,

    /// Keys and collections which are never persisted.
    #[fieldx(get, default(Vec::new()))]
    ram_only_keys: Vec<String>,

    /// Maximum number of values kept in memory. Zero means no limit.
    #[fieldx(get(copy), default(1000))]
    max_cached_keys: usize,

    #[fieldx(vis(pub(crate)), lazy, get(clone), builder(off))]
    cache: Arc<CacheStore>,

    #[fieldx(vis(pub(crate)), lazy, get(clone), builder(off))]
    subscriptions: Arc<SubscriptionRegistry>,

    #[fieldx(vis(pub(crate)), lazy, get(clone), builder(off))]
    eviction: Arc<EvictionPolicy>,

    #[fieldx(private, lazy, get(clone), builder(off))]
    merge_queue: Arc<MergeQueue>,

    #[fieldx(private, lazy, get(clone), builder(off))]
    write_order: Arc<WriteOrder>,

    #[fieldx(lock, private, get(copy), set, builder(off), default(false))]
    initialized: bool,
}

impl<P> Store<P>
where
    P: StorageProvider,
{
    fn build_cache(&self) -> Arc<CacheStore> {
        Arc::new(CacheStore::new())
    }

    fn build_subscriptions(&self) -> Arc<SubscriptionRegistry> {
        Arc::new(SubscriptionRegistry::default())
    }

    fn build_eviction(&self) -> Arc<EvictionPolicy> {
        Arc::new(EvictionPolicy::new(
            self.key_schema().clone(),
            self.safe_eviction_keys().clone(),
            self.ram_only_keys().clone(),
        ))
    }

    fn build_merge_queue(&self) -> Arc<MergeQueue> {
        Arc::new(MergeQueue::default())
    }

    fn build_write_order(&self) -> Arc<WriteOrder> {
        Arc::new(WriteOrder::default())
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized()
    }

    /// Prepare the store for use: purge persisted copies of RAM-only keys, learn which keys exist and seed the
    /// default key states. Stored values take precedence over defaults, object defaults only fill in missing fields.
    ///
    /// Calling it again is a no-op.
    pub async fn init(&self) -> Result<()> {
        if self.initialized() {
            return Ok(());
        }
        tracing::info!("[{}] Initializing with '{}' backend", self.name(), self.provider().name());

        let cache = self.cache();
        let eviction = self.eviction();
        let since = cache.clock();
        let (ram_only, stored): (Vec<_>, Vec<_>) = self
            .provider()
            .get_all_keys()
            .await?
            .into_iter()
            .partition(|key| eviction.is_ram_only(key));

        if !ram_only.is_empty() {
            tracing::info!("[{}] Purging {} persisted RAM-only keys", self.name(), ram_only.len());
            self.provider().remove_items(&ram_only).await?;
        }
        cache.merge_storage_keys(stored, since);

        let defaults = self.default_key_states();
        if !defaults.is_empty() {
            let keys = defaults
                .keys()
                .filter(|key| !eviction.is_ram_only(key))
                .cloned()
                .collect::<Vec<_>>();
            let stored = self.provider().multi_get(&keys).await?;

            let _commit = cache.exclusive();
            let mut changes = Vec::with_capacity(defaults.len());
            for (key, default) in defaults {
                // Written since the store was built, the default no longer applies.
                if cache.has_cache_for_key(key) {
                    continue;
                }
                let value = match stored.get(key) {
                    Some(stored) => merge(default, stored, true),
                    None => remove_nested_null_values(default),
                };
                cache.set(key, value.clone());
                changes.push(KeyChange::new(key.clone(), None, Some(value)));
            }
            self.subscriptions().dispatch(&cache, &changes, Trigger::Sync);
        }

        self.set_initialized(true);
        Ok(())
    }

    /// Forget all subscriptions and cached data. Pending merges are resolved with [`StoreError::StoreGone`].
    pub fn teardown(&self) {
        let dropped = self.subscriptions().unregister_all();
        self.merge_queue().drain(Err(StoreError::StoreGone));
        self.cache().clear();
        self.set_initialized(false);
        tracing::info!("[{}] Torn down, {dropped} subscriptions dropped", self.name());
    }

    /// Current value of a key. Uncached keys are read from the backend; concurrent reads of the same key share one
    /// backend request.
    pub async fn get(&self, key: &str) -> Result<Option<Value>> {
        let value = self.load(key).await?;
        self.trim();
        Ok(value)
    }

    async fn load(&self, key: &str) -> Result<Option<Value>> {
        let cache = self.cache();
        if let Some(value) = cache.get(key) {
            return Ok(value);
        }
        if self.eviction().is_ram_only(key) {
            return Ok(None);
        }

        let task = cache.read_task(key);
        let outcome = task.get_or_init(|| self.read_item(key)).await.clone();
        cache.settle_read_task(key, &task);
        outcome
    }

    async fn read_item(&self, key: &str) -> Result<Option<Value>> {
        tracing::debug!("[{}] READ({key})", self.name());
        let cache = self.cache();
        let since = cache.clock();
        let value = self.provider().get_item(key).await?;
        let _commit = cache.exclusive();
        Ok(cache.fill(key, value, since))
    }

    /// Read many keys, fetching the uncached ones with a single backend request.
    async fn load_many(&self, keys: &[String]) -> Result<Collection> {
        let cache = self.cache();
        let eviction = self.eviction();
        let mut found = Collection::new();
        let mut missing = Vec::new();

        for key in keys {
            match cache.get(key) {
                Some(Some(value)) => {
                    found.insert(key.clone(), value);
                }
                Some(None) => (),
                None if eviction.is_ram_only(key) => (),
                None => missing.push(key.clone()),
            }
        }

        if !missing.is_empty() {
            tracing::debug!("[{}] MULTI_READ({} keys)", self.name(), missing.len());
            let since = cache.clock();
            let mut stored = self.provider().multi_get(&missing).await?;
            let _commit = cache.exclusive();
            for key in missing {
                let value = stored.remove(&key);
                if let Some(value) = cache.fill(&key, value, since) {
                    found.insert(key, value);
                }
            }
        }

        Ok(found)
    }

    async fn load_all_keys(&self) -> Result<()> {
        let cache = self.cache();
        if cache.keys_loaded() {
            return Ok(());
        }

        let task = cache.keys_task();
        let outcome = task.get_or_init(|| self.list_keys()).await.clone();
        cache.settle_keys_task(&task);
        outcome.map(|_| ())
    }

    async fn list_keys(&self) -> Result<BTreeSet<String>> {
        tracing::debug!("[{}] LIST_KEYS", self.name());
        let cache = self.cache();
        let eviction = self.eviction();
        let since = cache.clock();
        let keys = self.provider().get_all_keys().await?;
        cache.merge_storage_keys(keys.iter().filter(|key| !eviction.is_ram_only(key)).cloned(), since);
        Ok(keys)
    }

    /// All keys currently holding a value, persisted or in memory.
    pub async fn get_all_keys(&self) -> Result<BTreeSet<String>> {
        self.load_all_keys().await?;
        Ok(self.cache().storage_keys())
    }

    /// All present members of a collection.
    pub async fn get_collection(&self, collection: &str) -> Result<Collection> {
        self.load_all_keys().await?;
        let schema = self.key_schema();
        let members = self
            .cache()
            .storage_keys()
            .into_iter()
            .filter(|key| schema.is_collection_member(collection, key))
            .collect::<Vec<_>>();
        let found = self.load_many(&members).await?;
        self.trim();
        Ok(found)
    }

    /// Subscribe to a key or, if `pattern` is a collection key, to all members of the collection.
    ///
    /// Unless [`ConnectOptions::init_with_stored_values`] is off, the callback receives the current state before this
    /// method returns. Callbacks are invoked synchronously in the middle of a commit; they must not block.
    #[tracing::instrument(level = "debug", skip_all, fields(store = self.name(), pattern = pattern))]
    pub async fn connect<F>(&self, pattern: &str, options: ConnectOptions, callback: F) -> Result<ConnectionId>
    where
        F: Fn(Delivery) + Send + Sync + 'static,
    {
        let is_collection = self.key_schema().is_collection_key(pattern);
        let subscriptions = self.subscriptions();
        let subscription = subscriptions.register(pattern, is_collection, options, Arc::new(callback));
        tracing::debug!(
            "[{}] CONNECT({pattern}) {} collection={is_collection}",
            self.name(),
            subscription.id()
        );

        if subscription.options().init_with_stored_values {
            let loaded = if subscription.is_collection() {
                self.get_collection(subscription.pattern()).await.map(|_| ())
            }
            else {
                self.get(subscription.pattern()).await.map(|_| ())
            };
            if let Err(err) = loaded {
                subscriptions.unregister(subscription.id());
                return Err(err);
            }

            let cache = self.cache();
            let _commit = cache.exclusive();
            subscription.deliver_initial(&cache);
            subscription.set_ready();
        }

        Ok(subscription.id())
    }

    /// Remove a subscription. Returns false if there was no such subscription.
    pub fn disconnect(&self, id: ConnectionId) -> bool {
        tracing::debug!("[{}] DISCONNECT({id})", self.name());
        self.subscriptions().unregister(id).is_some()
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions().len()
    }

    /// Replace the value of a key. A `Null` value removes the key, tombstones nested in objects are dropped. Merges
    /// queued for the key and not yet applied are superseded.
    #[tracing::instrument(level = "debug", skip_all, fields(store = self.name(), key = key))]
    pub async fn set(&self, key: &str, value: impl Into<Value>) -> Result<()> {
        let value = value.into();
        if value.is_null() {
            return self.remove(key).await;
        }
        let value = remove_nested_null_values(&value);
        tracing::debug!("[{}] SET({key})", self.name());

        let superseded = self.merge_queue().take(key);
        let pending = {
            let cache = self.cache();
            let _commit = cache.exclusive();
            let previous = cache.value(key);
            let changed = previous.as_ref() != Some(&value);
            if changed {
                cache.set(key, value.clone());
            }
            else {
                cache.touch(key);
            }
            self.subscriptions().dispatch(
                &cache,
                &[KeyChange::new(key, previous, Some(value.clone()))],
                Trigger::Write,
            );

            if changed {
                self.reserve(vec![WriteOp::Set(key.to_string(), value)])
            }
            else {
                None
            }
        };

        self.finish(pending, superseded.into_iter().collect()).await
    }

    /// Set many keys at once with a single backend write.
    #[tracing::instrument(level = "debug", skip_all, fields(store = self.name()))]
    pub async fn multi_set(&self, entries: impl IntoIterator<Item = (String, Value)>) -> Result<()> {
        let entries = entries.into_iter().collect::<Vec<_>>();
        tracing::debug!("[{}] MULTI_SET({} keys)", self.name(), entries.len());

        let queue = self.merge_queue();
        let superseded = entries.iter().filter_map(|(key, _)| queue.take(key)).collect::<Vec<_>>();
        let pending = {
            let cache = self.cache();
            let _commit = cache.exclusive();
            let mut changes = Vec::with_capacity(entries.len());
            let mut to_set = Vec::new();
            let mut to_remove = Vec::new();

            for (key, value) in entries {
                let previous = cache.value(&key);
                if value.is_null() {
                    cache.set_absent(&key);
                    to_remove.push(key.clone());
                    changes.push(KeyChange::new(key, previous, None));
                }
                else {
                    let value = remove_nested_null_values(&value);
                    cache.set(&key, value.clone());
                    to_set.push((key.clone(), value.clone()));
                    changes.push(KeyChange::new(key, previous, Some(value)));
                }
            }
            self.subscriptions().dispatch(&cache, &changes, Trigger::Write);
            self.reserve(vec![WriteOp::MultiSet(to_set), WriteOp::Remove(to_remove)])
        };

        self.finish(pending, superseded).await
    }

    /// Deep-merge a patch into the value of a key.
    ///
    /// Merges of the same key issued before the previous batch has been applied are coalesced: they are applied in
    /// call order within a single commit and persisted with a single backend write.
    #[tracing::instrument(level = "debug", skip_all, fields(store = self.name(), key = key))]
    pub async fn merge(&self, key: &str, patch: impl Into<Value>) -> Result<()> {
        self.enqueue_merge(key, patch.into())?.wait().await
    }

    fn enqueue_merge(&self, key: &str, patch: Value) -> Result<MergeWaiter> {
        let myself = self.myself().ok_or(StoreError::StoreGone)?;
        tracing::debug!(
            "[{}] MERGE({key}) {}",
            self.name(),
            patch.property_names().unwrap_or_default()
        );

        let (waiter, first) = self.merge_queue().enqueue(key, patch);
        if first {
            let key = key.to_string();
            tokio::spawn(async move { myself.flush_merges(&key).await });
        }
        Ok(waiter)
    }

    pub fn has_pending_merge(&self, key: &str) -> bool {
        self.merge_queue().contains(key)
    }

    async fn flush_merges(&self, key: &str) {
        // Let merges issued right after this one join the batch.
        tokio::task::yield_now().await;

        if let Err(err) = self.load(key).await {
            tracing::error!("[{}] Can't read '{key}' to merge into: {err}", self.name());
            if let Some(batch) = self.merge_queue().take(key) {
                batch.resolve(Err(err));
            }
            return;
        }

        let cache = self.cache();
        let (batch, pending) = {
            let _commit = cache.exclusive();
            // Already superseded by a set, a removal or a clear.
            let Some(batch) = self.merge_queue().take(key)
            else {
                return;
            };

            let previous = cache.value(key);
            let current = apply_merge(previous.as_ref(), &batch.patches, true);
            let changed = current != previous;
            match current {
                Some(ref value) if changed => cache.set(key, value.clone()),
                None if changed => cache.set_absent(key),
                _ => cache.touch(key),
            }
            self.subscriptions().dispatch(
                &cache,
                &[KeyChange::new(key, previous.clone(), current.clone())],
                Trigger::Write,
            );

            let pending = if changed {
                let op = match (current, batch.patches.as_slice()) {
                    (None, _) => WriteOp::Remove(vec![key.to_string()]),
                    // A single object patch over a stored value can be merged on the backend side.
                    (Some(_), [patch @ Value::Object(_)]) if previous.is_some() => {
                        WriteOp::MultiMerge(vec![(key.to_string(), patch.clone())])
                    }
                    (Some(value), _) => WriteOp::Set(key.to_string(), value),
                };
                self.reserve(vec![op])
            }
            else {
                None
            };
            (batch, pending)
        };

        let outcome = self.persist(pending).await;
        batch.resolve(outcome);
        self.trim();
    }

    /// Merge patches into members of a collection. Every key in `entries` must be a member of `collection`. A `Null`
    /// patch removes the member. Subscribers are notified once for the whole update.
    #[tracing::instrument(level = "debug", skip_all, fields(store = self.name(), collection = collection))]
    pub async fn merge_collection(&self, collection: &str, entries: Collection) -> Result<()> {
        let schema = self.key_schema();
        if !schema.is_collection_key(collection) {
            return Err(StoreError::InvalidCollection(format!(
                "'{collection}' is not a registered collection key"
            )));
        }
        if let Some(key) = entries.keys().find(|key| !schema.is_collection_member(collection, key)) {
            return Err(StoreError::NotACollectionMember {
                collection: Some(collection.to_string()),
                key:        key.clone(),
            });
        }
        if entries.is_empty() {
            tracing::debug!("[{}] MERGE_COLLECTION({collection}) with no entries", self.name());
            return Ok(());
        }
        tracing::debug!("[{}] MERGE_COLLECTION({collection}) {} members", self.name(), entries.len());

        let cache = self.cache();
        let keys = entries.keys().cloned().collect::<Vec<_>>();
        // Neither trimming nor eviction may take the loaded base values away before the commit reads them.
        let _loading = cache.begin_write(keys.clone());
        self.load_all_keys().await?;
        self.load_many(&keys).await?;

        let queue = self.merge_queue();
        let (queued, pending) = {
            let _commit = cache.exclusive();
            let mut queued = Vec::new();
            let mut changes = Vec::with_capacity(entries.len());
            let mut to_merge = Vec::new();
            let mut to_set = Vec::new();
            let mut to_remove = Vec::new();

            for (key, patch) in entries {
                let earlier = queue.take(&key);
                let previous = cache.value(&key);
                let patches = earlier
                    .as_ref()
                    .map(|batch| batch.patches.as_slice())
                    .unwrap_or_default()
                    .iter()
                    .chain(std::iter::once(&patch));
                let current = apply_merge(previous.as_ref(), patches, true);

                if current != previous {
                    match current {
                        None => {
                            cache.set_absent(&key);
                            to_remove.push(key.clone());
                        }
                        Some(ref value) => {
                            cache.set(&key, value.clone());
                            if previous.is_some() && earlier.is_none() && matches!(patch, Value::Object(_)) {
                                to_merge.push((key.clone(), patch));
                            }
                            else {
                                to_set.push((key.clone(), value.clone()));
                            }
                        }
                    }
                    changes.push(KeyChange::new(key, previous, current));
                }
                else {
                    cache.touch(&key);
                }
                queued.extend(earlier);
            }

            self.subscriptions().dispatch(&cache, &changes, Trigger::Write);
            let pending = self.reserve(vec![
                WriteOp::MultiMerge(to_merge),
                WriteOp::MultiSet(to_set),
                WriteOp::Remove(to_remove),
            ]);
            (queued, pending)
        };

        self.finish(pending, queued).await
    }

    /// Remove a key from memory and the backend.
    #[tracing::instrument(level = "debug", skip_all, fields(store = self.name(), key = key))]
    pub async fn remove(&self, key: &str) -> Result<()> {
        tracing::debug!("[{}] REMOVE({key})", self.name());
        let superseded = self.merge_queue().take(key);
        let pending = {
            let cache = self.cache();
            let _commit = cache.exclusive();
            let previous = cache.value(key);
            cache.set_absent(key);
            self.subscriptions()
                .dispatch(&cache, &[KeyChange::new(key, previous, None)], Trigger::Sync);
            self.reserve(vec![WriteOp::Remove(vec![key.to_string()])])
        };

        self.finish(pending, superseded.into_iter().collect()).await
    }

    /// Reset every key to its default state, or to absence if it has none. Keys listed in `preserve` keep their
    /// current value in memory and in the backend, their subscribers are not notified.
    #[tracing::instrument(level = "debug", skip_all, fields(store = self.name()))]
    pub async fn clear<S: AsRef<str>>(&self, preserve: impl IntoIterator<Item = S>) -> Result<()> {
        let preserve = preserve
            .into_iter()
            .map(|key| key.as_ref().to_string())
            .collect::<BTreeSet<_>>();
        tracing::info!("[{}] CLEAR, preserving {} keys", self.name(), preserve.len());

        self.load_all_keys().await?;

        let superseded = self.merge_queue().take_matching(|key| !preserve.contains(key));
        let defaults = self.default_key_states();
        let pending = {
            let cache = self.cache();
            let _commit = cache.exclusive();
            let keys = cache
                .storage_keys()
                .into_iter()
                .chain(defaults.keys().cloned())
                .filter(|key| !preserve.contains(key))
                .collect::<BTreeSet<_>>();

            let mut changes = Vec::new();
            let mut to_remove = Vec::new();
            let mut to_reset = Vec::new();
            for key in keys {
                let previous = cache.value(&key);
                match defaults.get(&key) {
                    Some(default) => {
                        let default = remove_nested_null_values(default);
                        if previous.as_ref() != Some(&default) {
                            cache.set(&key, default.clone());
                        }
                        to_reset.push((key.clone(), default.clone()));
                        changes.push(KeyChange::new(key, previous, Some(default)));
                    }
                    None => {
                        cache.set_absent(&key);
                        to_remove.push(key.clone());
                        changes.push(KeyChange::new(key, previous, None));
                    }
                }
            }

            self.subscriptions().dispatch(&cache, &changes, Trigger::Sync);
            self.reserve(vec![WriteOp::Remove(to_remove), WriteOp::MultiSet(to_reset)])
        };

        self.finish(pending, superseded).await
    }

    /// Apply a batch of operations. A clear contained in the batch runs first, the rest follows in batch order.
    pub async fn update(&self, updates: Vec<Update>) -> Result<()> {
        tracing::debug!("[{}] UPDATE({} operations)", self.name(), updates.len());
        let (clears, updates): (Vec<_>, Vec<_>) = updates.into_iter().partition(Update::is_clear);

        for clear in clears {
            if let Update::Clear { preserve } = clear {
                self.clear(preserve).await?;
            }
        }

        let mut waiters = Vec::new();
        let mut outcome = Ok(());
        for update in updates {
            let result = match update {
                Update::Set { key, value } => self.set(&key, value).await,
                Update::Merge { key, value } => self.enqueue_merge(&key, value).map(|waiter| waiters.push(waiter)),
                Update::MergeCollection { collection, entries } => self.merge_collection(&collection, entries).await,
                Update::MultiSet(entries) => self.multi_set(entries).await,
                Update::Clear { .. } => Ok(()),
            };
            if outcome.is_ok() {
                outcome = result;
            }
        }

        for waiter in waiters {
            let result = waiter.wait().await;
            if outcome.is_ok() {
                outcome = result;
            }
        }
        outcome
    }

    /// Drop RAM-only keys and empty operations, then reserve a place in line for the rest. Must be called within a
    /// commit.
    pub(crate) fn reserve(&self, ops: Vec<WriteOp>) -> Option<PendingWrite> {
        let eviction = self.eviction();
        let ops = ops
            .into_iter()
            .filter_map(|op| op.retain(|key| !eviction.is_ram_only(key)))
            .collect::<Vec<_>>();
        if ops.is_empty() {
            return None;
        }

        let keys = ops.iter().flat_map(WriteOp::keys).cloned().collect::<BTreeSet<_>>();
        Some(PendingWrite {
            turn:       self.write_order().reserve(&keys),
            _in_flight: self.cache().begin_write(keys.into_iter().collect()),
            ops,
        })
    }

    /// Wait for our turn and write to the backend.
    pub(crate) async fn persist(&self, pending: Option<PendingWrite>) -> Result<()> {
        let Some(mut pending) = pending
        else {
            return Ok(());
        };

        pending.wait().await;
        let cache = self.cache();
        for (idx, op) in pending.ops.iter().enumerate() {
            if let Err(err) = self.write_with_eviction(op).await {
                // The committed values stay in memory until a later write of their keys succeeds.
                cache.mark_persisted(pending.ops[idx..].iter().flat_map(WriteOp::keys), false);
                return Err(err);
            }
            cache.mark_persisted(op.keys(), true);
        }
        Ok(())
    }

    async fn finish(&self, pending: Option<PendingWrite>, superseded: Vec<MergeBatch>) -> Result<()> {
        let outcome = self.persist(pending).await;
        if let Err(ref err) = outcome {
            tracing::error!("[{}] Backend write failed: {err}", self.name());
        }
        for batch in superseded {
            batch.resolve(outcome.clone());
        }
        self.trim();
        outcome
    }

    /// Release the least recently used values from memory if there are more than allowed.
    fn trim(&self) {
        let cache = self.cache();
        let queue = self.merge_queue();
        let defaults = self.default_key_states();
        let candidates = self.eviction().trim_candidates(
            &cache,
            &self.subscriptions(),
            self.max_cached_keys(),
            |key| queue.contains(key) || defaults.contains_key(key) || cache.has_pending_read(key),
        );
        if !candidates.is_empty() {
            tracing::trace!("[{}] Trimming {} keys from memory", self.name(), candidates.len());
        }
        for key in candidates {
            cache.forget(&key);
        }
    }
}

impl<P> Debug for Store<P>
where
    P: StorageProvider,
{
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fmt.debug_struct("Store")
            .field("name", &self.name())
            .field("provider", &self.provider().name())
            .field("cached", &self.cache().cached_count())
            .field("subscriptions", &self.subscriptions().len())
            .finish()
    }
}
