//! In-memory cache of current values.
//!
//! Recency is a monotonically increasing counter stamped on an entry every time it is touched. Eviction and trimming
//! pick the globally least-recently-touched keys by comparing stamps.

use parking_lot::Mutex;
use parking_lot::MutexGuard;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::OnceCell;

use crate::error::Result;
use crate::value::Collection;
use crate::value::Value;

/// A shared in-flight backend operation. Every concurrent requester awaits the same cell; the first one to poll it runs
/// the operation.
pub(crate) type PendingTask<T> = Arc<OnceCell<Result<T>>>;

#[derive(Clone, Debug)]
struct Slot {
    // None when the key is known to be absent.
    value: Option<Value>,
    stamp: u64,
}

#[derive(Debug, Default)]
struct CacheState {
    slots:        BTreeMap<String, Slot>,
    // Keys with a present value, either persisted or in memory.
    storage_keys: BTreeSet<String>,
    keys_loaded:  bool,
    last_write:   HashMap<String, u64>,
    in_flight:    HashMap<String, usize>,
    // Committed in memory, but the last backend write of the key failed.
    unpersisted:  BTreeSet<String>,
    clock:        u64,
}

impl CacheState {
    #[inline]
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn write_slot(&mut self, key: &str, value: Option<Value>) {
        let stamp = self.tick();
        if value.is_some() {
            self.storage_keys.insert(key.to_string());
        }
        else {
            self.storage_keys.remove(key);
        }
        self.last_write.insert(key.to_string(), stamp);
        self.slots.insert(key.to_string(), Slot { value, stamp });
    }
}

/// Candidate description for eviction or trimming decisions.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct KeyRecency {
    pub(crate) key:    String,
    // Zero for keys known to the backend but never touched in this process.
    pub(crate) stamp:  u64,
    pub(crate) cached: bool,
}

/// Guard of keys with a backend write in flight.
#[derive(Debug)]
pub(crate) struct InFlight {
    cache: Arc<CacheStore>,
    keys:  Vec<String>,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.cache.end_write(&self.keys);
    }
}

#[derive(Debug, Default)]
pub struct CacheStore {
    // Serializes commits: a value change and the notifications it causes form one step.
    commit:     Mutex<()>,
    state:      Mutex<CacheState>,
    read_tasks: Mutex<HashMap<String, PendingTask<Option<Value>>>>,
    keys_task:  Mutex<Option<PendingTask<BTreeSet<String>>>>,
}

impl CacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enter a commit. Must never be held across an await point.
    pub(crate) fn exclusive(&self) -> MutexGuard<'_, ()> {
        self.commit.lock()
    }

    /// Cached value of a key. The outer `Option` tells whether the key is cached at all, the inner one whether it has
    /// a value. Marks the key as recently used.
    pub fn get(&self, key: &str) -> Option<Option<Value>> {
        let mut state = self.state.lock();
        let stamp = state.tick();
        state.slots.get_mut(key).map(|slot| {
            slot.stamp = stamp;
            slot.value.clone()
        })
    }

    /// Same as [`get`](Self::get) but leaves recency untouched.
    pub fn peek(&self, key: &str) -> Option<Option<Value>> {
        self.state.lock().slots.get(key).map(|slot| slot.value.clone())
    }

    /// Present value of a cached key, without touching it.
    pub fn value(&self, key: &str) -> Option<Value> {
        self.peek(key).flatten()
    }

    pub fn has_cache_for_key(&self, key: &str) -> bool {
        self.state.lock().slots.contains_key(key)
    }

    pub fn set(&self, key: &str, value: Value) {
        self.state.lock().write_slot(key, Some(value));
    }

    /// Record the key as resolved to absence.
    pub fn set_absent(&self, key: &str) {
        self.state.lock().write_slot(key, None);
    }

    /// Release the in-memory copy only. The key stays known and will be re-read from the backend on next access.
    pub(crate) fn forget(&self, key: &str) {
        self.state.lock().slots.remove(key);
    }

    pub fn touch(&self, key: &str) {
        let mut state = self.state.lock();
        let stamp = state.tick();
        if let Some(slot) = state.slots.get_mut(key) {
            slot.stamp = stamp;
        }
    }

    pub(crate) fn clock(&self) -> u64 {
        self.state.lock().clock
    }

    /// Store the outcome of a backend read unless the key has been cached or written since the read started at
    /// `since`. Returns whatever is cached for the key afterwards.
    pub(crate) fn fill(&self, key: &str, value: Option<Value>, since: u64) -> Option<Value> {
        let mut state = self.state.lock();
        let written_since = state.last_write.get(key).is_some_and(|w| *w > since);
        if !state.slots.contains_key(key) && !written_since {
            let stamp = state.tick();
            if value.is_some() {
                state.storage_keys.insert(key.to_string());
            }
            else {
                state.storage_keys.remove(key);
            }
            state.slots.insert(key.to_string(), Slot { value, stamp });
        }
        state.slots.get(key).and_then(|slot| slot.value.clone())
    }

    pub fn cached_count(&self) -> usize {
        self.state.lock().slots.values().filter(|slot| slot.value.is_some()).count()
    }

    /// All keys known to have a value: persisted ones reported by the backend plus everything written since.
    pub fn storage_keys(&self) -> BTreeSet<String> {
        self.state.lock().storage_keys.clone()
    }

    pub(crate) fn keys_loaded(&self) -> bool {
        self.state.lock().keys_loaded
    }

    /// Register keys reported by a backend listing which started at `since`.
    pub(crate) fn merge_storage_keys(&self, keys: impl IntoIterator<Item = String>, since: u64) {
        let mut state = self.state.lock();
        for key in keys {
            // Whatever happened to a key after the listing started is more recent than the listing itself.
            let written_since = state.last_write.get(&key).is_some_and(|w| *w > since);
            let known_absent = matches!(state.slots.get(&key), Some(Slot { value: None, .. }));
            if !written_since && !known_absent {
                state.storage_keys.insert(key);
            }
        }
        state.keys_loaded = true;
    }

    /// Cached members of a collection, in key order.
    pub fn collection(&self, prefix: &str) -> Collection {
        let state = self.state.lock();
        state
            .slots
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .filter(|(key, _)| key.len() > prefix.len())
            .filter_map(|(key, slot)| slot.value.clone().map(|value| (key.clone(), value)))
            .collect()
    }

    /// Known keys matching `filter` paired with their recency, least recent first. Ties are ordered by key.
    pub(crate) fn by_recency(&self, filter: impl Fn(&str) -> bool) -> Vec<KeyRecency> {
        let state = self.state.lock();
        let mut keys = state
            .storage_keys
            .iter()
            .filter(|key| filter(key))
            .map(|key| {
                let slot = state.slots.get(key);
                KeyRecency {
                    key:    key.clone(),
                    stamp:  slot.map_or(0, |s| s.stamp),
                    cached: slot.is_some_and(|s| s.value.is_some()),
                }
            })
            .collect::<Vec<_>>();
        keys.sort_by(|a, b| a.stamp.cmp(&b.stamp).then_with(|| a.key.cmp(&b.key)));
        keys
    }

    /// Mark keys as having a backend write in flight until the returned guard is dropped.
    pub(crate) fn begin_write(self: &Arc<Self>, keys: Vec<String>) -> InFlight {
        let mut state = self.state.lock();
        for key in &keys {
            *state.in_flight.entry(key.clone()).or_default() += 1;
        }
        InFlight {
            cache: self.clone(),
            keys,
        }
    }

    fn end_write(&self, keys: &[String]) {
        let mut state = self.state.lock();
        for key in keys {
            if let Some(count) = state.in_flight.get_mut(key) {
                *count -= 1;
                if *count == 0 {
                    state.in_flight.remove(key);
                }
            }
        }
    }

    pub(crate) fn is_in_flight(&self, key: &str) -> bool {
        self.state.lock().in_flight.contains_key(key)
    }

    /// Record the outcome of a backend write. Keys of a failed write keep their in-memory value until a later write
    /// of theirs succeeds.
    pub(crate) fn mark_persisted<'k>(&self, keys: impl IntoIterator<Item = &'k String>, persisted: bool) {
        let mut state = self.state.lock();
        for key in keys {
            if persisted {
                state.unpersisted.remove(key);
            }
            else {
                state.unpersisted.insert(key.clone());
            }
        }
    }

    pub(crate) fn is_unpersisted(&self, key: &str) -> bool {
        self.state.lock().unpersisted.contains(key)
    }

    /// Get or create the pending read task for a key.
    pub(crate) fn read_task(&self, key: &str) -> PendingTask<Option<Value>> {
        self.read_tasks
            .lock()
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone()
    }

    /// Forget a settled read task, unless it has already been replaced by a newer one.
    pub(crate) fn settle_read_task(&self, key: &str, task: &PendingTask<Option<Value>>) {
        let mut tasks = self.read_tasks.lock();
        if tasks.get(key).is_some_and(|t| Arc::ptr_eq(t, task)) {
            tasks.remove(key);
        }
    }

    pub(crate) fn has_pending_read(&self, key: &str) -> bool {
        self.read_tasks.lock().contains_key(key)
    }

    pub(crate) fn keys_task(&self) -> PendingTask<BTreeSet<String>> {
        self.keys_task
            .lock()
            .get_or_insert_with(|| Arc::new(OnceCell::new()))
            .clone()
    }

    pub(crate) fn settle_keys_task(&self, task: &PendingTask<BTreeSet<String>>) {
        let mut current = self.keys_task.lock();
        if current.as_ref().is_some_and(|t| Arc::ptr_eq(t, task)) {
            *current = None;
        }
    }

    /// Drop everything, including the notion of which keys exist.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        let clock = state.clock;
        *state = CacheState {
            clock,
            ..CacheState::default()
        };
    }
}
