//! Which keys may be dropped, and in what order.
//!
//! Two kinds of dropping exist. Eviction removes a key from both the cache and the backend to make room when a
//! backend write fails. Trimming only releases the in-memory copy once the cache holds more values than allowed.

use std::collections::BTreeSet;

use crate::cache::CacheStore;
use crate::keys::KeySchema;
use crate::subscription::SubscriptionRegistry;

#[derive(Clone, Debug, Default)]
pub(crate) struct EvictionPolicy {
    schema:             KeySchema,
    safe_eviction_keys: Vec<String>,
    ram_only_keys:      Vec<String>,
}

impl EvictionPolicy {
    pub(crate) fn new(schema: KeySchema, safe_eviction_keys: Vec<String>, ram_only_keys: Vec<String>) -> Self {
        Self {
            schema,
            safe_eviction_keys,
            ram_only_keys,
        }
    }

    pub(crate) fn is_safe_to_evict(&self, key: &str) -> bool {
        self.schema.matches_any(&self.safe_eviction_keys, key)
    }

    pub(crate) fn is_ram_only(&self, key: &str) -> bool {
        self.schema.matches_any(&self.ram_only_keys, key)
    }

    /// Eviction candidates, least recently used first. Keys in `exclude`, keys with a write in flight and keys
    /// pinned by a subscription to the exact key are never offered.
    pub(crate) fn eviction_candidates(
        &self,
        cache: &CacheStore,
        subscriptions: &SubscriptionRegistry,
        exclude: &BTreeSet<String>,
    ) -> Vec<String> {
        cache
            .by_recency(|key| self.is_safe_to_evict(key) && !self.is_ram_only(key))
            .into_iter()
            .map(|recency| recency.key)
            .filter(|key| !exclude.contains(key) && !cache.is_in_flight(key) && !subscriptions.is_pinned(key))
            .collect()
    }

    /// Cached keys to release from memory so that no more than `max_cached_keys` values stay cached. Zero disables
    /// the limit. Keys for which `keep` returns true stay in memory, as do keys with a write in flight, keys whose last
    /// write failed and keys watched by any subscription.
    pub(crate) fn trim_candidates(
        &self,
        cache: &CacheStore,
        subscriptions: &SubscriptionRegistry,
        max_cached_keys: usize,
        keep: impl Fn(&str) -> bool,
    ) -> Vec<String> {
        if max_cached_keys == 0 {
            return Vec::new();
        }
        let cached = cache.cached_count();
        if cached <= max_cached_keys {
            return Vec::new();
        }

        cache
            .by_recency(|key| !self.is_ram_only(key))
            .into_iter()
            .filter(|recency| recency.cached)
            .map(|recency| recency.key)
            .filter(|key| {
                !keep(key) && !cache.is_in_flight(key) && !cache.is_unpersisted(key) && !subscriptions.is_watched(key)
            })
            .take(cached - max_cached_keys)
            .collect()
    }
}
