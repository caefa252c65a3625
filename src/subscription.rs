//! Subscription registry and change broadcaster.
//!
//! Subscriptions are kept in registration order. Dispatch works on a snapshot of the matching subscriptions taken
//! under the registry lock, the lock itself is never held while callbacks run. A subscription disconnected in the
//! middle of a dispatch is skipped from that moment on.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::cache::CacheStore;
use crate::types::Callback;
use crate::types::ConnectOptions;
use crate::types::ConnectionId;
use crate::types::Delivery;
use crate::value::Collection;
use crate::value::Value;

/// A single key transition produced by a commit.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct KeyChange {
    pub(crate) key:      String,
    pub(crate) previous: Option<Value>,
    pub(crate) current:  Option<Value>,
}

impl KeyChange {
    pub(crate) fn new(key: impl Into<String>, previous: Option<Value>, current: Option<Value>) -> Self {
        Self {
            key: key.into(),
            previous,
            current,
        }
    }
}

/// How a dispatch was triggered.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Trigger {
    /// An explicit `set` or `merge`. Subscribers not initialized with stored values hear about these even when nothing
    /// has changed.
    Write,
    /// Anything else: clear, removal, eviction, defaults.
    Sync,
}

pub(crate) struct Subscription {
    id:            ConnectionId,
    pattern:       String,
    is_collection: bool,
    options:       ConnectOptions,
    callback:      Callback,
    alive:         AtomicBool,
    ready:         AtomicBool,
}

impl Subscription {
    pub(crate) fn id(&self) -> ConnectionId {
        self.id
    }

    pub(crate) fn pattern(&self) -> &str {
        &self.pattern
    }

    pub(crate) fn is_collection(&self) -> bool {
        self.is_collection
    }

    pub(crate) fn options(&self) -> &ConnectOptions {
        &self.options
    }

    #[inline]
    pub(crate) fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Allow change deliveries. Until then the subscription only waits for its initial delivery.
    pub(crate) fn set_ready(&self) {
        self.ready.store(true, Ordering::Release);
    }

    #[inline]
    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    fn wants_aggregate(&self) -> bool {
        self.is_collection && self.options.wait_for_collection_callback
    }

    pub(crate) fn matches(&self, key: &str) -> bool {
        if self.is_collection {
            key.len() > self.pattern.len() && key.starts_with(&self.pattern)
        }
        else {
            self.pattern == key
        }
    }

    fn narrow(&self, value: Option<&Value>) -> Option<Value> {
        match &self.options.selector {
            Some(selector) => value.and_then(|v| v.select(selector)).cloned(),
            None => value.cloned(),
        }
    }

    fn differs(&self, change: &KeyChange) -> bool {
        self.narrow(change.previous.as_ref()) != self.narrow(change.current.as_ref())
    }

    fn narrow_collection(&self, members: Collection) -> Collection {
        match &self.options.selector {
            Some(selector) => members
                .into_iter()
                .filter_map(|(key, value)| value.select(selector).cloned().map(|v| (key, v)))
                .collect(),
            None => members,
        }
    }

    /// Invoke the callback unless the subscription has been disconnected meanwhile.
    pub(crate) fn deliver(&self, delivery: Delivery) {
        if self.is_alive() {
            (self.callback)(delivery);
        }
    }

    pub(crate) fn deliver_key(&self, key: &str, value: Option<&Value>) {
        self.deliver(Delivery::Key {
            key:   key.to_string(),
            value: self.narrow(value),
        });
    }

    pub(crate) fn deliver_collection(&self, members: Collection) {
        self.deliver(Delivery::Collection(self.narrow_collection(members)));
    }

    /// First delivery after connecting, built from what the cache holds right now.
    pub(crate) fn deliver_initial(&self, cache: &CacheStore) {
        if self.is_collection {
            let members = cache.collection(&self.pattern);
            if self.wants_aggregate() {
                self.deliver_collection(members);
            }
            else if members.is_empty() {
                self.deliver_key(&self.pattern, None);
            }
            else {
                for (key, value) in members {
                    self.deliver_key(&key, Some(&value));
                }
            }
        }
        else {
            self.deliver_key(&self.pattern, cache.value(&self.pattern).as_ref());
        }
    }
}

impl Debug for Subscription {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fmt.debug_struct("Subscription")
            .field("id", &self.id)
            .field("pattern", &self.pattern)
            .field("is_collection", &self.is_collection)
            .field("options", &self.options)
            .field("alive", &self.is_alive())
            .finish()
    }
}

#[derive(Debug, Default)]
pub(crate) struct SubscriptionRegistry {
    subscriptions: Mutex<BTreeMap<ConnectionId, Arc<Subscription>>>,
    next_id:       AtomicU64,
}

impl SubscriptionRegistry {
    pub(crate) fn register(
        &self,
        pattern: &str,
        is_collection: bool,
        options: ConnectOptions,
        callback: Callback,
    ) -> Arc<Subscription> {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let subscription = Arc::new(Subscription {
            id,
            pattern: pattern.to_string(),
            is_collection,
            // Subscribers not asking for stored values have nothing to wait for.
            ready: AtomicBool::new(!options.init_with_stored_values),
            options,
            callback,
            alive: AtomicBool::new(true),
        });
        self.subscriptions.lock().insert(id, subscription.clone());
        subscription
    }

    pub(crate) fn unregister(&self, id: ConnectionId) -> Option<Arc<Subscription>> {
        let subscription = self.subscriptions.lock().remove(&id);
        if let Some(ref subscription) = subscription {
            subscription.alive.store(false, Ordering::Release);
        }
        subscription
    }

    pub(crate) fn unregister_all(&self) -> usize {
        let subscriptions = std::mem::take(&mut *self.subscriptions.lock());
        for subscription in subscriptions.values() {
            subscription.alive.store(false, Ordering::Release);
        }
        subscriptions.len()
    }

    pub(crate) fn len(&self) -> usize {
        self.subscriptions.lock().len()
    }

    /// True if the key is watched by a subscription to the exact key.
    pub(crate) fn is_pinned(&self, key: &str) -> bool {
        self.subscriptions
            .lock()
            .values()
            .any(|s| !s.is_collection && s.pattern == key)
    }

    /// True if any subscription, exact or collection, matches the key.
    pub(crate) fn is_watched(&self, key: &str) -> bool {
        self.subscriptions.lock().values().any(|s| s.matches(key))
    }

    fn matching(&self, changes: &[KeyChange]) -> Vec<Arc<Subscription>> {
        self.subscriptions
            .lock()
            .values()
            .filter(|s| s.is_ready() && changes.iter().any(|c| s.matches(&c.key)))
            .cloned()
            .collect()
    }

    /// Fan the changes out to every matching subscription in registration order. Collection-aggregate subscribers
    /// are called at most once per dispatch, with every member present in the cache at this moment.
    pub(crate) fn dispatch(&self, cache: &CacheStore, changes: &[KeyChange], trigger: Trigger) {
        if changes.is_empty() {
            return;
        }

        for subscription in self.matching(changes) {
            let forced = trigger == Trigger::Write && !subscription.options.init_with_stored_values;
            let mut relevant = changes
                .iter()
                .filter(|c| subscription.matches(&c.key))
                .filter(|c| forced || subscription.differs(c))
                .peekable();

            if subscription.wants_aggregate() {
                if relevant.peek().is_some() {
                    subscription.deliver_collection(cache.collection(&subscription.pattern));
                }
            }
            else {
                for change in relevant {
                    subscription.deliver_key(&change.key, change.current.as_ref());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn recorder() -> (Callback, Arc<Mutex<Vec<Delivery>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let callback: Callback = {
            let log = log.clone();
            Arc::new(move |delivery| log.lock().push(delivery))
        };
        (callback, log)
    }

    #[test]
    fn selector_suppresses_sibling_changes() {
        let cache = CacheStore::new();
        let registry = SubscriptionRegistry::default();
        let (callback, log) = recorder();
        let sub = registry.register("user", false, ConnectOptions::new().selector("a"), callback);
        sub.set_ready();

        let before = Value::from(json!({"a": "one", "b": "two"}));
        let sibling = Value::from(json!({"a": "one", "b": "three"}));
        registry.dispatch(
            &cache,
            &[KeyChange::new("user", Some(before), Some(sibling.clone()))],
            Trigger::Write,
        );
        assert!(log.lock().is_empty());

        let changed = Value::from(json!({"a": "two", "b": "three"}));
        registry.dispatch(
            &cache,
            &[KeyChange::new("user", Some(sibling), Some(changed))],
            Trigger::Write,
        );
        assert_eq!(
            *log.lock(),
            vec![Delivery::Key {
                key:   "user".into(),
                value: Some(Value::from("two")),
            }]
        );
    }

    #[test]
    fn aggregate_is_delivered_once_per_dispatch() {
        let cache = CacheStore::new();
        cache.set("report_1", Value::from(1));
        cache.set("report_2", Value::from(2));
        let registry = SubscriptionRegistry::default();
        let (callback, log) = recorder();
        let sub = registry.register(
            "report_",
            true,
            ConnectOptions::new().wait_for_collection_callback(true),
            callback,
        );
        sub.set_ready();

        registry.dispatch(
            &cache,
            &[
                KeyChange::new("report_1", None, Some(Value::from(1))),
                KeyChange::new("report_2", None, Some(Value::from(2))),
            ],
            Trigger::Sync,
        );

        let log = log.lock();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].collection().map(|c| c.len()), Some(2));
    }

    #[test]
    fn per_member_delivery_skips_unchanged() {
        let cache = CacheStore::new();
        let registry = SubscriptionRegistry::default();
        let (callback, log) = recorder();
        registry.register("report_", true, ConnectOptions::new(), callback).set_ready();

        registry.dispatch(
            &cache,
            &[
                KeyChange::new("report_1", Some(Value::from(1)), Some(Value::from(1))),
                KeyChange::new("report_2", Some(Value::from(2)), None),
                KeyChange::new("other", None, Some(Value::from(3))),
            ],
            Trigger::Sync,
        );

        assert_eq!(
            *log.lock(),
            vec![Delivery::Key {
                key:   "report_2".into(),
                value: None,
            }]
        );
    }

    #[test]
    fn uninitialized_subscriber_hears_every_write() {
        let cache = CacheStore::new();
        let registry = SubscriptionRegistry::default();
        let (callback, log) = recorder();
        registry.register("k", false, ConnectOptions::new().init_with_stored_values(false), callback);

        let same = [KeyChange::new("k", Some(Value::from(1)), Some(Value::from(1)))];
        registry.dispatch(&cache, &same, Trigger::Write);
        registry.dispatch(&cache, &same, Trigger::Sync);
        assert_eq!(log.lock().len(), 1);
    }

    #[test]
    fn disconnected_subscription_is_silent() {
        let cache = CacheStore::new();
        let registry = SubscriptionRegistry::default();
        let (callback, log) = recorder();
        let sub = registry.register("k", false, ConnectOptions::new(), callback);
        sub.set_ready();
        assert!(registry.is_pinned("k"));

        registry.unregister(sub.id());
        sub.deliver_key("k", Some(&Value::from(1)));
        assert!(log.lock().is_empty());
        assert!(!registry.is_pinned("k"));
    }

    #[test]
    fn subscriptions_are_called_in_registration_order() {
        let cache = CacheStore::new();
        let registry = SubscriptionRegistry::default();
        let order = Arc::new(Mutex::new(Vec::new()));
        for tag in 0..3 {
            let order = order.clone();
            registry
                .register("k", false, ConnectOptions::new(), Arc::new(move |_: Delivery| order.lock().push(tag)))
                .set_ready();
        }

        registry.dispatch(&cache, &[KeyChange::new("k", None, Some(Value::from(1)))], Trigger::Sync);
        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }
}
