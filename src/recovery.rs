//! Recovery from failed backend writes.
//!
//! When the backend rejects a write with a recoverable error, the least recently used eviction candidate is removed
//! from memory and storage and the write is retried. This repeats until the write succeeds or no candidates are left,
//! in which case the original error is reported.

use std::collections::BTreeSet;

use crate::error::Result;
use crate::error::StorageError;
use crate::store::Store;
use crate::subscription::KeyChange;
use crate::subscription::Trigger;
use crate::traits::StorageProvider;
use crate::value::Value;

/// A single backend write.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum WriteOp {
    Set(String, Value),
    MultiSet(Vec<(String, Value)>),
    MultiMerge(Vec<(String, Value)>),
    Remove(Vec<String>),
}

impl WriteOp {
    pub(crate) fn keys(&self) -> Vec<&String> {
        match self {
            WriteOp::Set(key, _) => vec![key],
            WriteOp::MultiSet(entries) | WriteOp::MultiMerge(entries) => entries.iter().map(|(key, _)| key).collect(),
            WriteOp::Remove(keys) => keys.iter().collect(),
        }
    }

    /// Keep only the keys satisfying `filter`. `None` if nothing is left to write.
    pub(crate) fn retain(self, filter: impl Fn(&str) -> bool) -> Option<WriteOp> {
        let op = match self {
            WriteOp::Set(key, value) => {
                if !filter(&key) {
                    return None;
                }
                WriteOp::Set(key, value)
            }
            WriteOp::MultiSet(mut entries) => {
                entries.retain(|(key, _)| filter(key));
                WriteOp::MultiSet(entries)
            }
            WriteOp::MultiMerge(mut entries) => {
                entries.retain(|(key, _)| filter(key));
                WriteOp::MultiMerge(entries)
            }
            WriteOp::Remove(mut keys) => {
                keys.retain(|key| filter(key));
                WriteOp::Remove(keys)
            }
        };
        if op.keys().is_empty() {
            None
        }
        else {
            Some(op)
        }
    }

    async fn apply<P: StorageProvider + ?Sized>(&self, provider: &P) -> Result<(), StorageError> {
        match self {
            WriteOp::Set(key, value) => provider.set_item(key, value).await,
            WriteOp::MultiSet(entries) => provider.multi_set(entries).await,
            WriteOp::MultiMerge(entries) => provider.multi_merge(entries).await,
            WriteOp::Remove(keys) if keys.len() == 1 => provider.remove_item(&keys[0]).await,
            WriteOp::Remove(keys) => provider.remove_items(keys).await,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            WriteOp::Set(..) => "set",
            WriteOp::MultiSet(_) => "multi_set",
            WriteOp::MultiMerge(_) => "multi_merge",
            WriteOp::Remove(_) => "remove",
        }
    }
}

impl<P> Store<P>
where
    P: StorageProvider,
{
    pub(crate) async fn write_with_eviction(&self, op: &WriteOp) -> Result<()> {
        let mut exclude = op.keys().into_iter().cloned().collect::<BTreeSet<_>>();

        loop {
            let err = match op.apply(&*self.provider()).await {
                Ok(()) => return Ok(()),
                Err(err) => err,
            };

            if !err.is_recoverable() {
                return Err(err.into());
            }

            let candidates = self
                .eviction()
                .eviction_candidates(&self.cache(), &self.subscriptions(), &exclude);
            let Some(victim) = candidates.into_iter().next()
            else {
                tracing::warn!(
                    "[{}] Out of storage, found no keys to evict for {}: {err}",
                    self.name(),
                    op.name()
                );
                return Err(err.into());
            };

            tracing::info!(
                "[{}] Failed to {} ({err}). Evicting least recently used key '{victim}' and retrying.",
                self.name(),
                op.name()
            );
            exclude.insert(victim.clone());
            self.evict(&victim).await?;
        }
    }

    /// Drop a key from memory and storage, telling its subscribers it is gone.
    async fn evict(&self, key: &str) -> Result<()> {
        let cache = self.cache();
        let pending = {
            let _commit = cache.exclusive();
            // A write to the key might have started meanwhile; it must not be undone.
            if cache.is_in_flight(key) {
                return Ok(());
            }
            let previous = cache.value(key);
            // Stays known as absent, a read racing the backend removal must not bring the old value back.
            cache.set_absent(key);
            self.subscriptions()
                .dispatch(&cache, &[KeyChange::new(key, previous, None)], Trigger::Sync);
            self.reserve(vec![WriteOp::Remove(vec![key.to_string()])])
        };

        if let Some(mut pending) = pending {
            pending.wait().await;
            self.provider().remove_item(key).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retain_drops_empty_ops() {
        let op = WriteOp::MultiSet(vec![("a".to_string(), Value::from(1)), ("b".to_string(), Value::from(2))]);
        assert_eq!(
            op.clone().retain(|key| key == "b"),
            Some(WriteOp::MultiSet(vec![("b".to_string(), Value::from(2))]))
        );
        assert_eq!(op.retain(|_| false), None);
        assert_eq!(WriteOp::Set("a".to_string(), Value::from(1)).retain(|key| key != "a"), None);
        assert_eq!(WriteOp::Remove(Vec::new()).retain(|_| true), None);
    }

    #[test]
    fn keys_of_every_kind() {
        let entries = vec![("a".to_string(), Value::from(1))];
        assert_eq!(WriteOp::MultiMerge(entries).keys(), vec!["a"]);
        assert_eq!(WriteOp::Remove(vec!["x".into(), "y".into()]).keys(), vec!["x", "y"]);
    }
}
