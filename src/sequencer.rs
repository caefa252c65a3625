//! Per-key ordering of mutations.
//!
//! Two independent mechanisms live here:
//!
//! - a merge queue which collects patches for a key until its flush task drains them into a single in-memory update
//!   and a single backend write;
//! - a write order which hands out per-key tickets at commit time so that backend writes for the same key are issued
//!   strictly in the order their in-memory commits happened, no matter which task performs them.

use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;

use crate::error::Result;
use crate::error::StoreError;
use crate::value::Value;

type Outcome = Option<Result<()>>;

#[derive(Debug)]
pub(crate) struct MergeBatch {
    pub(crate) patches: Vec<Value>,
    done:               watch::Sender<Outcome>,
}

impl MergeBatch {
    fn new() -> Self {
        Self {
            patches: Vec::new(),
            done:    watch::Sender::new(None),
        }
    }

    /// Wake everybody waiting for this batch.
    pub(crate) fn resolve(self, outcome: Result<()>) {
        self.done.send_replace(Some(outcome));
    }
}

/// Handle for awaiting the outcome of a queued merge.
#[derive(Debug)]
pub(crate) struct MergeWaiter(watch::Receiver<Outcome>);

impl MergeWaiter {
    pub(crate) async fn wait(mut self) -> Result<()> {
        match self.0.wait_for(|outcome| outcome.is_some()).await {
            Ok(outcome) => outcome.clone().unwrap_or(Ok(())),
            // The flush task is gone without reporting back, the store is being torn down.
            Err(_) => Err(StoreError::StoreGone),
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct MergeQueue {
    batches: Mutex<HashMap<String, MergeBatch>>,
}

impl MergeQueue {
    /// Queue a patch. The boolean is true when the patch opened a new batch and thus a flush must be scheduled.
    pub(crate) fn enqueue(&self, key: &str, patch: Value) -> (MergeWaiter, bool) {
        let mut batches = self.batches.lock();
        let mut first = false;
        let batch = batches.entry(key.to_string()).or_insert_with(|| {
            first = true;
            MergeBatch::new()
        });
        batch.patches.push(patch);
        (MergeWaiter(batch.done.subscribe()), first)
    }

    /// Take the batch out of the queue. Patches enqueued afterwards start a new batch.
    pub(crate) fn take(&self, key: &str) -> Option<MergeBatch> {
        self.batches.lock().remove(key)
    }

    /// Take every batch whose key satisfies `filter`.
    pub(crate) fn take_matching(&self, filter: impl Fn(&str) -> bool) -> Vec<MergeBatch> {
        let mut batches = self.batches.lock();
        let keys = batches.keys().filter(|key| filter(key)).cloned().collect::<Vec<_>>();
        keys.iter().filter_map(|key| batches.remove(key)).collect()
    }

    pub(crate) fn contains(&self, key: &str) -> bool {
        self.batches.lock().contains_key(key)
    }

    /// Resolve every queued batch. Used on teardown.
    pub(crate) fn drain(&self, outcome: Result<()>) {
        let batches = std::mem::take(&mut *self.batches.lock());
        for (_, batch) in batches {
            batch.resolve(outcome.clone());
        }
    }
}

#[derive(Debug)]
struct KeyLine {
    next:     u64,
    serving:  watch::Sender<u64>,
    finished: BTreeSet<u64>,
}

impl KeyLine {
    fn new() -> Self {
        Self {
            next:     0,
            serving:  watch::Sender::new(0),
            finished: BTreeSet::new(),
        }
    }
}

type Lines = Arc<Mutex<HashMap<String, KeyLine>>>;

#[derive(Debug, Default)]
pub(crate) struct WriteOrder {
    lines: Lines,
}

impl WriteOrder {
    /// Take a place in line for every key. Must be called while the in-memory commit it belongs to is still
    /// exclusive, otherwise the backend order may diverge from the commit order.
    pub(crate) fn reserve<'k>(&self, keys: impl IntoIterator<Item = &'k String>) -> WriteTurn {
        let mut lines = self.lines.lock();
        let tickets = keys
            .into_iter()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .map(|key| {
                let line = lines.entry(key.clone()).or_insert_with(KeyLine::new);
                let number = line.next;
                line.next += 1;
                Ticket {
                    lines: self.lines.clone(),
                    key: key.clone(),
                    number,
                    serving: line.serving.subscribe(),
                }
            })
            .collect();
        WriteTurn { tickets }
    }

    #[cfg(test)]
    fn is_idle(&self) -> bool {
        self.lines.lock().is_empty()
    }
}

/// A place in line for a single key. Leaves the line when dropped, whether its turn has come or not.
#[derive(Debug)]
struct Ticket {
    lines:   Lines,
    key:     String,
    number:  u64,
    serving: watch::Receiver<u64>,
}

impl Drop for Ticket {
    fn drop(&mut self) {
        let mut lines = self.lines.lock();
        let Some(line) = lines.get_mut(&self.key)
        else {
            return;
        };
        line.finished.insert(self.number);
        let mut serving = *line.serving.borrow();
        while line.finished.remove(&serving) {
            serving += 1;
        }
        line.serving.send_replace(serving);
        if serving == line.next {
            lines.remove(&self.key);
        }
    }
}

/// Reserved right to write a set of keys to the backend. Keys are visited in lexicographic order, so that two
/// multi-key reservations can never wait on each other crosswise.
#[derive(Debug)]
pub(crate) struct WriteTurn {
    tickets: Vec<Ticket>,
}

impl WriteTurn {
    /// Resolves once every earlier reservation on the same keys has been released.
    pub(crate) async fn wait(&mut self) {
        for ticket in self.tickets.iter_mut() {
            let number = ticket.number;
            // The sender is owned by the line which outlives any of its tickets.
            let _ = ticket.serving.wait_for(|now| *now >= number).await;
        }
    }
}
