use std::fmt::Debug;
use std::fmt::Display;
use std::sync::Arc;

use crate::value::Collection;
use crate::value::Selector;
use crate::value::Value;

/// Identifies a subscription made with [`Store::connect`](crate::store::Store::connect).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(pub(crate) u64);

impl Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// What a subscriber receives.
#[derive(Clone, Debug, PartialEq)]
pub enum Delivery {
    /// A single key has changed. `None` means the key is absent.
    Key { key: String, value: Option<Value> },
    /// All present members of a collection, for subscribers waiting for the whole collection.
    Collection(Collection),
}

impl Delivery {
    pub fn key(&self) -> Option<&str> {
        match self {
            Delivery::Key { key, .. } => Some(key),
            Delivery::Collection(_) => None,
        }
    }

    pub fn value(&self) -> Option<&Value> {
        match self {
            Delivery::Key { value, .. } => value.as_ref(),
            Delivery::Collection(_) => None,
        }
    }

    pub fn collection(&self) -> Option<&Collection> {
        match self {
            Delivery::Collection(members) => Some(members),
            Delivery::Key { .. } => None,
        }
    }
}

pub type Callback = Arc<dyn Fn(Delivery) + Send + Sync>;

#[derive(Clone, Debug, PartialEq)]
pub struct ConnectOptions {
    pub selector:                     Option<Selector>,
    /// For collection patterns: deliver the whole collection at once instead of one call per member.
    pub wait_for_collection_callback: bool,
    /// When false the subscriber gets no initial delivery but is notified about every `set` and `merge` of its keys,
    /// even those not changing the value.
    pub init_with_stored_values:      bool,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            selector:                     None,
            wait_for_collection_callback: false,
            init_with_stored_values:      true,
        }
    }
}

impl ConnectOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn selector(mut self, selector: impl Into<Selector>) -> Self {
        self.selector = Some(selector.into());
        self
    }

    pub fn wait_for_collection_callback(mut self, wait: bool) -> Self {
        self.wait_for_collection_callback = wait;
        self
    }

    pub fn init_with_stored_values(mut self, init: bool) -> Self {
        self.init_with_stored_values = init;
        self
    }
}

/// A single operation of a [`Store::update`](crate::store::Store::update) batch.
#[derive(Clone, Debug, PartialEq)]
pub enum Update {
    Set { key: String, value: Value },
    Merge { key: String, value: Value },
    MergeCollection { collection: String, entries: Collection },
    MultiSet(Vec<(String, Value)>),
    Clear { preserve: Vec<String> },
}

impl Update {
    pub fn set(key: impl Into<String>, value: impl Into<Value>) -> Self {
        Update::Set {
            key:   key.into(),
            value: value.into(),
        }
    }

    pub fn merge(key: impl Into<String>, value: impl Into<Value>) -> Self {
        Update::Merge {
            key:   key.into(),
            value: value.into(),
        }
    }

    pub fn merge_collection(collection: impl Into<String>, entries: Collection) -> Self {
        Update::MergeCollection {
            collection: collection.into(),
            entries,
        }
    }

    pub fn clear<S: Into<String>>(preserve: impl IntoIterator<Item = S>) -> Self {
        Update::Clear {
            preserve: preserve.into_iter().map(Into::into).collect(),
        }
    }

    pub(crate) fn is_clear(&self) -> bool {
        matches!(self, Update::Clear { .. })
    }
}
