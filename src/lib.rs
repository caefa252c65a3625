//! # rx-store
//!
//! Reactive local key/value store sitting between application code and a slow, size-limited persistent backend.
//!
//! Think of it as a synchronous-feeling view of the backend which tells you when something changes.
//!
//! # The Basics
//!
//! The store is designed for the following use case:
//!
//! - Many small structured values addressed by string keys, some of them grouped into collections by a common key
//!   prefix (`report_1`, `report_2`, ... are members of the `report_` collection).
//! - Partial updates: most writes are deep merges of a patch into the existing value.
//! - Observers which want to be told about changes rather than poll for them.
//! - A backend which is slow, may run out of space and doesn't need to see every intermediate state.
//!
//! The store operates on the following principles:
//!
//! - Memory is the source of truth for readers. Every mutation is committed to the cache and broadcast to
//!   subscribers first, then written to the backend.
//! - Writes to the same key reach the backend in the order they were committed. Merges of the same key issued in a
//!   burst are coalesced into one commit and one backend write.
//! - When the backend refuses a write for lack of space, the least recently used keys marked as safe to evict are
//!   dropped and the write is retried.
//! - Keys can be marked as RAM-only; they never reach the backend.
//! - Fully async, backend-agnostic through the [`StorageProvider`] trait.
//!
//! # Merging
//!
//! A `Null` value inside an object patch is a tombstone: it removes the field instead of storing a null. Arrays are
//! replaced as a whole, and a value of a different kind replaces the existing one. See [`merge`](merge::merge) for
//! the rules.
//!
//! # Subscriptions
//!
//! [`Store::connect`] takes a key or a collection key. A subscriber can narrow the delivered value down with a
//! [`Selector`], in which case it isn't bothered by changes outside the selected path. Collection subscribers either
//! get one delivery per changed member or, with
//! [`wait_for_collection_callback`](types::ConnectOptions::wait_for_collection_callback), the whole collection at once
//! per update, regardless of how many members changed.

pub mod cache;
pub mod error;
pub(crate) mod eviction;
pub mod keys;
#[cfg(feature = "tracing")]
pub mod logging;
pub mod memory;
pub mod merge;
pub(crate) mod recovery;
pub(crate) mod sequencer;
pub mod store;
pub(crate) mod subscription;
pub mod traits;
pub mod types;
pub mod value;

#[doc(inline)]
pub use error::StorageError;
#[doc(inline)]
pub use error::StoreError;
#[doc(inline)]
pub use memory::MemoryProvider;
#[doc(inline)]
pub use store::Store;
#[doc(inline)]
pub use traits::StorageProvider;
#[doc(inline)]
pub use value::Selector;
#[doc(inline)]
pub use value::Value;

pub mod prelude {
    pub use crate::error::Result;
    pub use crate::error::StorageError;
    pub use crate::error::StoreError;
    pub use crate::keys::KeySchema;
    pub use crate::memory::MemoryProvider;
    pub use crate::store::Store;
    pub use crate::traits::StorageProvider;
    pub use crate::types::*;
    pub use crate::value::Collection;
    pub use crate::value::Selector;
    pub use crate::value::Value;
}
