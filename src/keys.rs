//! Key schema: plain keys, collection keys and pattern matching between them.

use std::collections::BTreeSet;

use serde::Deserialize;

use crate::error::Result;
use crate::error::StoreError;

/// The set of keys known to the application.
///
/// A collection key is a literal prefix shared by a family of member keys. Membership is decided purely by prefix
/// matching.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct KeySchema {
    keys:        BTreeSet<String>,
    collections: BTreeSet<String>,
}

impl KeySchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.keys.insert(key.into());
        self
    }

    pub fn with_collection(mut self, prefix: impl Into<String>) -> Self {
        self.collections.insert(prefix.into());
        self
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.keys.iter().map(String::as_str)
    }

    pub fn collections(&self) -> impl Iterator<Item = &str> {
        self.collections.iter().map(String::as_str)
    }

    #[inline]
    pub fn is_collection_key(&self, key: &str) -> bool {
        self.collections.contains(key)
    }

    #[inline]
    pub fn is_collection_member(&self, collection: &str, key: &str) -> bool {
        key.len() > collection.len() && key.starts_with(collection)
    }

    /// Exact match for plain patterns, membership for collection patterns.
    #[inline]
    pub fn is_key_match(&self, pattern: &str, key: &str) -> bool {
        if self.is_collection_key(pattern) {
            self.is_collection_member(pattern, key)
        }
        else {
            pattern == key
        }
    }

    /// The longest registered collection key the given key is a member of.
    pub fn collection_of(&self, key: &str) -> Option<&str> {
        self.collections
            .iter()
            .filter(|prefix| self.is_collection_member(prefix, key))
            .max_by_key(|prefix| prefix.len())
            .map(String::as_str)
    }

    pub fn split_collection_member_key<'k>(&self, key: &'k str) -> Result<(&'k str, &'k str)> {
        let collection = self.collection_of(key).ok_or_else(|| StoreError::NotACollectionMember {
            collection: None,
            key:        key.to_string(),
        })?;
        Ok(key.split_at(collection.len()))
    }

    /// Whether any of `patterns` matches `key`.
    pub fn matches_any<'p>(&self, patterns: impl IntoIterator<Item = &'p String>, key: &str) -> bool {
        patterns.into_iter().any(|pattern| self.is_key_match(pattern, key))
    }
}
