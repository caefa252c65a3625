//! Structured values kept by the store.
//!
//! A [`Value`] is a closed tagged variant. Merging dispatches on [`ValueKind`] rather than on whatever shape a
//! value happens to have at runtime, see [`crate::merge`].

use std::collections::BTreeMap;
use std::fmt::Display;

use serde_json::Number;

/// Members of an object value.
pub type Map = BTreeMap<String, Value>;

/// A mapping of collection member keys to their values.
pub type Collection = BTreeMap<String, Value>;

#[derive(Clone, Debug, Default, PartialEq)]
pub enum Value {
    /// Tombstone. Inside a merge patch it means "delete this field"; as a whole value it means "delete this key".
    #[default]
    Null,
    Bool(bool),
    Number(Number),
    String(String),
    /// Opaque binary payload. Never merged, always replaced.
    Bytes(Vec<u8>),
    Array(Vec<Value>),
    Object(Map),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ValueKind {
    Tombstone,
    Scalar,
    Array,
    Object,
}

impl Value {
    pub fn object() -> Self {
        Value::Object(Map::new())
    }

    #[inline]
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Null => ValueKind::Tombstone,
            Value::Bool(_) | Value::Number(_) | Value::String(_) | Value::Bytes(_) => ValueKind::Scalar,
            Value::Array(_) => ValueKind::Array,
            Value::Object(_) => ValueKind::Object,
        }
    }

    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_object(&self) -> Option<&Map> {
        match self {
            Value::Object(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Number(n) => n.as_i64(),
            _ => None,
        }
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.as_object().and_then(|map| map.get(field))
    }

    /// Narrow the value down to the sub-value addressed by `selector`. A missing path or a tombstone at the end of it
    /// resolve to `None`.
    pub fn select(&self, selector: &Selector) -> Option<&Value> {
        let mut current = self;
        for segment in selector.segments() {
            current = current.get(segment)?;
        }
        if current.is_null() {
            None
        }
        else {
            Some(current)
        }
    }

    /// Names of the top-level properties, used for logging without exposing the data.
    pub(crate) fn property_names(&self) -> Option<String> {
        self.as_object()
            .map(|map| map.keys().map(String::as_str).collect::<Vec<_>>().join(","))
    }
}

impl From<serde_json::Value> for Value {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => Value::Number(n),
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => Value::Array(items.into_iter().map(Value::from).collect()),
            serde_json::Value::Object(map) => Value::Object(map.into_iter().map(|(k, v)| (k, Value::from(v))).collect()),
        }
    }
}

impl From<Value> for serde_json::Value {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(b),
            Value::Number(n) => serde_json::Value::Number(n),
            Value::String(s) => serde_json::Value::String(s),
            Value::Bytes(bytes) => serde_json::Value::Array(bytes.into_iter().map(serde_json::Value::from).collect()),
            Value::Array(items) => serde_json::Value::Array(items.into_iter().map(serde_json::Value::from).collect()),
            Value::Object(map) => {
                serde_json::Value::Object(map.into_iter().map(|(k, v)| (k, serde_json::Value::from(v))).collect())
            }
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Number(n.into())
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(n.into())
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Number::from_f64(n).map_or(Value::Null, Value::Number)
    }
}

impl From<Vec<u8>> for Value {
    fn from(bytes: Vec<u8>) -> Self {
        Value::Bytes(bytes)
    }
}

impl From<Map> for Value {
    fn from(map: Map) -> Self {
        Value::Object(map)
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Bytes(bytes) => write!(f, "<{} bytes>", bytes.len()),
            other => write!(f, "{}", serde_json::Value::from(other.clone())),
        }
    }
}

/// A property path into a value, e.g. `"settings.theme"`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Selector {
    segments: Vec<String>,
}

impl Selector {
    pub fn new(path: &str) -> Self {
        Self {
            segments: path
                .split('.')
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
        }
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }
}

impl From<&str> for Selector {
    fn from(path: &str) -> Self {
        Selector::new(path)
    }
}

impl Display for Selector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.segments.join("."))
    }
}
