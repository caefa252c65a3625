//! Deep-merge engine.
//!
//! Rules, applied recursively:
//!
//! 1. A non-composite patch (scalar, bytes, tombstone) replaces the base outright. Within an object, a field whose
//!    patch value is a tombstone is omitted from the result when `remove_null_object_values` is set.
//! 2. Arrays are opaque: an array patch replaces the base wholesale.
//! 3. Two objects are merged field by field. Base-only fields pass through, patch-only fields are added, fields
//!    present in both are merged recursively.
//! 4. Mismatched kinds resolve in favor of the patch. An object patch over a non-object base is merged into an empty
//!    object so that its tombstones are still filtered.

use crate::value::Map;
use crate::value::Value;
use crate::value::ValueKind;

pub fn merge(base: &Value, patch: &Value, remove_null_object_values: bool) -> Value {
    match patch.kind() {
        ValueKind::Object => Value::Object(merge_objects(
            base.as_object(),
            patch.as_object(),
            remove_null_object_values,
        )),
        ValueKind::Tombstone | ValueKind::Scalar | ValueKind::Array => patch.clone(),
    }
}

fn merge_objects(base: Option<&Map>, patch: Option<&Map>, remove_null_object_values: bool) -> Map {
    let mut destination = Map::new();

    if let Some(base) = base {
        for (field, base_value) in base {
            let tombstoned = base_value.kind() == ValueKind::Tombstone
                || patch
                    .and_then(|p| p.get(field))
                    .is_some_and(|v| v.kind() == ValueKind::Tombstone);
            if remove_null_object_values && tombstoned {
                continue;
            }
            destination.insert(field.clone(), base_value.clone());
        }
    }

    for (field, patch_value) in patch.into_iter().flatten() {
        let merged = match patch_value.kind() {
            ValueKind::Tombstone if remove_null_object_values => continue,
            ValueKind::Object => Value::Object(merge_objects(
                base.and_then(|b| b.get(field)).and_then(Value::as_object),
                patch_value.as_object(),
                remove_null_object_values,
            )),
            ValueKind::Tombstone | ValueKind::Scalar | ValueKind::Array => patch_value.clone(),
        };
        destination.insert(field.clone(), merged);
    }

    destination
}

/// Deep-remove tombstones from an object value. Implemented as a self-merge.
pub fn remove_nested_null_values(value: &Value) -> Value {
    match value.kind() {
        ValueKind::Object => merge(value, value, true),
        _ => value.clone(),
    }
}

/// Apply a sequence of changes to an existing value in call order.
///
/// A top-level tombstone in the sequence drops whatever has been accumulated so far; `None` is returned when the
/// sequence ends in the absent state.
pub fn apply_merge<'a>(
    existing: Option<&Value>,
    changes: impl IntoIterator<Item = &'a Value>,
    remove_null_object_values: bool,
) -> Option<Value> {
    let mut state = existing.cloned();
    for change in changes {
        state = if change.is_null() {
            None
        }
        else {
            Some(merge(state.as_ref().unwrap_or(&Value::Null), change, remove_null_object_values))
        };
    }
    state
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn v(j: serde_json::Value) -> Value {
        Value::from(j)
    }

    #[test]
    fn scalar_patch_replaces() {
        assert_eq!(merge(&v(json!({"a": 1})), &v(json!("text")), true), v(json!("text")));
        assert_eq!(merge(&v(json!("old")), &v(json!(42)), true), v(json!(42)));
        let bytes = Value::Bytes(vec![0xde, 0xad]);
        assert_eq!(merge(&v(json!({"a": 1})), &bytes, true), bytes);
    }

    #[test]
    fn arrays_are_replaced_wholesale() {
        assert_eq!(merge(&v(json!([1, 2, 3])), &v(json!([4])), true), v(json!([4])));
        assert_eq!(
            merge(&v(json!({"list": [1, 2]})), &v(json!({"list": [3]})), true),
            v(json!({"list": [3]}))
        );
    }

    #[test]
    fn objects_merge_recursively() {
        let base = v(json!({"a": 1, "nested": {"x": 1, "y": 2}}));
        let patch = v(json!({"b": 2, "nested": {"y": 3, "z": 4}}));
        assert_eq!(
            merge(&base, &patch, true),
            v(json!({"a": 1, "b": 2, "nested": {"x": 1, "y": 3, "z": 4}}))
        );
    }

    #[test]
    fn tombstones_delete_nested_fields() {
        let base = v(json!({"a": 1, "b": 2, "nested": {"x": 1, "y": 2}}));
        let patch = v(json!({"b": null, "nested": {"x": null}}));

        assert_eq!(merge(&base, &patch, true), v(json!({"a": 1, "nested": {"y": 2}})));
        assert_eq!(
            merge(&base, &patch, false),
            v(json!({"a": 1, "b": null, "nested": {"x": null, "y": 2}}))
        );
    }

    #[test]
    fn shape_mismatch_patch_wins() {
        assert_eq!(merge(&v(json!({"a": 1})), &v(json!([1, 2])), true), v(json!([1, 2])));
        assert_eq!(merge(&v(json!([1, 2])), &v(json!({"a": 1})), true), v(json!({"a": 1})));
        assert_eq!(merge(&v(json!(7)), &v(json!({"a": {"b": null}})), true), v(json!({"a": {}})));
    }

    #[test]
    fn remove_nested_nulls() {
        let value = v(json!({"a": null, "b": {"c": null, "d": 1}, "e": [null]}));
        assert_eq!(remove_nested_null_values(&value), v(json!({"b": {"d": 1}, "e": [null]})));
        assert_eq!(remove_nested_null_values(&v(json!("x"))), v(json!("x")));
    }

    #[test]
    fn apply_merge_follows_call_order() {
        let existing = v(json!({"a": 1}));
        let changes = [v(json!({"b": 2})), v(json!({"a": null})), v(json!({"c": {"d": 1}}))];
        assert_eq!(
            apply_merge(Some(&existing), &changes, true),
            Some(v(json!({"b": 2, "c": {"d": 1}})))
        );

        let with_reset = [v(json!({"b": 2})), Value::Null, v(json!({"c": 3}))];
        assert_eq!(apply_merge(Some(&existing), &with_reset, true), Some(v(json!({"c": 3}))));
        assert_eq!(apply_merge(Some(&existing), &[Value::Null], true), None);
        assert_eq!(apply_merge(None, &[v(json!({"x": null, "y": 1}))], true), Some(v(json!({"y": 1}))));
    }

    fn leaf() -> impl Strategy<Value = Value> {
        prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            any::<i32>().prop_map(|n| Value::from(n as i64)),
            "[a-z]{0,4}".prop_map(Value::String),
            prop::collection::vec(any::<u8>(), 0..4).prop_map(Value::Bytes),
        ]
    }

    fn value_tree() -> impl Strategy<Value = Value> {
        leaf().prop_recursive(4, 32, 4, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
                prop::collection::btree_map("[a-d]", inner, 0..4).prop_map(Value::Object),
            ]
        })
    }

    fn object_tree() -> impl Strategy<Value = Value> {
        prop::collection::btree_map("[a-d]", value_tree(), 0..5).prop_map(Value::Object)
    }

    fn strip_nulls(value: &Value) -> Value {
        match value {
            Value::Object(map) => Value::Object(
                map.iter()
                    .filter(|(_, v)| !v.is_null())
                    .map(|(k, v)| (k.clone(), strip_nulls(v)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    proptest! {
        #[test]
        fn array_patch_over_object_is_exact(base in object_tree(), patch in prop::collection::vec(value_tree(), 0..4)) {
            let patch = Value::Array(patch);
            prop_assert_eq!(merge(&base, &patch, true), patch);
        }

        #[test]
        fn object_patch_over_array_is_exact(base in prop::collection::vec(value_tree(), 0..4), patch in object_tree()) {
            let patch = remove_nested_null_values(&patch);
            prop_assert_eq!(merge(&Value::Array(base), &patch, true), patch);
        }

        #[test]
        fn tombstone_filtering_equals_stripped_plain_merge(base in object_tree(), patch in object_tree()) {
            let base = remove_nested_null_values(&base);
            prop_assert_eq!(merge(&base, &patch, true), strip_nulls(&merge(&base, &patch, false)));
        }

        #[test]
        fn remove_nested_null_values_is_idempotent(value in value_tree()) {
            let once = remove_nested_null_values(&value);
            prop_assert_eq!(remove_nested_null_values(&once), once);
        }
    }
}
