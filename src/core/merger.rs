//! Layer merging and trimming.
//!
//! Layers fold left to right. Maps merge key by key; anything else in a
//! later layer replaces what was there, lists included. A `null` or `{}`
//! in a later layer is a tombstone: it replaces the earlier value, and the
//! trim pass then drops units and groups left with nothing in them.

use super::error::MergeError;
use super::value::{Map, Value};
use tracing::debug;

/// Fold `layers` into one document and trim it.
pub fn merge_documents(layers: impl IntoIterator<Item = Value>) -> Result<Value, MergeError> {
    let mut merged = Value::Map(Map::new());
    let mut count = 0usize;
    for layer in layers {
        merge_into(&mut merged, layer, &mut Vec::new())?;
        count += 1;
    }
    trim(&mut merged);
    debug!(layers = count, "merged layers");
    Ok(merged)
}

/// Merge `incoming` over `existing`.
pub fn merge(existing: &mut Value, incoming: Value) -> Result<(), MergeError> {
    merge_into(existing, incoming, &mut Vec::new())
}

fn is_tombstone(v: &Value) -> bool {
    match v {
        Value::Null => true,
        Value::Map(m) => m.is_empty(),
        _ => false,
    }
}

fn merge_into(existing: &mut Value, incoming: Value, path: &mut Vec<String>) -> Result<(), MergeError> {
    if is_tombstone(&incoming) || existing.is_null() {
        *existing = incoming;
        return Ok(());
    }
    match (existing, incoming) {
        (Value::Map(base), Value::Map(over)) => {
            for (key, value) in over {
                match base.get_mut(&key) {
                    Some(slot) => {
                        path.push(key);
                        merge_into(slot, value, path)?;
                        path.pop();
                    }
                    None => {
                        base.insert(key, value);
                    }
                }
            }
            Ok(())
        }
        (Value::Map(base), other) if !base.is_empty() => Err(conflict(path, "map", other.type_name())),
        (base, Value::Map(_)) if !matches!(base, Value::Map(_)) => {
            Err(conflict(path, base.type_name(), "map"))
        }
        (slot, other) => {
            *slot = other;
            Ok(())
        }
    }
}

fn conflict(path: &[String], existing: &'static str, incoming: &'static str) -> MergeError {
    MergeError {
        path: path.join("."),
        existing,
        incoming,
    }
}

/// Drop blank units, then groups with no units left.
///
/// Only group and unit entries are trimmed; blank values inside a unit are
/// kept so a layer can still set a value to `false` or `""`.
pub fn trim(doc: &mut Value) {
    let Some(groups) = doc.as_map_mut().and_then(|m| m.get_mut("groups")) else {
        return;
    };
    let Some(map) = groups.as_map_mut() else {
        if groups.is_blank() {
            *groups = Value::Map(Map::new());
        }
        return;
    };
    map.retain(|group, units| {
        if let Some(units) = units.as_map_mut() {
            units.retain(|unit, body| {
                let keep = !body.is_blank();
                if !keep {
                    debug!(%group, %unit, "trimmed empty unit");
                }
                keep
            });
        }
        !units.is_blank()
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn yaml(s: &str) -> Value {
        serde_yaml_ng::from_str(s).unwrap()
    }

    #[test]
    fn test_nested_override() {
        let merged = merge_documents([yaml("{a: 1, b: {x: 1}}"), yaml("{b: {x: 2, y: 3}}")]).unwrap();
        assert_eq!(merged, yaml("{a: 1, b: {x: 2, y: 3}}"));
    }

    #[test]
    fn test_lists_are_replaced() {
        let merged = merge_documents([yaml("{tags: [a, b]}"), yaml("{tags: [c]}")]).unwrap();
        assert_eq!(merged, yaml("{tags: [c]}"));
    }

    #[test]
    fn test_unit_tombstone_removes_unit() {
        let base = yaml("groups: {site: {foo: {chart: {name: foo}}, bar: {chart: {name: bar}}}}");
        let empty_map = yaml("groups: {site: {foo: {}}}");
        let merged = merge_documents([base.clone(), empty_map]).unwrap();
        assert_eq!(merged, yaml("groups: {site: {bar: {chart: {name: bar}}}}"));

        let null = yaml("groups: {site: {foo: ~}}");
        let merged = merge_documents([base, null]).unwrap();
        assert!(merged.get_path(&["groups", "site", "foo"]).is_none());
    }

    #[test]
    fn test_group_tombstone_removes_group() {
        let base = yaml("groups: {site: {foo: {chart: {name: foo}}}, ops: {mon: {chart: {name: m}}}}");
        let merged = merge_documents([base, yaml("groups: {site: ~}")]).unwrap();
        assert_eq!(merged, yaml("groups: {ops: {mon: {chart: {name: m}}}}"));
    }

    #[test]
    fn test_blank_values_inside_unit_survive() {
        let base = yaml("groups: {site: {foo: {chart: {name: foo}, values: {debug: true}}}}");
        let merged = merge_documents([base, yaml("groups: {site: {foo: {values: {debug: false}}}}")]).unwrap();
        assert_eq!(
            merged.get_path(&["groups", "site", "foo", "values", "debug"]),
            Some(&Value::Bool(false))
        );
    }

    #[test]
    fn test_scalar_map_conflict() {
        let err = merge_documents([yaml("{global: {a: {x: 1}}}"), yaml("{global: {a: 5}}")]).unwrap_err();
        assert_eq!(err.path, "global.a");
        assert_eq!(err.existing, "map");
        assert_eq!(err.incoming, "number");

        let err = merge_documents([yaml("{global: {a: [1]}}"), yaml("{global: {a: {x: 1}}}")]).unwrap_err();
        assert_eq!(err.existing, "list");
        assert_eq!(err.incoming, "map");
    }

    #[test]
    fn test_null_base_accepts_anything() {
        let merged = merge_documents([yaml("{a: ~}"), yaml("{a: {x: 1}}")]).unwrap();
        assert_eq!(merged, yaml("{a: {x: 1}}"));
    }

    #[test]
    fn test_no_layers() {
        assert_eq!(merge_documents(Vec::new()).unwrap(), Value::Map(Map::new()));
    }

    fn leaf() -> impl Strategy<Value = Value> {
        prop_oneof![
            any::<bool>().prop_map(Value::Bool),
            any::<i32>().prop_map(|n| Value::from(i64::from(n))),
            "[a-z]{1,6}".prop_map(Value::String),
        ]
    }

    fn flat_map() -> impl Strategy<Value = Map> {
        prop::collection::btree_map("[a-e]", leaf(), 0..5)
    }

    proptest! {
        #[test]
        fn prop_merge_with_self_is_identity(m in flat_map()) {
            let mut doc = Value::Map(m.clone());
            merge(&mut doc, Value::Map(m.clone())).unwrap();
            prop_assert_eq!(doc, Value::Map(m));
        }

        #[test]
        fn prop_last_layer_wins_on_scalars(a in flat_map(), b in flat_map()) {
            prop_assume!(!b.is_empty());
            let mut doc = Value::Map(a.clone());
            merge(&mut doc, Value::Map(b.clone())).unwrap();
            let merged = doc.as_map().unwrap();
            for (k, v) in &b {
                prop_assert_eq!(merged.get(k), Some(v));
            }
            for (k, v) in &a {
                if !b.contains_key(k) {
                    prop_assert_eq!(merged.get(k), Some(v));
                }
            }
        }

        #[test]
        fn prop_trim_leaves_no_blank_units(
            units in prop::collection::btree_map("[a-d]", prop::option::of(flat_map()), 0..6)
        ) {
            let group: Map = units
                .into_iter()
                .map(|(k, v)| (k, v.map(Value::Map).unwrap_or(Value::Null)))
                .collect();
            let mut groups = Map::new();
            groups.insert("g".into(), Value::Map(group));
            let mut root = Map::new();
            root.insert("groups".into(), Value::Map(groups));
            let mut doc = Value::Map(root);
            trim(&mut doc);
            if let Some(Value::Map(units)) = doc.get_path(&["groups", "g"]) {
                prop_assert!(!units.is_empty());
                prop_assert!(units.values().all(|u| !u.is_blank()));
            }
        }
    }
}
