//! Provisioning-overlay merge rule.
//!
//! Provisioning configuration is assembled from up to three declared
//! layers (provider-specific, node-level, manifest-level) plus the
//! provider's freshly computed bootstrap overlay. Layers are combined
//! most-specific-first: the accumulator starts as a deep copy of the most
//! specific layer; each less specific layer is only folded in when it
//! carries `"merge": true`, otherwise it replaces the accumulator
//! outright.
//!
//! On a fold, scalars from the less specific layer overwrite, arrays
//! concatenate with the specific layer's items first, and objects recurse
//! with the same rule. The `merge` marker itself is stripped from the
//! result.

use serde_json::Value;

/// Combine overlay layers ordered most-specific-first.
///
/// Returns `None` when no layer is present at all.
pub fn merge_overlays<'a, I>(layers: I) -> Option<Value>
where
    I: IntoIterator<Item = &'a Value>,
{
    let mut accumulator: Option<Value> = None;

    for layer in layers {
        match accumulator.as_mut() {
            None => accumulator = Some(layer.clone()),
            Some(acc) => {
                if wants_merge(layer) {
                    merge_into(acc, layer);
                } else {
                    *acc = layer.clone();
                }
            }
        }
    }

    accumulator.map(|mut value| {
        if let Value::Object(map) = &mut value {
            map.remove("merge");
        }
        value
    })
}

fn wants_merge(layer: &Value) -> bool {
    matches!(layer.get("merge"), Some(Value::Bool(true)))
}

/// Fold `layer` into `acc`: scalars from `layer` win, arrays append after
/// the accumulator's items, objects recurse.
fn merge_into(acc: &mut Value, layer: &Value) {
    let (Value::Object(acc_map), Value::Object(layer_map)) = (&mut *acc, layer) else {
        *acc = layer.clone();
        return;
    };

    for (key, incoming) in layer_map {
        match acc_map.get_mut(key) {
            None => {
                acc_map.insert(key.clone(), incoming.clone());
            }
            Some(existing) => match (&mut *existing, incoming) {
                (Value::Array(items), Value::Array(extra)) => {
                    items.extend(extra.iter().cloned());
                }
                (Value::Object(_), Value::Object(_)) => {
                    merge_into(existing, incoming);
                }
                _ => {
                    *existing = incoming.clone();
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn documented_precedence_example() {
        // The normative example: less-specific scalars win, lists
        // concatenate specific-first.
        let specific = json!({"a": 2, "list": [2]});
        let less_specific = json!({"a": 1, "list": [1], "merge": true});

        let merged = merge_overlays([&specific, &less_specific]).unwrap();

        assert_eq!(merged, json!({"a": 1, "list": [2, 1]}));
    }

    #[test]
    fn layer_without_merge_marker_replaces() {
        let specific = json!({"a": 2, "list": [2]});
        let less_specific = json!({"a": 1});

        let merged = merge_overlays([&specific, &less_specific]).unwrap();

        assert_eq!(merged, json!({"a": 1}));
    }

    #[test]
    fn nested_objects_merge_recursively() {
        let specific = json!({"net": {"iface": "eth1", "reset": true}});
        let less_specific = json!({"net": {"iface": "eth0"}, "merge": true});

        let merged = merge_overlays([&specific, &less_specific]).unwrap();

        assert_eq!(merged, json!({"net": {"iface": "eth0", "reset": true}}));
    }

    #[test]
    fn absent_layers_yield_none() {
        assert!(merge_overlays(std::iter::empty()).is_none());
    }

    #[test]
    fn single_layer_is_a_copy_with_marker_stripped() {
        let only = json!({"bootstrap": ["a"], "merge": true});
        let merged = merge_overlays([&only]).unwrap();
        assert_eq!(merged, json!({"bootstrap": ["a"]}));
    }

    #[test]
    fn keys_missing_from_accumulator_are_adopted() {
        let specific = json!({"a": 1});
        let less_specific = json!({"b": [1, 2], "merge": true});

        let merged = merge_overlays([&specific, &less_specific]).unwrap();

        assert_eq!(merged, json!({"a": 1, "b": [1, 2]}));
    }
}
