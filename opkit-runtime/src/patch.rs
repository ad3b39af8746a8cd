//! Builds minimal RFC 6902 patches by structural diff of two object trees
//!
//! Used by the webhook server to turn a mutating handler's returned object
//! into the `patch` field of its admission response, and useful on its own
//! for issuing precise JSON patches through the API client.

use json_patch::{
    jsonptr::PointerBuf, AddOperation, Patch, PatchOperation, RemoveOperation, ReplaceOperation,
};
use serde_json::Value;

/// Produce a minimal RFC 6902 patch turning `old` into `new`.
///
/// Deterministic ordering: operations are emitted by depth-first traversal of
/// *new* with members visited in sorted (canonical camelCase) order, and all
/// deletions appear last. Arrays are treated atomically: any difference
/// replaces the whole array, which keeps paths stable without positional
/// diffing.
///
/// The result applied to `old` (e.g. via [`json_patch::patch`]) always
/// reproduces `new` exactly; equal inputs produce the empty patch `[]`.
#[must_use]
pub fn diff(old: &Value, new: &Value) -> Patch {
    let mut ops = Vec::new();
    let mut removals = Vec::new();
    diff_value(old, new, &mut Vec::new(), &mut ops, &mut removals);
    ops.append(&mut removals);
    Patch(ops)
}

fn pointer(path: &[String]) -> PointerBuf {
    PointerBuf::from_tokens(path.iter().cloned())
}

fn diff_value(
    old: &Value,
    new: &Value,
    path: &mut Vec<String>,
    ops: &mut Vec<PatchOperation>,
    removals: &mut Vec<PatchOperation>,
) {
    if old == new {
        return;
    }
    match (old, new) {
        (Value::Object(old_map), Value::Object(new_map)) => {
            let mut keys: Vec<&String> = new_map.keys().collect();
            keys.sort();
            for key in keys {
                path.push(key.clone());
                match old_map.get(key) {
                    Some(old_child) => {
                        diff_value(old_child, &new_map[key], path, ops, removals);
                    }
                    None => ops.push(PatchOperation::Add(AddOperation {
                        path: pointer(path),
                        value: new_map[key].clone(),
                    })),
                }
                path.pop();
            }
            let mut removed: Vec<&String> = old_map
                .keys()
                .filter(|key| !new_map.contains_key(*key))
                .collect();
            removed.sort();
            for key in removed {
                path.push(key.clone());
                removals.push(PatchOperation::Remove(RemoveOperation {
                    path: pointer(path),
                }));
                path.pop();
            }
        }
        // scalars, arrays, and type changes replace the node wholesale
        _ => ops.push(PatchOperation::Replace(ReplaceOperation {
            path: pointer(path),
            value: new.clone(),
        })),
    }
}

/// Apply `patch` to a copy of `doc`
pub fn apply(doc: &Value, patch: &Patch) -> Result<Value, json_patch::PatchError> {
    let mut out = doc.clone();
    json_patch::patch(&mut out, patch)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::{apply, diff};
    use assert_json_diff::assert_json_eq;
    use serde_json::{json, Value};

    fn roundtrip(old: &Value, new: &Value) {
        let patch = diff(old, new);
        let patched = apply(old, &patch).unwrap();
        assert_json_eq!(patched, new.clone());
    }

    #[test]
    fn equal_documents_produce_the_empty_array() {
        let doc = json!({"spec": {"a": 1}});
        let patch = diff(&doc, &doc);
        assert!(patch.0.is_empty());
        assert_eq!(serde_json::to_value(&patch).unwrap(), json!([]));
    }

    #[test]
    fn replace_comes_before_add_and_deletions_last() {
        let old = json!({"spec": {"a": 1, "b": 2, "d": 9}});
        let new = json!({"spec": {"a": 1, "b": 3, "c": 4}});
        let patch = serde_json::to_value(diff(&old, &new)).unwrap();
        assert_eq!(
            patch,
            json!([
                { "op": "replace", "path": "/spec/b", "value": 3 },
                { "op": "add", "path": "/spec/c", "value": 4 },
                { "op": "remove", "path": "/spec/d" },
            ])
        );
        roundtrip(&old, &new);
    }

    #[test]
    fn members_are_visited_in_sorted_order() {
        let old = json!({});
        let new = json!({"zeta": 1, "alpha": 2, "mid": 3});
        let patch = serde_json::to_value(diff(&old, &new)).unwrap();
        let paths: Vec<&str> = patch
            .as_array()
            .unwrap()
            .iter()
            .map(|op| op["path"].as_str().unwrap())
            .collect();
        assert_eq!(paths, vec!["/alpha", "/mid", "/zeta"]);
    }

    #[test]
    fn arrays_are_replaced_atomically() {
        let old = json!({"spec": {"items": [1, 2, 3], "keep": true}});
        let new = json!({"spec": {"items": [1, 2, 3, 4], "keep": true}});
        let patch = serde_json::to_value(diff(&old, &new)).unwrap();
        assert_eq!(
            patch,
            json!([
                { "op": "replace", "path": "/spec/items", "value": [1, 2, 3, 4] },
            ])
        );
        roundtrip(&old, &new);
    }

    #[test]
    fn type_changes_replace_the_node() {
        let old = json!({"spec": {"value": "text"}});
        let new = json!({"spec": {"value": {"nested": true}}});
        roundtrip(&old, &new);
        let patch = serde_json::to_value(diff(&old, &new)).unwrap();
        assert_eq!(patch[0]["op"], "replace");
        assert_eq!(patch[0]["path"], "/spec/value");
    }

    #[test]
    fn escaped_member_names_round_trip() {
        let old = json!({"metadata": {"annotations": {}}});
        let new = json!({"metadata": {"annotations": {"example.io/key~x": "v", "a/b": "w"}}});
        roundtrip(&old, &new);
    }

    #[test]
    fn nested_additions_and_removals_round_trip() {
        let old = json!({
            "spec": {
                "replicas": 1,
                "template": { "labels": { "app": "x", "tier": "web" } },
                "legacy": { "flag": true },
            },
        });
        let new = json!({
            "spec": {
                "replicas": 3,
                "template": { "labels": { "app": "x" }, "selector": "app=x" },
            },
        });
        roundtrip(&old, &new);
        let patch = serde_json::to_value(diff(&old, &new)).unwrap();
        let ops: Vec<&str> = patch
            .as_array()
            .unwrap()
            .iter()
            .map(|op| op["op"].as_str().unwrap())
            .collect();
        // all removes trail the adds/replaces
        let first_remove = ops.iter().position(|op| *op == "remove").unwrap();
        assert!(ops[first_remove..].iter().all(|op| *op == "remove"));
    }

    #[test]
    fn whole_document_replacement() {
        let old = json!({"a": 1});
        let new = json!([1, 2, 3]);
        roundtrip(&old, &new);
        let patch = serde_json::to_value(diff(&old, &new)).unwrap();
        assert_eq!(patch[0]["path"], "");
    }
}
