//! Structural operations on JSON state: merge patches and diffs.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Apply an RFC 7386 merge patch to `target` in place.
///
/// Objects merge recursively, `null` removes a key, anything else replaces.
pub fn merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(patch_map) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(serde_json::Map::new());
    }
    if let Value::Object(target_map) = target {
        for (key, value) in patch_map {
            if value.is_null() {
                target_map.remove(key);
            } else {
                merge_patch(target_map.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
    }
}

/// One difference between two JSON documents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Change {
    Added { path: String, value: Value },
    Removed { path: String, value: Value },
    Modified { path: String, from: Value, to: Value },
}

impl Change {
    pub fn path(&self) -> &str {
        match self {
            Change::Added { path, .. } | Change::Removed { path, .. } | Change::Modified { path, .. } => {
                path
            }
        }
    }
}

/// Compute the changes that turn `from` into `to`.
///
/// Paths are JSON pointers (`/tags/0/name`). Arrays compare index by
/// index; object keys are visited in sorted order so output is stable.
pub fn diff(from: &Value, to: &Value) -> Vec<Change> {
    let mut changes = Vec::new();
    diff_at(String::new(), from, to, &mut changes);
    changes
}

fn diff_at(path: String, from: &Value, to: &Value, out: &mut Vec<Change>) {
    match (from, to) {
        (Value::Object(a), Value::Object(b)) => {
            let mut keys: Vec<&String> = a.keys().chain(b.keys()).collect();
            keys.sort();
            keys.dedup();
            for key in keys {
                let child = format!("{path}/{}", escape(key));
                match (a.get(key), b.get(key)) {
                    (Some(x), Some(y)) => diff_at(child, x, y, out),
                    (Some(x), None) => out.push(Change::Removed { path: child, value: x.clone() }),
                    (None, Some(y)) => out.push(Change::Added { path: child, value: y.clone() }),
                    (None, None) => {}
                }
            }
        }
        (Value::Array(a), Value::Array(b)) => {
            for i in 0..a.len().max(b.len()) {
                let child = format!("{path}/{i}");
                match (a.get(i), b.get(i)) {
                    (Some(x), Some(y)) => diff_at(child, x, y, out),
                    (Some(x), None) => out.push(Change::Removed { path: child, value: x.clone() }),
                    (None, Some(y)) => out.push(Change::Added { path: child, value: y.clone() }),
                    (None, None) => {}
                }
            }
        }
        _ if from != to => out.push(Change::Modified {
            path,
            from: from.clone(),
            to: to.clone(),
        }),
        _ => {}
    }
}

fn escape(key: &str) -> String {
    key.replace('~', "~0").replace('/', "~1")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn merge_patch_rfc_examples() {
        let mut doc = json!({"a": "b", "c": {"d": "e", "f": "g"}});
        merge_patch(&mut doc, &json!({"a": "z", "c": {"f": null}}));
        assert_eq!(doc, json!({"a": "z", "c": {"d": "e"}}));

        let mut doc = json!({"a": [1, 2]});
        merge_patch(&mut doc, &json!({"a": [3]}));
        assert_eq!(doc, json!({"a": [3]}));

        let mut doc = json!("scalar");
        merge_patch(&mut doc, &json!({"b": {"c": 1}}));
        assert_eq!(doc, json!({"b": {"c": 1}}));
    }

    #[test]
    fn diff_reports_paths() {
        let from = json!({"name": "Line 1", "tags": [{"name": "A"}, {"name": "B"}], "old": true});
        let to = json!({"name": "Line 1", "tags": [{"name": "A2"}], "new/key": 1});
        let changes = diff(&from, &to);
        let paths: Vec<&str> = changes.iter().map(Change::path).collect();
        assert_eq!(paths, vec!["/new~1key", "/old", "/tags/0/name", "/tags/1"]);
        assert!(matches!(&changes[2], Change::Modified { to, .. } if to == "A2"));
    }

    #[test]
    fn equal_documents_have_no_diff() {
        let a = json!({"x": [1, {"y": null}]});
        assert!(diff(&a, &a.clone()).is_empty());
    }
}
