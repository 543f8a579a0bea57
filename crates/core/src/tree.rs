//! Generic helpers over schema-less cluster documents.
//!
//! Documents are plain `serde_json::Value` trees mixing objects, arrays and
//! scalars. The two recursive primitives mirror each other: `remove_nested_field`
//! deletes a leaf, `transform_nested_field` replaces it. Both fan out through
//! arrays: when an intermediate segment resolves to an array, the remaining
//! path is applied to every object element of that array.

use serde_json::Value;

/// Remove the leaf addressed by `path`.
///
/// Missing intermediate segments are a no-op, never an error.
pub fn remove_nested_field(doc: &mut Value, path: &[String]) {
    if path.is_empty() {
        return;
    }
    match doc {
        Value::Array(items) => {
            for item in items.iter_mut() {
                remove_nested_field(item, path);
            }
        }
        Value::Object(map) => {
            if path.len() == 1 {
                map.remove(&path[0]);
            } else if let Some(child) = map.get_mut(&path[0]) {
                remove_nested_field(child, &path[1..]);
            }
        }
        _ => {}
    }
}

/// Replace the leaf addressed by `path` with `f(leaf)`.
///
/// An object leaf has `f` applied to each of its values instead of the
/// object as a whole; array leaves are left untouched.
pub fn transform_nested_field(doc: &mut Value, path: &[String], f: &mut dyn FnMut(&Value) -> Value) {
    if path.is_empty() {
        return;
    }
    match doc {
        Value::Array(items) => {
            for item in items.iter_mut() {
                transform_nested_field(item, path, f);
            }
        }
        Value::Object(map) => {
            if path.len() == 1 {
                match map.get_mut(&path[0]) {
                    Some(Value::Object(leaf)) => {
                        for v in leaf.values_mut() {
                            let next = f(&*v);
                            *v = next;
                        }
                    }
                    Some(v) if !v.is_null() && !v.is_array() => {
                        let next = f(&*v);
                        *v = next;
                    }
                    _ => {}
                }
            } else if let Some(child) = map.get_mut(&path[0]) {
                transform_nested_field(child, &path[1..], f);
            }
        }
        _ => {}
    }
}

/// Resolve `path` through object nodes only; `None` if any segment is missing
/// or not an object.
pub fn get_nested<'a>(doc: &'a Value, path: &[String]) -> Option<&'a Value> {
    let mut cur = doc;
    for seg in path {
        cur = cur.as_object()?.get(seg)?;
    }
    Some(cur)
}

/// Mutable variant of [`get_nested`].
pub fn get_nested_mut<'a>(doc: &'a mut Value, path: &[String]) -> Option<&'a mut Value> {
    let mut cur = doc;
    for seg in path {
        cur = cur.as_object_mut()?.get_mut(seg)?;
    }
    Some(cur)
}

/// Set `value` at `path`, creating intermediate objects as needed. Gives up
/// silently when an existing intermediate node is not an object.
pub fn set_nested(doc: &mut Value, path: &[String], value: Value) {
    let Some((last, parents)) = path.split_last() else {
        return;
    };
    let mut cur = doc;
    for seg in parents {
        match cur {
            Value::Object(map) => {
                cur = map
                    .entry(seg.clone())
                    .or_insert_with(|| Value::Object(Default::default()));
            }
            _ => return,
        }
    }
    if let Value::Object(map) = cur {
        map.insert(last.clone(), value);
    }
}

/// String rendering used for masking digests, encryption payloads and
/// field-value filters. Structured values render as canonical JSON.
pub fn render_value(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Fetch a string from `metadata.<key>`, empty if absent.
pub fn meta_str(doc: &Value, key: &str) -> String {
    doc.get("metadata")
        .and_then(|m| m.get(key))
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn path(segs: &[&str]) -> Vec<String> {
        segs.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn remove_leaf() {
        let mut doc = json!({"metadata": {"uid": "x", "name": "a"}});
        remove_nested_field(&mut doc, &path(&["metadata", "uid"]));
        assert_eq!(doc, json!({"metadata": {"name": "a"}}));
    }

    #[test]
    fn remove_missing_segment_is_noop() {
        let mut doc = json!({"metadata": {"name": "a"}});
        let before = doc.clone();
        remove_nested_field(&mut doc, &path(&["spec", "replicas"]));
        assert_eq!(doc, before);
    }

    #[test]
    fn remove_fans_out_through_arrays() {
        let mut doc = json!({
            "spec": {"containers": [
                {"name": "a", "image": "x"},
                {"name": "b", "image": "y"},
                "not-a-map"
            ]}
        });
        remove_nested_field(&mut doc, &path(&["spec", "containers", "image"]));
        assert_eq!(
            doc,
            json!({"spec": {"containers": [{"name": "a"}, {"name": "b"}, "not-a-map"]}})
        );
    }

    #[test]
    fn removal_is_localized() {
        let mut doc = json!({"a": {"b": 1, "c": 2}, "d": [1, 2, 3]});
        let removed = get_nested(&doc, &path(&["a", "b"])).cloned().unwrap();
        remove_nested_field(&mut doc, &path(&["a", "b"]));
        set_nested(&mut doc, &path(&["a", "b"]), removed);
        assert_eq!(doc, json!({"a": {"b": 1, "c": 2}, "d": [1, 2, 3]}));
    }

    #[test]
    fn transform_string_leaf() {
        let mut doc = json!({"spec": {"user": "alice"}});
        transform_nested_field(&mut doc, &path(&["spec", "user"]), &mut |_| {
            Value::String("***".into())
        });
        assert_eq!(doc, json!({"spec": {"user": "***"}}));
    }

    #[test]
    fn transform_object_leaf_applies_per_value() {
        let mut doc = json!({"data": {"user": "alice", "pass": "s3cret"}});
        transform_nested_field(&mut doc, &path(&["data"]), &mut |_| {
            Value::String("***".into())
        });
        assert_eq!(doc, json!({"data": {"user": "***", "pass": "***"}}));
    }

    #[test]
    fn transform_fans_out_through_arrays() {
        let mut doc = json!({"items": [{"secret": "a"}, {"secret": "b"}]});
        transform_nested_field(&mut doc, &path(&["items", "secret"]), &mut |v| {
            Value::String(format!("<{}>", render_value(v)))
        });
        assert_eq!(doc, json!({"items": [{"secret": "<a>"}, {"secret": "<b>"}]}));
    }

    #[test]
    fn set_nested_creates_intermediates() {
        let mut doc = json!({});
        set_nested(&mut doc, &path(&["status", "phase"]), json!("Running"));
        assert_eq!(doc, json!({"status": {"phase": "Running"}}));
    }

    #[test]
    fn render_values() {
        assert_eq!(render_value(&json!("x")), "x");
        assert_eq!(render_value(&json!(3)), "3");
        assert_eq!(render_value(&json!(true)), "true");
        assert_eq!(render_value(&json!(null)), "");
        assert_eq!(render_value(&json!({"a": 1})), r#"{"a":1}"#);
    }
}
