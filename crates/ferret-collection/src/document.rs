use serde_json::{Map, Value};

/// Key carrying the list of flattened nested keys while a record moves
/// through the pipeline; always stripped before storage.
pub const FLAT_KEY: &str = ".flat";

/// Flatten nested objects to dotted leaf keys for indexing. Arrays of
/// objects gather each leaf across elements into one array, preserving
/// element order.
pub fn flatten(doc: &Map<String, Value>) -> Vec<(String, Value)> {
    let mut out = Vec::new();
    for (key, value) in doc {
        flatten_value(key, value, &mut out);
    }
    out
}

fn flatten_value(path: &str, value: &Value, out: &mut Vec<(String, Value)>) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                flatten_value(&format!("{path}.{key}"), child, out);
            }
        }
        Value::Array(items) if items.iter().any(Value::is_object) => {
            // Object array: group leaves by key across the elements.
            let mut grouped: Vec<(String, Vec<Value>)> = Vec::new();
            for item in items {
                let mut leaves = Vec::new();
                flatten_value(path, item, &mut leaves);
                for (leaf_path, leaf) in leaves {
                    match grouped.iter_mut().find(|(p, _)| *p == leaf_path) {
                        Some((_, values)) => values.push(leaf),
                        None => grouped.push((leaf_path, vec![leaf])),
                    }
                }
            }
            for (leaf_path, values) in grouped {
                let flattened: Vec<Value> = values
                    .into_iter()
                    .flat_map(|v| match v {
                        Value::Array(inner) => inner,
                        other => vec![other],
                    })
                    .collect();
                out.push((leaf_path, Value::Array(flattened)));
            }
        }
        other => out.push((path.to_string(), other.clone())),
    }
}

/// Value at a dotted path. Descends objects; descending through an array
/// of objects collects the leaf from every element.
pub fn get_path(doc: &Map<String, Value>, path: &str) -> Option<Value> {
    if let Some(direct) = doc.get(path) {
        return Some(direct.clone());
    }
    let (head, rest) = path.split_once('.')?;
    match doc.get(head)? {
        Value::Object(inner) => get_path(inner, rest),
        Value::Array(items) => {
            let collected: Vec<Value> = items
                .iter()
                .filter_map(|item| item.as_object().and_then(|obj| get_path(obj, rest)))
                .collect();
            if collected.is_empty() {
                None
            } else {
                Some(Value::Array(collected))
            }
        }
        _ => None,
    }
}

/// Remove a dotted path, descending into objects and object arrays. Empty
/// parents left behind are kept; projection decides their fate.
pub fn remove_path(doc: &mut Map<String, Value>, path: &str) {
    if doc.remove(path).is_some() {
        return;
    }
    let Some((head, rest)) = path.split_once('.') else {
        return;
    };
    match doc.get_mut(head) {
        Some(Value::Object(inner)) => remove_path(inner, rest),
        Some(Value::Array(items)) => {
            for item in items {
                if let Value::Object(inner) = item {
                    remove_path(inner, rest);
                }
            }
        }
        _ => {}
    }
}

/// Keep a leaf iff no ancestor-or-self is excluded and (the include list is
/// empty, an ancestor-or-self is included, or a descendant is included —
/// the node must survive as a path to it).
fn keep_path(path: &str, include: &[String], exclude: &[String]) -> Keep {
    if exclude
        .iter()
        .any(|e| path == e || path.starts_with(&format!("{e}.")))
    {
        return Keep::No;
    }
    if include.is_empty() {
        return Keep::Whole;
    }
    if include
        .iter()
        .any(|i| path == i || path.starts_with(&format!("{i}.")))
    {
        return Keep::Whole;
    }
    if include.iter().any(|i| i.starts_with(&format!("{path}."))) {
        return Keep::Descend;
    }
    Keep::No
}

#[derive(PartialEq)]
enum Keep {
    Whole,
    Descend,
    No,
}

/// Apply include/exclude projection in place.
pub fn apply_projection(doc: &mut Map<String, Value>, include: &[String], exclude: &[String]) {
    if include.is_empty() && exclude.is_empty() {
        return;
    }
    project_level(doc, "", include, exclude);
}

fn project_level(map: &mut Map<String, Value>, prefix: &str, include: &[String], exclude: &[String]) {
    let keys: Vec<String> = map.keys().cloned().collect();
    for key in keys {
        let path = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{prefix}.{key}")
        };
        match keep_path(&path, include, exclude) {
            Keep::Whole => {
                // Kept wholesale, but descendants may still be excluded.
                if let Some(value) = map.get_mut(&key) {
                    prune_excluded(value, &path, exclude);
                }
            }
            Keep::Descend => match map.get_mut(&key) {
                Some(Value::Object(inner)) => {
                    let was_empty = inner.is_empty();
                    project_level(inner, &path, include, exclude);
                    if inner.is_empty() && !was_empty {
                        map.remove(&key);
                    }
                }
                Some(Value::Array(items)) => {
                    for item in items.iter_mut() {
                        if let Value::Object(inner) = item {
                            project_level(inner, &path, include, exclude);
                        }
                    }
                    items.retain(|item| match item {
                        Value::Object(inner) => !inner.is_empty(),
                        _ => true,
                    });
                }
                _ => {
                    map.remove(&key);
                }
            },
            Keep::No => {
                map.remove(&key);
            }
        }
    }
}

fn prune_excluded(value: &mut Value, path: &str, exclude: &[String]) {
    if exclude.is_empty() {
        return;
    }
    match value {
        Value::Object(inner) => {
            let keys: Vec<String> = inner.keys().cloned().collect();
            for key in keys {
                let child_path = format!("{path}.{key}");
                if exclude
                    .iter()
                    .any(|e| child_path == *e || child_path.starts_with(&format!("{e}.")))
                {
                    inner.remove(&key);
                } else if let Some(child) = inner.get_mut(&key) {
                    prune_excluded(child, &child_path, exclude);
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                prune_excluded(item, path, exclude);
            }
        }
        _ => {}
    }
}

/// Shallow merge: incoming top-level keys replace existing ones.
pub fn merge_shallow(existing: &mut Map<String, Value>, incoming: Map<String, Value>) {
    for (key, value) in incoming {
        existing.insert(key, value);
    }
}

/// Deep merge: nested objects merge recursively, everything else replaces.
pub fn merge_deep(existing: &mut Map<String, Value>, incoming: Map<String, Value>) {
    for (key, value) in incoming {
        match (existing.get_mut(&key), value) {
            (Some(Value::Object(old)), Value::Object(new)) => merge_deep(old, new),
            (_, value) => {
                existing.insert(key, value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(v: Value) -> Map<String, Value> {
        v.as_object().cloned().expect("object literal")
    }

    #[test]
    fn flatten_nested_object() {
        let doc = obj(json!({"a": {"b": {"c": 1}}, "top": "x"}));
        let flat = flatten(&doc);
        assert!(flat.contains(&("a.b.c".to_string(), json!(1))));
        assert!(flat.contains(&("top".to_string(), json!("x"))));
    }

    #[test]
    fn flatten_object_array_groups_leaves() {
        let doc = obj(json!({"variants": [{"sku": "a", "qty": 1}, {"sku": "b", "qty": 2}]}));
        let flat = flatten(&doc);
        assert!(flat.contains(&("variants.sku".to_string(), json!(["a", "b"]))));
        assert!(flat.contains(&("variants.qty".to_string(), json!([1, 2]))));
    }

    #[test]
    fn get_path_descends_objects_and_arrays() {
        let doc = obj(json!({"a": {"b": 2}, "arr": [{"v": 1}, {"v": 3}]}));
        assert_eq!(get_path(&doc, "a.b"), Some(json!(2)));
        assert_eq!(get_path(&doc, "arr.v"), Some(json!([1, 3])));
        assert_eq!(get_path(&doc, "a.z"), None);
    }

    #[test]
    fn remove_path_in_nested_objects() {
        let mut doc = obj(json!({"a": {"b": 2, "c": 3}}));
        remove_path(&mut doc, "a.b");
        assert_eq!(Value::Object(doc), json!({"a": {"c": 3}}));
    }

    #[test]
    fn projection_include_keeps_ancestors_of_included() {
        let mut doc = obj(json!({"a": {"b": 1, "c": 2}, "d": 3}));
        apply_projection(&mut doc, &["a.b".to_string()], &[]);
        assert_eq!(Value::Object(doc), json!({"a": {"b": 1}}));
    }

    #[test]
    fn projection_exclude_wins_over_include() {
        let mut doc = obj(json!({"a": {"b": 1, "c": 2}}));
        apply_projection(&mut doc, &["a".to_string()], &["a.c".to_string()]);
        assert_eq!(Value::Object(doc), json!({"a": {"b": 1}}));
    }

    #[test]
    fn projection_removes_emptied_objects() {
        let mut doc = obj(json!({"a": {"b": 1}, "keep": 2}));
        apply_projection(&mut doc, &["keep".to_string(), "a.zzz".to_string()], &[]);
        assert_eq!(Value::Object(doc), json!({"keep": 2}));
    }

    #[test]
    fn projection_preserves_source_empty_objects() {
        let mut doc = obj(json!({"meta": {}, "x": 1}));
        apply_projection(&mut doc, &[], &["x".to_string()]);
        assert_eq!(Value::Object(doc), json!({"meta": {}}));
    }

    #[test]
    fn merge_shallow_replaces_nested_wholesale() {
        let mut existing = obj(json!({"a": {"x": 1, "y": 2}, "b": 1}));
        merge_shallow(&mut existing, obj(json!({"a": {"x": 9}})));
        assert_eq!(Value::Object(existing), json!({"a": {"x": 9}, "b": 1}));
    }

    #[test]
    fn merge_deep_merges_nested() {
        let mut existing = obj(json!({"a": {"x": 1, "y": 2}, "b": 1}));
        merge_deep(&mut existing, obj(json!({"a": {"x": 9}})));
        assert_eq!(Value::Object(existing), json!({"a": {"x": 9, "y": 2}, "b": 1}));
    }
}
