//! Bounded JSON sanitizer.
//!
//! Everything persisted as a payload, result, or error passes through here
//! first. The caps keep a single job row from growing without bound while
//! preserving enough content to debug with.

use serde_json::{json, Map, Value};

const MAX_STR: usize = 20_000;
const MAX_LIST: usize = 2_000;
const MAX_DICT_KEYS: usize = 2_000;
const MAX_FILE_CONTENT: usize = 20_000;
const MAX_FILES: usize = 500;
const MAX_FILE_PATH: usize = 500;

const TRUNCATION_MARKER: &str = "…(truncated)…";

fn clip_str(s: &str, limit: usize) -> String {
    if s.chars().count() <= limit {
        return s.to_string();
    }
    let mut out: String = s.chars().take(limit).collect();
    out.push_str(TRUNCATION_MARKER);
    out
}

fn value_as_text(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn sanitize_files(list: &[Value]) -> Value {
    let kept: Vec<Value> = list
        .iter()
        .take(MAX_FILES)
        .filter_map(|item| item.as_object())
        .map(|obj| {
            let path = obj.get("path").map(value_as_text).unwrap_or_default();
            let content = obj.get("content").map(value_as_text).unwrap_or_default();
            json!({
                "path": clip_str(&path, MAX_FILE_PATH),
                "content": clip_str(&content, MAX_FILE_CONTENT),
            })
        })
        .collect();
    Value::Array(kept)
}

/// Recursively sanitize a JSON value.
///
/// Idempotent: sanitizing an already-sanitized value yields it unchanged.
pub fn sanitize_json(value: &Value) -> Value {
    match value {
        Value::Null | Value::Bool(_) | Value::Number(_) => value.clone(),
        Value::String(s) => Value::String(clip_str(s, MAX_STR)),
        Value::Array(items) => {
            Value::Array(items.iter().take(MAX_LIST).map(sanitize_json).collect())
        }
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len().min(MAX_DICT_KEYS));
            for (k, v) in map.iter().take(MAX_DICT_KEYS) {
                if k == "files" {
                    if let Value::Array(list) = v {
                        out.insert(k.clone(), sanitize_files(list));
                        continue;
                    }
                }
                if k == "files_json" {
                    if let Value::String(s) = v {
                        out.insert(k.clone(), Value::String(clip_str(s, MAX_STR)));
                        continue;
                    }
                }
                out.insert(k.clone(), sanitize_json(v));
            }
            Value::Object(out)
        }
    }
}

/// Sanitize a value that must be stored as a JSON object.
///
/// Non-object inputs are boxed as `{"raw": <text>}` rather than rejected.
pub fn sanitize_payload_object(value: &Value) -> Map<String, Value> {
    match sanitize_json(value) {
        Value::Object(map) => map,
        other => {
            let mut map = Map::new();
            map.insert("raw".to_string(), Value::String(clip_str(&value_as_text(&other), MAX_STR)));
            map
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn long_strings_are_clipped_with_marker() {
        let v = Value::String("x".repeat(MAX_STR + 50));
        let out = sanitize_json(&v);
        let s = out.as_str().unwrap();
        assert!(s.ends_with(TRUNCATION_MARKER));
        assert_eq!(s.chars().count(), MAX_STR + TRUNCATION_MARKER.chars().count());
    }

    #[test]
    fn short_values_pass_through() {
        let v = json!({"a": 1, "b": [true, null], "c": "hi"});
        assert_eq!(sanitize_json(&v), v);
    }

    #[test]
    fn files_entries_are_normalized() {
        let v = json!({"files": [
            {"path": "a.txt", "content": "hello", "extra": "dropped"},
            "not-a-dict",
            {"path": 42},
        ]});
        let out = sanitize_json(&v);
        let files = out["files"].as_array().unwrap();
        assert_eq!(files.len(), 2);
        assert_eq!(files[0], json!({"path": "a.txt", "content": "hello"}));
        assert_eq!(files[1], json!({"path": "42", "content": ""}));
    }

    #[test]
    fn oversized_collections_are_truncated() {
        let big: Vec<Value> = (0..MAX_LIST + 10).map(|i| json!(i)).collect();
        let out = sanitize_json(&Value::Array(big));
        assert_eq!(out.as_array().unwrap().len(), MAX_LIST);
    }

    #[test]
    fn non_object_payloads_are_boxed() {
        let out = sanitize_payload_object(&json!([1, 2, 3]));
        assert_eq!(out.get("raw").unwrap(), &json!("[1,2,3]"));
    }

    proptest! {
        #[test]
        fn sanitizing_twice_is_a_fixed_point(s in ".{0,64}", n in any::<i64>()) {
            let v = json!({"s": s, "n": n, "nested": {"list": [s.clone()]}});
            let once = sanitize_json(&v);
            let twice = sanitize_json(&once);
            prop_assert_eq!(once, twice);
        }
    }

    #[test]
    fn clipped_string_is_stable_under_resanitize() {
        let v = Value::String("y".repeat(MAX_STR * 2));
        let once = sanitize_json(&v);
        let twice = sanitize_json(&once);
        assert_eq!(once, twice);
    }
}
