//! Task envelope decoding.
//!
//! Current rows store the task name and payload in separate columns. Earlier
//! revisions sometimes stored a whole JSON envelope in the task column; the
//! decoder here tolerates both so old rows still render.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Submit-time envelope: a task name plus an arbitrary JSON payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEnvelope {
    pub task: String,
    #[serde(default)]
    pub payload: Map<String, Value>,
}

/// Parse a value that may be JSON text.
///
/// Strings holding valid JSON are decoded; everything else passes through.
pub fn loads_json_maybe(value: &Value) -> Value {
    if let Value::String(s) = value {
        let trimmed = s.trim();
        if !trimmed.is_empty() {
            if let Ok(parsed) = serde_json::from_str::<Value>(trimmed) {
                return parsed;
            }
        }
    }
    value.clone()
}

fn envelope_from_object(obj: &Map<String, Value>) -> (Option<String>, Map<String, Value>) {
    let task = obj
        .get("task")
        .and_then(Value::as_str)
        .map(|s| s.to_string());
    let payload = obj
        .get("payload")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();
    (task, payload)
}

/// Recover `(task name, payload)` from however a row happened to store them.
pub fn decode_task_and_payload(
    raw_task: &Value,
    raw_payload: Option<&Value>,
) -> (Option<String>, Map<String, Value>) {
    let (mut task, mut payload) = match raw_task {
        Value::Object(obj) => envelope_from_object(obj),
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.starts_with('{') && trimmed.ends_with('}') {
                match loads_json_maybe(raw_task) {
                    Value::Object(obj) => envelope_from_object(&obj),
                    _ => (Some(trimmed.to_string()), Map::new()),
                }
            } else if trimmed.is_empty() {
                (None, Map::new())
            } else {
                (Some(trimmed.to_string()), Map::new())
            }
        }
        _ => (None, Map::new()),
    };

    if payload.is_empty() {
        if let Some(raw) = raw_payload {
            if let Value::Object(obj) = loads_json_maybe(raw) {
                payload = obj;
            }
        }
    }

    if let Some(t) = &task {
        if t.is_empty() {
            task = None;
        }
    }
    (task, payload)
}
