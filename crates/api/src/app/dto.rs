//! Request bodies and response-shaping helpers.

use serde::Deserialize;
use serde_json::{json, Map, Value};

use velu_auth::mask_key;
use velu_store::ApiKeyRecord;

fn default_plan() -> String {
    "base".to_string()
}

#[derive(Debug, Deserialize)]
pub struct TaskIn {
    pub task: String,
    #[serde(default)]
    pub payload: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
pub struct OrgCreateIn {
    pub name: String,
    pub slug: String,
    #[serde(default = "default_plan")]
    pub plan: String,
}

#[derive(Debug, Deserialize)]
pub struct OrgUpdatePlanIn {
    pub plan: String,
}

#[derive(Debug, Deserialize)]
pub struct ApiKeyCreateIn {
    pub name: String,
    #[serde(default)]
    pub scopes: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub limit: Option<i64>,
    #[serde(default)]
    pub q: Option<String>,
}

/// Wire shape for an API key. `raw_key` rides along exactly once, on
/// creation or rotation, and only when the caller may see it.
pub fn api_key_item(record: &ApiKeyRecord, raw_key: Option<&str>) -> Value {
    let mut item = json!({
        "id": record.id.to_string(),
        "org_id": record.org_id.to_string(),
        "name": record.name,
        "scopes": record.scopes,
        "created_at": record.created_at,
        "last_used_at": record.last_used_at,
        "revoked_at": record.revoked_at,
        "expires_at": record.expires_at,
    });
    if let (Some(raw), Some(obj)) = (raw_key, item.as_object_mut()) {
        obj.insert("raw_key".to_string(), json!(raw));
        obj.insert("masked_key".to_string(), json!(mask_key(raw)));
    }
    item
}

pub fn clamp_limit(limit: Option<i64>, default: i64, max: i64) -> i64 {
    limit.unwrap_or(default).clamp(1, max)
}
