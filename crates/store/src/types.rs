//! Persisted records for orgs, projects, and API keys.
//!
//! Job rows live in `velu-contracts` because their shape is also a wire
//! contract; these types are purely storage-facing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use velu_core::{ApiKeyId, OrgId, Plan, ProjectId};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrgRecord {
    pub id: OrgId,
    pub slug: String,
    pub name: String,
    pub plan: Plan,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectRecord {
    pub id: ProjectId,
    pub org_id: OrgId,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// A stored API key row. The raw secret is never here; only its hash.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeyRecord {
    pub id: ApiKeyId,
    pub org_id: OrgId,
    pub name: String,
    pub scopes: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub revoked_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl ApiKeyRecord {
    /// Usable right now: not revoked and not expired.
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.revoked_at.is_none() && self.expires_at.map(|e| e > now).unwrap_or(true)
    }
}

/// Parameters for inserting a key. The caller hashes the raw secret first.
#[derive(Debug, Clone)]
pub struct NewApiKey {
    pub org_id: OrgId,
    pub name: String,
    pub scopes: Vec<String>,
    pub hashed_key: String,
    pub expires_at: Option<DateTime<Utc>>,
}
