//! Request claims derived from a presented credential.

use serde::{Deserialize, Serialize};

use velu_core::{OrgId, Tier};

use crate::scopes::Scope;

/// Coarse role derived from a credential's scopes.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Builder,
    Viewer,
}

impl Role {
    pub fn parse(label: &str) -> Self {
        match label.trim().to_ascii_lowercase().as_str() {
            "builder" => Self::Builder,
            "viewer" => Self::Viewer,
            _ => Self::Admin,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::Builder => "builder",
            Self::Viewer => "viewer",
        }
    }

    /// Derive a role from scopes: any admin scope grants `admin`, submit
    /// capability grants `builder`, everything else is read-only.
    pub fn from_scopes(scopes: &[Scope]) -> Self {
        if scopes.iter().any(Scope::is_admin) {
            Self::Admin
        } else if scopes.contains(&Scope::JOBS_SUBMIT) {
            Self::Builder
        } else {
            Self::Viewer
        }
    }
}

impl core::fmt::Display for Role {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What kind of credential produced the claims.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorType {
    ApiKey,
    PlatformAdminKey,
}

impl ActorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ApiKey => "api_key",
            Self::PlatformAdminKey => "platform_admin_key",
        }
    }
}

/// Authenticated request context.
///
/// Built once per request by the gateway's auth middleware and carried as a
/// request extension from there on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub role: Role,
    pub tier: Tier,
    pub kid: String,
    pub org_id: Option<OrgId>,
    pub scopes: Vec<Scope>,
    pub actor_type: ActorType,
    pub actor_id: Option<String>,
    pub is_platform_admin: bool,
}

impl Claims {
    /// Claims for the configured platform admin key. Tenant-less: `org_id`
    /// is absent, and route handlers must treat that accordingly.
    pub fn platform_admin(kid: String) -> Self {
        Self {
            role: Role::Admin,
            tier: Tier::Enterprise,
            kid,
            org_id: None,
            scopes: vec![
                Scope::ADMIN_ORGS_MANAGE,
                Scope::ADMIN_API_KEYS_MANAGE,
                Scope::ADMIN_BILLING_WRITE,
                Scope::JOBS_SUBMIT,
                Scope::JOBS_READ,
            ],
            actor_type: ActorType::PlatformAdminKey,
            actor_id: Some("platform_admin".to_string()),
            is_platform_admin: true,
        }
    }

    /// Claims for a stored per-org API key.
    pub fn for_org_key(
        kid: String,
        org_id: OrgId,
        actor_id: String,
        scopes: Vec<Scope>,
        tier: Tier,
    ) -> Self {
        let role = Role::from_scopes(&scopes);
        Self {
            role,
            tier,
            kid,
            org_id: Some(org_id),
            scopes,
            actor_type: ActorType::ApiKey,
            actor_id: Some(actor_id),
            is_platform_admin: false,
        }
    }

    /// Claims for a legacy env-keyset entry (no tenant attached).
    pub fn legacy(kid: String, role: Role, tier: Tier) -> Self {
        Self {
            role,
            tier,
            kid,
            org_id: None,
            scopes: Vec::new(),
            actor_type: ActorType::ApiKey,
            actor_id: None,
            is_platform_admin: false,
        }
    }

    /// Superset check used by the scope gate. Legacy claims carry no scopes;
    /// callers decide whether the gate applies to them at all.
    pub fn has_scopes(&self, required: &[Scope]) -> bool {
        required.iter().all(|s| self.scopes.contains(s))
    }
}
