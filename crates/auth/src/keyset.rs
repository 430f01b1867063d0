//! Legacy env-configured keyset.
//!
//! Before tenanted key storage, deployments configured keys as a
//! comma-separated `API_KEYS` list of `token[:role[:tier]]`. Still honored
//! when no credential store is in use.

use std::collections::HashMap;

use velu_core::Tier;

use crate::claims::Role;

/// Placeholder values from old sample configs; treated as "no keyset".
const DEFAULT_LOCAL_KEYSETS: [&str; 3] = ["local:secret123", "local: secret123", "dev"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeysetEntry {
    pub role: Role,
    pub tier: Tier,
}

/// Parse the `API_KEYS` keyset.
///
/// Bare tokens default to the most permissive entry; malformed segments are
/// skipped rather than rejected so one bad entry cannot lock everyone out.
pub fn parse_api_keys(raw: &str) -> HashMap<String, KeysetEntry> {
    let raw = raw.trim();
    if raw.is_empty() || DEFAULT_LOCAL_KEYSETS.contains(&raw) {
        return HashMap::new();
    }

    let mut out = HashMap::new();
    for part in raw.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let segs: Vec<&str> = part
            .split(':')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect();
        let Some(token) = segs.first() else { continue };
        let role = segs.get(1).map(|s| Role::parse(s)).unwrap_or(Role::Admin);
        let tier = segs
            .get(2)
            .map(|s| Tier::parse(s))
            .unwrap_or(Tier::Enterprise);
        out.insert(token.to_string(), KeysetEntry { role, tier });
    }
    out
}
