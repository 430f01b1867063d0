use std::borrow::Cow;

use serde::{Deserialize, Serialize};

/// Scope identifier.
///
/// Scopes are modeled as opaque strings (e.g. "jobs:submit"). Mapping scopes
/// to routes is done by the gateway's policy layer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Scope(Cow<'static, str>);

impl Scope {
    pub const JOBS_SUBMIT: Scope = Scope(Cow::Borrowed("jobs:submit"));
    pub const JOBS_READ: Scope = Scope(Cow::Borrowed("jobs:read"));
    pub const ADMIN_ORGS_MANAGE: Scope = Scope(Cow::Borrowed("admin:orgs:manage"));
    pub const ADMIN_API_KEYS_MANAGE: Scope = Scope(Cow::Borrowed("admin:api_keys:manage"));
    pub const ADMIN_BILLING_WRITE: Scope = Scope(Cow::Borrowed("admin:billing:write"));

    pub fn new(name: impl Into<Cow<'static, str>>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_admin(&self) -> bool {
        self.as_str().starts_with("admin:")
    }
}

impl core::fmt::Display for Scope {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Normalize a loose scope list: trim, drop empties, dedupe, sort.
pub fn normalize_scopes<I, S>(scopes: I) -> Vec<Scope>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut out: Vec<Scope> = scopes
        .into_iter()
        .filter_map(|s| {
            let t = s.as_ref().trim();
            if t.is_empty() {
                None
            } else {
                Some(Scope::new(t.to_string()))
            }
        })
        .collect();
    out.sort();
    out.dedup();
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalization_sorts_and_dedupes() {
        let scopes = normalize_scopes(["jobs:read", " jobs:submit ", "", "jobs:read"]);
        assert_eq!(
            scopes,
            vec![Scope::JOBS_READ, Scope::JOBS_SUBMIT]
        );
    }

    #[test]
    fn admin_prefix_detection() {
        assert!(Scope::ADMIN_BILLING_WRITE.is_admin());
        assert!(!Scope::JOBS_SUBMIT.is_admin());
    }
}
