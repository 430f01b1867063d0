//! Billing plans and the entitlement tiers derived from them.

use serde::{Deserialize, Serialize};

/// Billing plan attached to an organization.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Plan {
    Base,
    Hero,
    Superhero,
}

impl Plan {
    /// Parse a plan label, accepting historical aliases.
    ///
    /// Unknown or empty labels fall back to the lowest plan.
    pub fn parse(label: &str) -> Self {
        match label.trim().to_ascii_lowercase().as_str() {
            "hero" | "standard" => Self::Hero,
            "superhero" | "premium" => Self::Superhero,
            _ => Self::Base,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Base => "base",
            Self::Hero => "hero",
            Self::Superhero => "superhero",
        }
    }

    pub fn tier(&self) -> Tier {
        Tier::from_plan(*self)
    }
}

impl Default for Plan {
    fn default() -> Self {
        Self::Base
    }
}

impl core::fmt::Display for Plan {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Entitlement tier used by the task policy.
///
/// Tiers are ordered; a higher tier is entitled to everything a lower tier is.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Starter,
    Growth,
    Enterprise,
}

impl Tier {
    pub fn from_plan(plan: Plan) -> Self {
        match plan {
            Plan::Base => Self::Starter,
            Plan::Hero => Self::Growth,
            Plan::Superhero => Self::Enterprise,
        }
    }

    /// Parse a tier label, accepting plan names and historical aliases.
    ///
    /// Unknown labels default to the highest tier; legacy env keysets used the
    /// top plan as the implicit default.
    pub fn parse(label: &str) -> Self {
        match label.trim().to_ascii_lowercase().as_str() {
            "starter" | "base" | "basic" => Self::Starter,
            "growth" | "hero" | "standard" => Self::Growth,
            _ => Self::Enterprise,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starter => "starter",
            Self::Growth => "growth",
            Self::Enterprise => "enterprise",
        }
    }
}

impl core::fmt::Display for Tier {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}
