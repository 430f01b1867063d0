//! `velu-policy` — entitlement policy: which tasks a tier may submit.
//!
//! The policy never talks to the registry directly; callers hand it the set
//! of registered task names and it intersects its tier tables with that set.

use std::collections::BTreeSet;

use serde_json::{json, Value};

use velu_core::{Plan, Tier};

const STARTER_TASKS: &[&str] = &["assistant_intake", "blueprint_from_intake"];

const GROWTH_EXTRA_TASKS: &[&str] = &[
    "plan",
    "requirements",
    "architecture",
    "datamodel",
    "api_design",
    "ui_scaffold",
    "backend_scaffold",
    "ai_features",
    "security_hardening",
    "testgen",
    "aggregate",
    "report",
    "pipeline",
    "pipeline_waiter",
];

/// Tasks a tier is entitled to, intersected with what is actually registered.
pub fn allowed_tasks(tier: Tier, registered: &BTreeSet<String>) -> BTreeSet<String> {
    let wanted: BTreeSet<&str> = match tier {
        Tier::Enterprise => return registered.clone(),
        Tier::Growth => STARTER_TASKS
            .iter()
            .chain(GROWTH_EXTRA_TASKS)
            .copied()
            .collect(),
        Tier::Starter => STARTER_TASKS.iter().copied().collect(),
    };
    registered
        .iter()
        .filter(|name| wanted.contains(name.as_str()))
        .cloned()
        .collect()
}

/// Tier gate for a single submission.
///
/// Platform admins bypass the tier tables (but never the registry: an
/// unregistered task is nobody's to submit). When enforcement is off the
/// gate passes any registered task.
pub fn task_allowed(
    task: &str,
    tier: Tier,
    registered: &BTreeSet<String>,
    enforce: bool,
    is_platform_admin: bool,
) -> bool {
    if !registered.contains(task) {
        return false;
    }
    if is_platform_admin || !enforce {
        return true;
    }
    allowed_tasks(tier, registered).contains(task)
}

pub fn plan_label(plan: Plan) -> &'static str {
    match plan {
        Plan::Base => "Base — basic tasks",
        Plan::Hero => "Hero — advanced tasks",
        Plan::Superhero => "Superhero — all tasks",
    }
}

pub fn tier_label(tier: Tier) -> &'static str {
    match tier {
        Tier::Starter => "Starter — essentials",
        Tier::Growth => "Growth — advanced build",
        Tier::Enterprise => "Enterprise — full suite",
    }
}

fn title_case(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Body of `GET /tasks/allowed`.
pub fn tasks_allowed_response(
    env: &str,
    plan: Plan,
    tier: Tier,
    registered: &BTreeSet<String>,
) -> Value {
    let allowed: Vec<String> = allowed_tasks(tier, registered).into_iter().collect();
    json!({
        "ok": true,
        "env": env,
        "plan": plan.as_str(),
        "plan_info": {
            "slug": plan.as_str(),
            "name": title_case(plan.as_str()),
            "label": plan_label(plan),
        },
        "tier": tier.as_str(),
        "tier_info": {
            "slug": tier.as_str(),
            "name": title_case(tier.as_str()),
            "label": tier_label(tier),
        },
        "allowed": allowed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> BTreeSet<String> {
        ["assistant_intake", "blueprint_from_intake", "plan", "report", "custom_task"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    #[test]
    fn starter_gets_only_intake_tasks() {
        let allowed = allowed_tasks(Tier::Starter, &registry());
        assert!(allowed.contains("assistant_intake"));
        assert!(allowed.contains("blueprint_from_intake"));
        assert!(!allowed.contains("plan"));
    }

    #[test]
    fn growth_includes_starter() {
        let allowed = allowed_tasks(Tier::Growth, &registry());
        assert!(allowed.contains("assistant_intake"));
        assert!(allowed.contains("plan"));
        assert!(allowed.contains("report"));
        // not in the growth table, only enterprise sees it
        assert!(!allowed.contains("custom_task"));
    }

    #[test]
    fn enterprise_gets_everything_registered() {
        assert_eq!(allowed_tasks(Tier::Enterprise, &registry()), registry());
    }

    #[test]
    fn tables_never_grant_unregistered_tasks() {
        let small: BTreeSet<String> = ["plan".to_string()].into_iter().collect();
        let allowed = allowed_tasks(Tier::Growth, &small);
        assert_eq!(allowed.len(), 1);
        assert!(allowed.contains("plan"));
    }

    #[test]
    fn gate_respects_enforcement_and_admin_bypass() {
        let reg = registry();
        assert!(!task_allowed("plan", Tier::Starter, &reg, true, false));
        assert!(task_allowed("plan", Tier::Starter, &reg, false, false));
        assert!(task_allowed("plan", Tier::Starter, &reg, true, true));
        // unregistered is always refused
        assert!(!task_allowed("ghost", Tier::Enterprise, &reg, true, true));
    }

    #[test]
    fn allowed_response_shape() {
        let body = tasks_allowed_response("local", Plan::Hero, Tier::Growth, &registry());
        assert_eq!(body["ok"], true);
        assert_eq!(body["plan"], "hero");
        assert_eq!(body["tier"], "growth");
        assert!(body["allowed"].as_array().unwrap().iter().any(|v| v == "plan"));
    }
}
