//! Built-in task handlers.
//!
//! These are deliberately small template emitters: each derives a document
//! from the payload without any external calls. The interesting machinery
//! (leases, attribution, workspaces) lives around them, not in them.

use std::time::Duration;

use serde_json::{json, Map, Value};

use crate::{TaskContext, TaskError, TaskRegistry};

pub(crate) fn install(registry: &mut TaskRegistry) {
    registry.register("echo", echo);
    registry.register("sleep", sleep);
    registry.register("assistant_intake", assistant_intake);
    registry.register("blueprint_from_intake", blueprint_from_intake);
    registry.register("plan", plan);
    registry.register("requirements", requirements);
    registry.register("architecture", architecture);
    registry.register("datamodel", datamodel);
    registry.register("api_design", api_design);
    registry.register("ui_scaffold", ui_scaffold);
    registry.register("backend_scaffold", backend_scaffold);
    registry.register("ai_features", ai_features);
    registry.register("security_hardening", security_hardening);
    registry.register("testgen", testgen);
    registry.register("aggregate", aggregate);
    registry.register("report", report);
    registry.register("pipeline", pipeline);
    registry.register("pipeline_waiter", pipeline_waiter);
}

fn project_name(ctx: &TaskContext) -> String {
    ctx.str_field("name")
        .or_else(|| ctx.str_field("project"))
        .unwrap_or("Product")
        .trim()
        .to_string()
}

fn idea(ctx: &TaskContext) -> String {
    ctx.str_field("idea")
        .or_else(|| ctx.str_field("description"))
        .unwrap_or("")
        .trim()
        .to_string()
}

fn echo(ctx: &TaskContext) -> Result<Value, TaskError> {
    Ok(json!({"ok": true, "agent": "echo", "data": Value::Object(ctx.payload.clone())}))
}

fn sleep(ctx: &TaskContext) -> Result<Value, TaskError> {
    let seconds = ctx
        .payload
        .get("seconds")
        .and_then(Value::as_i64)
        .unwrap_or(15)
        .clamp(1, 600);
    std::thread::sleep(Duration::from_secs(seconds as u64));
    Ok(json!({"ok": true, "slept_seconds": seconds}))
}

fn assistant_intake(ctx: &TaskContext) -> Result<Value, TaskError> {
    let idea = idea(ctx);
    Ok(json!({
        "ok": true,
        "agent": "assistant_intake",
        "intake": {
            "company": {"name": project_name(ctx)},
            "idea": idea,
            "channels": ["web"],
        },
    }))
}

fn blueprint_from_intake(ctx: &TaskContext) -> Result<Value, TaskError> {
    let intake = ctx
        .payload
        .get("intake")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_else(Map::new);
    Ok(json!({
        "ok": true,
        "agent": "blueprint_from_intake",
        "blueprint": {
            "source": Value::Object(intake),
            "modules": ["auth", "billing", "content"],
        },
    }))
}

fn plan(ctx: &TaskContext) -> Result<Value, TaskError> {
    Ok(json!({
        "ok": true,
        "agent": "plan",
        "plan": {
            "project": project_name(ctx),
            "phases": ["requirements", "architecture", "build", "test"],
        },
    }))
}

fn requirements(ctx: &TaskContext) -> Result<Value, TaskError> {
    let idea = idea(ctx);
    Ok(json!({
        "ok": true,
        "agent": "requirements",
        "requirements": [
            {"id": "R1", "text": format!("Capture the core flow: {idea}")},
            {"id": "R2", "text": "Authenticate every caller"},
            {"id": "R3", "text": "Persist all submissions"},
        ],
    }))
}

fn architecture(ctx: &TaskContext) -> Result<Value, TaskError> {
    Ok(json!({
        "ok": true,
        "agent": "architecture",
        "architecture": {
            "project": project_name(ctx),
            "services": ["gateway", "queue", "worker"],
            "storage": "postgres",
        },
    }))
}

fn datamodel(ctx: &TaskContext) -> Result<Value, TaskError> {
    Ok(json!({
        "ok": true,
        "agent": "datamodel",
        "entities": [
            {"name": "user", "fields": ["id", "email", "created_at"]},
            {"name": "project", "fields": ["id", "org_id", "name"]},
        ],
        "project": project_name(ctx),
    }))
}

fn api_design(ctx: &TaskContext) -> Result<Value, TaskError> {
    Ok(json!({
        "ok": true,
        "agent": "api_design",
        "endpoints": [
            {"method": "GET", "path": "/health"},
            {"method": "POST", "path": "/items"},
            {"method": "GET", "path": "/items/{id}"},
        ],
        "project": project_name(ctx),
    }))
}

fn ui_scaffold(ctx: &TaskContext) -> Result<Value, TaskError> {
    let name = project_name(ctx);
    Ok(json!({
        "ok": true,
        "agent": "ui_scaffold",
        "files": [
            {
                "path": "ui/index.html",
                "content": format!("<!doctype html>\n<title>{name}</title>\n<h1>{name}</h1>\n"),
            },
            {
                "path": "ui/app.css",
                "content": "body { font-family: system-ui; margin: 2rem; }\n",
            },
        ],
    }))
}

fn backend_scaffold(ctx: &TaskContext) -> Result<Value, TaskError> {
    let name = project_name(ctx);
    Ok(json!({
        "ok": true,
        "agent": "backend_scaffold",
        "files": [
            {
                "path": "backend/app.py",
                "content": format!("# {name} backend entrypoint\n\ndef health():\n    return {{\"ok\": True}}\n"),
            },
        ],
    }))
}

fn ai_features(ctx: &TaskContext) -> Result<Value, TaskError> {
    Ok(json!({
        "ok": true,
        "agent": "ai_features",
        "features": ["summarize", "classify", "suggest"],
        "project": project_name(ctx),
    }))
}

fn security_hardening(ctx: &TaskContext) -> Result<Value, TaskError> {
    Ok(json!({
        "ok": true,
        "agent": "security_hardening",
        "checks": [
            {"name": "headers", "status": "applied"},
            {"name": "rate_limit", "status": "applied"},
            {"name": "input_caps", "status": "applied"},
        ],
        "project": project_name(ctx),
    }))
}

fn testgen(ctx: &TaskContext) -> Result<Value, TaskError> {
    Ok(json!({
        "ok": true,
        "agent": "testgen",
        "suites": [
            {"name": "smoke", "cases": 3},
            {"name": "auth", "cases": 5},
        ],
        "project": project_name(ctx),
    }))
}

fn aggregate(ctx: &TaskContext) -> Result<Value, TaskError> {
    let parts = ctx
        .payload
        .get("parts")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    Ok(json!({
        "ok": true,
        "agent": "aggregate",
        "count": parts.len(),
        "parts": parts,
    }))
}

fn report(ctx: &TaskContext) -> Result<Value, TaskError> {
    let name = project_name(ctx);
    let summary = idea(ctx);
    Ok(json!({
        "ok": true,
        "agent": "report",
        "files": [
            {
                "path": "report/summary.md",
                "content": format!("# {name}\n\n{summary}\n"),
            },
        ],
    }))
}

fn pipeline(ctx: &TaskContext) -> Result<Value, TaskError> {
    let stages = ctx
        .payload
        .get("stages")
        .and_then(Value::as_array)
        .map(|a| a.len())
        .unwrap_or(4);
    Ok(json!({
        "ok": true,
        "agent": "pipeline",
        "stages_scheduled": stages,
        "project": project_name(ctx),
    }))
}

fn pipeline_waiter(ctx: &TaskContext) -> Result<Value, TaskError> {
    let parent = ctx.str_field("parent_job").unwrap_or("");
    if parent.is_empty() {
        return Err(TaskError::failed("pipeline_waiter: missing parent_job"));
    }
    Ok(json!({
        "ok": true,
        "agent": "pipeline_waiter",
        "parent_job": parent,
        "state": "observed",
    }))
}
