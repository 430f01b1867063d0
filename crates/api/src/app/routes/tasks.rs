//! Untenanted submission surface: `POST /tasks`, results, recent.
//!
//! Tenancy rides in on the claims here; the org-explicit routes live in
//! `jobs.rs`.

use std::str::FromStr;

use axum::extract::{Extension, Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use rand::RngCore;
use serde_json::{json, Map, Value};

use velu_auth::{Claims, Role, Scope};
use velu_contracts::{sanitize_payload_object, JobItem, JobRecord};
use velu_core::{JobId, OrgId, ProjectId, Tier};

use crate::app::dto::{clamp_limit, ListQuery, TaskIn};
use crate::app::errors::{json_error, store_error_to_response};
use crate::app::AppState;
use crate::middleware::{require_role, require_scopes, AuthContext};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/tasks", post(post_task))
        .route("/tasks/recent", get(tasks_recent))
        .route("/results/:job_id", get(get_result))
}

fn run_id() -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Reject client-reserved keys, then attach the server-side `_velu` block.
pub(crate) fn prepare_payload(
    payload: &Map<String, Value>,
    claims: Option<&Claims>,
    org_id: Option<OrgId>,
    project_id: Option<ProjectId>,
) -> Result<Map<String, Value>, Response> {
    if payload.keys().any(|k| k.starts_with('_')) {
        return Err(json_error(StatusCode::BAD_REQUEST, "payload_reserved_keys"));
    }

    let mut meta = Map::new();
    meta.insert("run_id".to_string(), json!(run_id()));
    meta.insert(
        "actor_type".to_string(),
        json!(claims.map(|c| c.actor_type.as_str()).unwrap_or("api_key")),
    );
    if let Some(actor_id) = claims.and_then(|c| c.actor_id.as_deref()) {
        meta.insert("actor_id".to_string(), json!(actor_id));
    }
    if let Some(org) = org_id {
        meta.insert("org_id".to_string(), json!(org.to_string()));
    }
    if let Some(project) = project_id {
        meta.insert("project_id".to_string(), json!(project.to_string()));
    }

    let mut out = sanitize_payload_object(&Value::Object(payload.clone()));
    out.insert("_velu".to_string(), Value::Object(meta));
    if let Some(org) = org_id {
        out.insert("_org_id".to_string(), json!(org.to_string()));
    }
    Ok(out)
}

/// Registry membership first (400), then the tier gate (403).
pub(crate) fn check_task_allowed(
    state: &AppState,
    task: &str,
    claims: Option<&Claims>,
) -> Result<(), Response> {
    if !state.registered_tasks.contains(task) {
        return Err(json_error(StatusCode::BAD_REQUEST, "task_not_allowed"));
    }
    let tier = claims.map(|c| c.tier).unwrap_or(Tier::Enterprise);
    let is_admin = claims.map(|c| c.is_platform_admin).unwrap_or(false);
    if !velu_policy::task_allowed(
        task,
        tier,
        &state.registered_tasks,
        state.config.tier_gate_enforced(),
        is_admin,
    ) {
        return Err(json_error(StatusCode::FORBIDDEN, "upgrade_required"));
    }
    Ok(())
}

pub async fn post_task(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Json(body): Json<TaskIn>,
) -> Response {
    if let Err(resp) = require_scopes(&state, &auth, &[Scope::JOBS_SUBMIT]) {
        return resp;
    }
    if let Err(resp) = require_role(&state, &auth, Role::Builder) {
        return resp;
    }

    let task = body.task.trim().to_string();
    if let Err(resp) = check_task_allowed(&state, &task, auth.claims.as_ref()) {
        return resp;
    }

    let claims = auth.claims.as_ref();
    let org_id = claims.and_then(|c| c.org_id);
    let payload = match prepare_payload(&body.payload, claims, org_id, None) {
        Ok(p) => p,
        Err(resp) => return resp,
    };

    let job = JobRecord::queued(
        task,
        Value::Object(payload),
        0,
        org_id,
        None,
        Some(
            claims
                .map(|c| c.actor_type.as_str().to_string())
                .unwrap_or_else(|| "api_key".to_string()),
        ),
        claims.and_then(|c| c.actor_id.clone()),
        Utc::now(),
    );

    match state.store.enqueue(job).await {
        Ok(job_id) => Json(json!({ "ok": true, "job_id": job_id.to_string() })).into_response(),
        Err(e) => store_error_to_response(e),
    }
}

pub async fn get_result(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(job_id): Path<String>,
) -> Response {
    if let Err(resp) = require_scopes(&state, &auth, &[Scope::JOBS_READ]) {
        return resp;
    }
    if let Err(resp) = require_role(&state, &auth, Role::Viewer) {
        return resp;
    }

    let not_found = || Json(json!({ "ok": false, "error": "not_found" })).into_response();

    let Ok(job_id) = JobId::from_str(&job_id) else {
        return not_found();
    };
    let record = match state.store.get_job(job_id).await {
        Ok(Some(record)) => record,
        Ok(None) => return not_found(),
        Err(e) => return store_error_to_response(e),
    };

    // Org isolation: in tenanted mode the caller must own the job. The
    // response never distinguishes "wrong org" from "no such job".
    if state.config.store_credentials {
        let caller_org = auth.claims.as_ref().and_then(|c| c.org_id);
        match (caller_org, record.org_id) {
            (Some(caller), Some(owner)) if caller == owner => {}
            _ => return not_found(),
        }
    }

    Json(json!({ "ok": true, "item": JobItem::from_record(&record) })).into_response()
}

pub async fn tasks_recent(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Query(query): Query<ListQuery>,
) -> Response {
    if let Err(resp) = require_scopes(&state, &auth, &[Scope::JOBS_READ]) {
        return resp;
    }

    let limit = clamp_limit(query.limit, 20, 200);
    let caller_org = auth.claims.as_ref().and_then(|c| c.org_id);
    let rows = match caller_org {
        Some(org) => state.store.list_recent_for_org(org, limit).await,
        None if state.config.store_credentials => {
            // Tenanted mode with no org on the claims: nothing to show.
            return Json(json!({ "ok": true, "items": [] })).into_response();
        }
        None => state.store.list_recent(limit).await,
    };

    match rows {
        Ok(records) => {
            let items: Vec<JobItem> = records.iter().map(JobItem::from_record).collect();
            Json(json!({ "ok": true, "items": items })).into_response()
        }
        Err(e) => store_error_to_response(e),
    }
}
