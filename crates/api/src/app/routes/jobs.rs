//! Tenant-explicit job routes under `/orgs/{org_id}/...`.

use std::str::FromStr;

use axum::extract::{Extension, Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde_json::{json, Value};

use velu_auth::Scope;
use velu_contracts::{JobItem, JobRecord};
use velu_core::{JobId, OrgId, ProjectId};

use crate::app::dto::TaskIn;
use crate::app::errors::{json_error, store_error_to_response};
use crate::app::AppState;
use crate::middleware::{require_scopes, AuthContext};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/orgs/:org_id/projects/:project_id/jobs", post(create_job))
        .route("/orgs/:org_id/jobs/:job_id", get(read_job))
}

/// The caller's claims must carry the org named in the path. A mismatch is
/// indistinguishable from the resource not existing.
fn claims_org_for(auth: &AuthContext, path_org: OrgId) -> Result<OrgId, Response> {
    let claims_org = auth.claims.as_ref().and_then(|c| c.org_id);
    let Some(org) = claims_org else {
        return Err(json_error(
            StatusCode::UNAUTHORIZED,
            "invalid_api_key_or_org_not_found",
        ));
    };
    if org != path_org {
        return Err(json_error(StatusCode::NOT_FOUND, "not_found_org_mismatch"));
    }
    Ok(org)
}

pub async fn create_job(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path((org_id, project_id)): Path<(String, String)>,
    Json(body): Json<TaskIn>,
) -> Response {
    if let Err(resp) = require_scopes(&state, &auth, &[Scope::JOBS_SUBMIT]) {
        return resp;
    }

    let Ok(org_id) = OrgId::from_str(&org_id) else {
        return json_error(StatusCode::NOT_FOUND, "not_found_org_mismatch");
    };
    let org = match claims_org_for(&auth, org_id) {
        Ok(org) => org,
        Err(resp) => return resp,
    };

    let Ok(project_id) = ProjectId::from_str(&project_id) else {
        return json_error(StatusCode::NOT_FOUND, "not_found_project_not_in_org");
    };
    match state.store.project_belongs_to_org(project_id, org).await {
        Ok(true) => {}
        Ok(false) => {
            return json_error(StatusCode::NOT_FOUND, "not_found_project_not_in_org")
        }
        Err(e) => return store_error_to_response(e),
    }

    let task = body.task.trim().to_string();
    if let Err(resp) = super::tasks::check_task_allowed(&state, &task, auth.claims.as_ref()) {
        return resp;
    }

    // Attribution is mandatory here: unattributed jobs never enter a tenant.
    let claims = auth.claims.as_ref();
    let Some(actor_id) = claims.and_then(|c| c.actor_id.clone()) else {
        return json_error(StatusCode::UNAUTHORIZED, "invalid_actor");
    };
    let actor_type = claims
        .map(|c| c.actor_type.as_str().to_string())
        .unwrap_or_else(|| "api_key".to_string());

    let payload =
        match super::tasks::prepare_payload(&body.payload, claims, Some(org), Some(project_id)) {
            Ok(p) => p,
            Err(resp) => return resp,
        };

    let job = JobRecord::queued(
        task,
        Value::Object(payload),
        0,
        Some(org),
        Some(project_id),
        Some(actor_type),
        Some(actor_id),
        Utc::now(),
    );

    match state.store.enqueue(job).await {
        Ok(job_id) => Json(json!({ "ok": true, "job_id": job_id.to_string() })).into_response(),
        Err(e) => store_error_to_response(e),
    }
}

pub async fn read_job(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path((org_id, job_id)): Path<(String, String)>,
) -> Response {
    if let Err(resp) = require_scopes(&state, &auth, &[Scope::JOBS_READ]) {
        return resp;
    }

    let Ok(org_id) = OrgId::from_str(&org_id) else {
        return json_error(StatusCode::NOT_FOUND, "not_found");
    };
    let claims_org = auth.claims.as_ref().and_then(|c| c.org_id);
    let Some(org) = claims_org else {
        return json_error(
            StatusCode::UNAUTHORIZED,
            "invalid_api_key_or_org_not_found",
        );
    };
    if org != org_id {
        return json_error(StatusCode::NOT_FOUND, "not_found");
    }

    let Ok(job_id) = JobId::from_str(&job_id) else {
        return json_error(StatusCode::NOT_FOUND, "not_found");
    };
    match state.store.get_job_for_org(job_id, org).await {
        Ok(Some(record)) => {
            Json(json!({ "ok": true, "item": JobItem::from_record(&record) })).into_response()
        }
        Ok(None) => json_error(StatusCode::NOT_FOUND, "not_found"),
        Err(e) => store_error_to_response(e),
    }
}
