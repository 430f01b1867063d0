//! Org provisioning: list/create, plan changes, and bootstrap.

use std::str::FromStr;

use axum::extract::{Extension, Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};

use velu_auth::Scope;
use velu_core::{normalize_slug, OrgId, Plan};
use velu_store::{OrgRecord, StoreError};

use crate::app::dto::{clamp_limit, ListQuery, OrgCreateIn, OrgUpdatePlanIn};
use crate::app::errors::{json_error, store_error_to_response};
use crate::app::AppState;
use crate::middleware::{require_scopes, AuthContext};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/orgs", get(list_orgs).post(create_org))
        .route("/orgs/:org_id/plan", post(update_plan))
        .route("/orgs/bootstrap", post(bootstrap))
}

fn require_platform_admin(auth: &AuthContext) -> Result<(), Response> {
    let is_admin = auth
        .claims
        .as_ref()
        .map(|c| c.is_platform_admin)
        .unwrap_or(false);
    if is_admin {
        Ok(())
    } else {
        Err(json_error(
            StatusCode::UNAUTHORIZED,
            "invalid api key or org not found",
        ))
    }
}

fn org_item(org: &OrgRecord) -> Value {
    json!({
        "id": org.id.to_string(),
        "name": org.name,
        "slug": org.slug,
        "plan": org.plan.as_str(),
        "created_at": org.created_at,
    })
}

/// Create-or-return-existing by slug. Provisioning scripts re-run this.
async fn ensure_org(
    state: &AppState,
    slug: &str,
    name: &str,
    plan: Plan,
) -> Result<OrgRecord, Response> {
    let slug = normalize_slug(slug);
    match state.store.create_org(&slug, name.trim(), plan).await {
        Ok(org) => Ok(org),
        Err(StoreError::SlugTaken) => {
            let existing = state
                .store
                .list_orgs(1, Some(&slug))
                .await
                .map_err(store_error_to_response)?
                .into_iter()
                .find(|o| o.slug == slug);
            existing.ok_or_else(|| json_error(StatusCode::BAD_REQUEST, "slug_taken"))
        }
        Err(e) => Err(store_error_to_response(e)),
    }
}

pub async fn list_orgs(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Query(query): Query<ListQuery>,
) -> Response {
    if let Err(resp) = require_scopes(&state, &auth, &[Scope::ADMIN_ORGS_MANAGE]) {
        return resp;
    }

    let limit = clamp_limit(query.limit, 50, 500);
    let q = query.q.as_deref().map(str::trim).filter(|q| !q.is_empty());
    match state.store.list_orgs(limit, q).await {
        Ok(orgs) => {
            let items: Vec<Value> = orgs.iter().map(org_item).collect();
            Json(json!({ "ok": true, "items": items })).into_response()
        }
        Err(e) => store_error_to_response(e),
    }
}

pub async fn create_org(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Json(body): Json<OrgCreateIn>,
) -> Response {
    if let Err(resp) = require_scopes(&state, &auth, &[Scope::ADMIN_ORGS_MANAGE]) {
        return resp;
    }
    if let Err(resp) = require_platform_admin(&auth) {
        return resp;
    }

    match ensure_org(&state, &body.slug, &body.name, Plan::parse(&body.plan)).await {
        Ok(org) => Json(json!({ "ok": true, "item": org_item(&org) })).into_response(),
        Err(resp) => resp,
    }
}

pub async fn update_plan(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(org_id): Path<String>,
    Json(body): Json<OrgUpdatePlanIn>,
) -> Response {
    if let Err(resp) = require_scopes(&state, &auth, &[Scope::ADMIN_ORGS_MANAGE]) {
        return resp;
    }
    if let Err(resp) = require_platform_admin(&auth) {
        return resp;
    }

    let Ok(org_id) = OrgId::from_str(&org_id) else {
        return json_error(StatusCode::NOT_FOUND, "not_found");
    };
    let plan = Plan::parse(&body.plan);
    match state.store.update_org_plan(org_id, plan).await {
        Ok(_) => Json(json!({ "ok": true, "plan": plan.as_str() })).into_response(),
        Err(StoreError::NotFound) => json_error(StatusCode::NOT_FOUND, "not_found"),
        Err(e) => store_error_to_response(e),
    }
}

/// One-shot tenant provisioning: org + default project + a viewer, builder,
/// and admin key. Raw secrets appear here once and nowhere else.
pub async fn bootstrap(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Json(body): Json<OrgCreateIn>,
) -> Response {
    if let Err(resp) = require_scopes(&state, &auth, &[Scope::ADMIN_ORGS_MANAGE]) {
        return resp;
    }
    if let Err(resp) = require_platform_admin(&auth) {
        return resp;
    }

    let org = match ensure_org(&state, &body.slug, &body.name, Plan::parse(&body.plan)).await {
        Ok(org) => org,
        Err(resp) => return resp,
    };
    let project = match state.store.ensure_project(org.id, "default").await {
        Ok(project) => project,
        Err(e) => return store_error_to_response(e),
    };

    let allow_raw = state.config.allow_raw_keys();
    let key_specs: [(&str, &[&str]); 3] = [
        ("viewer", &["jobs:read"]),
        ("builder", &["jobs:submit", "jobs:read"]),
        ("admin", &["admin:api_keys:manage", "jobs:submit", "jobs:read"]),
    ];

    let mut keys = serde_json::Map::new();
    for (name, scopes) in key_specs {
        let scopes: Vec<String> = scopes.iter().map(|s| s.to_string()).collect();
        let mut item = match super::admin::mint_key(&state, org.id, name, scopes).await {
            Ok(item) => item,
            Err(e) => return store_error_to_response(e),
        };
        if !allow_raw {
            if let Some(obj) = item.as_object_mut() {
                obj.remove("raw_key");
            }
        }
        keys.insert(name.to_string(), item);
    }

    Json(json!({
        "ok": true,
        "org": org_item(&org),
        "project": {
            "id": project.id.to_string(),
            "org_id": project.org_id.to_string(),
            "name": project.name,
            "created_at": project.created_at,
        },
        "keys": keys,
    }))
    .into_response()
}
