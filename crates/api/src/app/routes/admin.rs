//! Org-admin surface: API key lifecycle and recent jobs.
//!
//! Everything here is scoped to the caller's own org; the platform admin
//! key is tenant-less and deliberately cannot use these routes.

use std::str::FromStr;

use axum::extract::{Extension, Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};

use velu_auth::{generate_raw_key, hash_key, Scope};
use velu_contracts::JobItem;
use velu_core::{ApiKeyId, OrgId};
use velu_store::{NewApiKey, StoreError};

use crate::app::dto::{api_key_item, clamp_limit, ApiKeyCreateIn, ListQuery};
use crate::app::errors::{json_error, store_error_to_response};
use crate::app::AppState;
use crate::middleware::{require_scopes, AuthContext};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api-keys", post(create_key).get(list_keys))
        .route("/api-keys/:key_id/revoke", post(revoke_key))
        .route("/api-keys/:key_id/rotate", post(rotate_key))
        .route("/jobs", get(list_jobs))
}

fn admin_org(state: &AppState, auth: &AuthContext) -> Result<OrgId, Response> {
    require_scopes(state, auth, &[Scope::ADMIN_API_KEYS_MANAGE])?;
    auth.claims
        .as_ref()
        .and_then(|c| c.org_id)
        .ok_or_else(|| {
            json_error(
                StatusCode::UNAUTHORIZED,
                "invalid api key or org not found",
            )
        })
}

/// Generate a raw secret, store only its hash, and return the wire item
/// carrying the raw key (the one time it is ever visible).
pub(crate) async fn mint_key(
    state: &AppState,
    org_id: OrgId,
    name: &str,
    scopes: Vec<String>,
) -> Result<Value, StoreError> {
    let raw = generate_raw_key();
    let hashed = hash_key(&raw, &state.config.key_pepper);
    let record = state
        .store
        .create_api_key(NewApiKey {
            org_id,
            name: name.to_string(),
            scopes,
            hashed_key: hashed,
            expires_at: None,
        })
        .await?;
    Ok(api_key_item(&record, Some(&raw)))
}

pub async fn create_key(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Json(body): Json<ApiKeyCreateIn>,
) -> Response {
    let org = match admin_org(&state, &auth) {
        Ok(org) => org,
        Err(resp) => return resp,
    };
    let name = body.name.trim();
    if name.is_empty() {
        return json_error(StatusCode::BAD_REQUEST, "invalid_name");
    }
    match mint_key(&state, org, name, body.scopes).await {
        Ok(item) => Json(json!({ "ok": true, "item": item })).into_response(),
        Err(e) => store_error_to_response(e),
    }
}

pub async fn list_keys(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
) -> Response {
    let org = match admin_org(&state, &auth) {
        Ok(org) => org,
        Err(resp) => return resp,
    };
    match state.store.list_api_keys(org).await {
        Ok(keys) => {
            let items: Vec<Value> = keys.iter().map(|k| api_key_item(k, None)).collect();
            Json(json!({ "ok": true, "items": items })).into_response()
        }
        Err(e) => store_error_to_response(e),
    }
}

pub async fn revoke_key(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(key_id): Path<String>,
) -> Response {
    let org = match admin_org(&state, &auth) {
        Ok(org) => org,
        Err(resp) => return resp,
    };
    let Ok(key_id) = ApiKeyId::from_str(&key_id) else {
        return json_error(StatusCode::NOT_FOUND, "not_found");
    };
    match state.store.revoke_api_key(org, key_id).await {
        Ok(()) => Json(json!({ "ok": true })).into_response(),
        Err(StoreError::NotFound) => json_error(StatusCode::NOT_FOUND, "not_found"),
        Err(e) => store_error_to_response(e),
    }
}

pub async fn rotate_key(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(key_id): Path<String>,
) -> Response {
    let org = match admin_org(&state, &auth) {
        Ok(org) => org,
        Err(resp) => return resp,
    };
    let Ok(key_id) = ApiKeyId::from_str(&key_id) else {
        return json_error(StatusCode::NOT_FOUND, "not_found");
    };

    let raw = generate_raw_key();
    let hashed = hash_key(&raw, &state.config.key_pepper);
    match state.store.rotate_api_key(org, key_id, &hashed, None).await {
        Ok(record) => {
            Json(json!({ "ok": true, "item": api_key_item(&record, Some(&raw)) })).into_response()
        }
        Err(StoreError::NotFound) => json_error(StatusCode::NOT_FOUND, "not_found"),
        Err(e) => store_error_to_response(e),
    }
}

pub async fn list_jobs(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Query(query): Query<ListQuery>,
) -> Response {
    let org = match admin_org(&state, &auth) {
        Ok(org) => org,
        Err(resp) => return resp,
    };
    let limit = clamp_limit(query.limit, 50, 500);
    match state.store.list_recent_for_org(org, limit).await {
        Ok(records) => {
            let items: Vec<JobItem> = records.iter().map(JobItem::from_record).collect();
            Json(json!({ "items": items })).into_response()
        }
        Err(e) => store_error_to_response(e),
    }
}
