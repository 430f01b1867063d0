//! Health, readiness, version, and the task allowlist.

use axum::extract::{Extension, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;

use velu_core::{Plan, Tier};

use crate::app::errors::json_error;
use crate::app::AppState;
use crate::middleware::AuthContext;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/version", get(version))
        .route("/tasks/allowed", get(tasks_allowed))
}

pub async fn health() -> Response {
    (
        [("server", "velu")],
        Json(json!({ "ok": true, "app": "velu" })),
    )
        .into_response()
}

pub async fn ready(State(state): State<AppState>) -> Response {
    match state.store.ping().await {
        Ok(()) => Json(json!({ "ok": true, "db": { "reachable": true } })).into_response(),
        Err(e) => json_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

pub async fn version() -> Json<serde_json::Value> {
    Json(json!({
        "ok": true,
        "app": "velu",
        "api_version": env!("CARGO_PKG_VERSION"),
    }))
}

/// The caller's entitlement view. Anonymous callers see the legacy default
/// (full access), which is only reachable on open local instances anyway.
pub async fn tasks_allowed(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
) -> Json<serde_json::Value> {
    let tier = auth
        .claims
        .as_ref()
        .map(|c| c.tier)
        .unwrap_or(Tier::Enterprise);
    let plan = match tier {
        Tier::Starter => Plan::Base,
        Tier::Growth => Plan::Hero,
        Tier::Enterprise => Plan::Superhero,
    };
    Json(velu_policy::tasks_allowed_response(
        state.config.env.as_str(),
        plan,
        tier,
        &state.registered_tasks,
    ))
}
