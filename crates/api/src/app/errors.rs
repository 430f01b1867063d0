use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use velu_store::StoreError;

/// The error envelope every non-2xx response uses.
pub fn json_error(status: StatusCode, code: impl Into<String>) -> Response {
    (status, Json(json!({ "detail": code.into() }))).into_response()
}

pub fn store_error_to_response(err: StoreError) -> Response {
    match err {
        StoreError::NotFound => json_error(StatusCode::NOT_FOUND, "not_found"),
        StoreError::Conflict(msg) => json_error(StatusCode::CONFLICT, msg),
        StoreError::SlugTaken => json_error(StatusCode::BAD_REQUEST, "slug_taken"),
        StoreError::AttributionRequired => json_error(StatusCode::UNAUTHORIZED, "invalid_actor"),
        StoreError::Backend(e) => {
            tracing::error!("store error: {e}");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "internal_error")
        }
    }
}
