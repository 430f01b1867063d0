//! Application wiring: state, router, and middleware stack.
//!
//! Layout:
//! - `routes/`: HTTP handlers, one file per surface area
//! - `dto.rs`: request bodies and response-shaping helpers
//! - `errors.rs`: the `{"detail": code}` error envelope

use std::collections::BTreeSet;
use std::sync::Arc;

use axum::middleware::from_fn_with_state;
use axum::Router;
use tower::ServiceBuilder;

use velu_store::SharedStore;

use crate::config::AppConfig;
use crate::middleware::{self, RateLimiter};

pub mod dto;
pub mod errors;
pub mod routes;

/// Shared gateway state. Cheap to clone; everything heavy is behind an Arc.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub store: SharedStore,
    /// Names of registered tasks, handed in by the binary. The gateway
    /// never holds the handlers themselves.
    pub registered_tasks: Arc<BTreeSet<String>>,
    pub rate: Arc<RateLimiter>,
}

impl AppState {
    pub fn new(config: AppConfig, store: SharedStore, registered_tasks: BTreeSet<String>) -> Self {
        Self {
            config: Arc::new(config),
            store,
            registered_tasks: Arc::new(registered_tasks),
            rate: Arc::new(RateLimiter::default()),
        }
    }
}

/// Build the full router (public entrypoint used by `main.rs` and tests).
///
/// Request flow, outermost first: headers/CORS, then authentication, then
/// the size/rate/audit guard, then the route handlers.
pub fn build_app(state: AppState) -> Router {
    routes::router(state.clone()).layer(
        ServiceBuilder::new()
            .layer(from_fn_with_state(state.clone(), middleware::headers_middleware))
            .layer(from_fn_with_state(state.clone(), middleware::auth_middleware))
            .layer(from_fn_with_state(state, middleware::guard_middleware)),
    )
}
