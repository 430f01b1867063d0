use axum::Router;

use crate::app::AppState;

pub mod admin;
pub mod jobs;
pub mod orgs;
pub mod system;
pub mod tasks;

pub fn router(state: AppState) -> Router {
    Router::new()
        .merge(system::router())
        .merge(tasks::router())
        .merge(jobs::router())
        .merge(orgs::router())
        .nest("/admin", admin::router())
        .with_state(state)
}
