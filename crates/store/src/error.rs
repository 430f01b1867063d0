//! Store error model.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    /// The row the caller named does not exist (in their tenant).
    #[error("not found")]
    NotFound,

    /// A state transition was refused (e.g. cancelling a non-queued job).
    #[error("conflict: {0}")]
    Conflict(String),

    /// Org slug already taken.
    #[error("slug already exists")]
    SlugTaken,

    /// A tenanted backend refused a row without org attribution.
    #[error("org attribution is required")]
    AttributionRequired,

    /// Anything the backend itself reported.
    #[error("backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn backend(msg: impl Into<String>) -> Self {
        Self::Backend(msg.into())
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Self::NotFound,
            sqlx::Error::Database(db) if db.is_unique_violation() => Self::SlugTaken,
            other => Self::Backend(other.to_string()),
        }
    }
}
