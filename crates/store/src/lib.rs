//! `velu-store` — durable state for orgs, projects, API keys, and jobs.
//!
//! One [`Store`] trait, two backends: [`MemoryStore`] for local/test runs
//! and [`PostgresStore`] for real deployments. The trait is the only thing
//! the gateway and worker see.

pub mod error;
pub mod memory;
pub mod migrations;
pub mod postgres;
pub mod store;
pub mod types;

pub use error::StoreError;
pub use memory::MemoryStore;
pub use postgres::PostgresStore;
pub use store::{SharedStore, Store};
pub use types::{ApiKeyRecord, NewApiKey, OrgRecord, ProjectRecord};
