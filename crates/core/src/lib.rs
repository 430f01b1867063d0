//! `velu-core` — domain foundation building blocks.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns).

pub mod error;
pub mod id;
pub mod plan;
pub mod slug;

pub use error::{DomainError, DomainResult};
pub use id::{ApiKeyId, JobId, OrgId, ProjectId};
pub use plan::{Plan, Tier};
pub use slug::normalize_slug;
