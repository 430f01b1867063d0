//! `velu-auth` — pure authentication/authorization primitives.
//!
//! This crate is intentionally decoupled from HTTP and storage: it knows how
//! to hash, mask, and identify credentials and how to derive roles and tiers
//! from them, but never touches a request or a database.

pub mod claims;
pub mod keys;
pub mod keyset;
pub mod scopes;

pub use claims::{ActorType, Claims, Role};
pub use keys::{generate_raw_key, hash_key, key_id, mask_key};
pub use keyset::{parse_api_keys, KeysetEntry};
pub use scopes::{normalize_scopes, Scope};
