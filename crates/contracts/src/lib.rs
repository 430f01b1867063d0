//! `velu-contracts` — wire and persistence contracts shared by the gateway,
//! store, and worker.
//!
//! Everything that crosses a process boundary (HTTP payloads, persisted job
//! rows, worker results) goes through the types and sanitizer in this crate.

pub mod envelope;
pub mod job;
pub mod sanitize;
pub mod status;

pub use envelope::{decode_task_and_payload, loads_json_maybe, TaskEnvelope};
pub use job::{JobItem, JobRecord};
pub use sanitize::{sanitize_json, sanitize_payload_object};
pub use status::JobStatus;
