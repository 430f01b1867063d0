//! `velu-worker` — claims jobs, runs their handlers, and records outcomes.
//!
//! The loop is deliberately simple: claim one job, give it a private
//! workspace, run its handler to completion, write the result back. Leasing
//! in the store covers us if a worker dies mid-job.

pub mod runner;
pub mod workspace;

pub use runner::{Worker, WorkerConfig};
pub use workspace::materialize_files;
