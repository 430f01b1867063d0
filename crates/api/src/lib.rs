//! HTTP gateway: routing, middleware, and request/response mapping.
//!
//! The gateway only ever sees the *names* of registered tasks; handlers are
//! linked by the worker binary and passed in here as data.

pub mod app;
pub mod config;
pub mod middleware;
