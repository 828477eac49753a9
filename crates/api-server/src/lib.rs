//! REST surface of the outreach engine: sequence admin, enrollments,
//! operator tasks, provider webhooks and health probes.

#![warn(clippy::unwrap_used)]

pub mod enrollment_rest;
pub mod idempotency;
pub mod rest;
pub mod sequence_rest;
pub mod server;
pub mod swagger;
pub mod webhook_rest;

pub use rest::AppState;
pub use server::{build_router, ApiServer};
pub use swagger::ApiDoc;
