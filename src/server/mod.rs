//! Status HTTP API.
//!
//! Read-only views over bulk commands and migrations, served with axum.

pub mod routes;

pub use routes::{build_router, serve, AppState};
