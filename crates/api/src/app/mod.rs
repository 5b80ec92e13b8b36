//! HTTP API application wiring (Axum router + service wiring).
//!
//! - `services.rs`: queue, worker pool, handlers and scheduler wiring
//! - `routes/`: HTTP routes + handlers
//! - `dto.rs`: request/response DTOs
//! - `errors.rs`: consistent error responses

use std::sync::Arc;

use axum::{Extension, Router, routing::get};
use tower::ServiceBuilder;

pub mod dto;
pub mod errors;
pub mod routes;
pub mod services;

/// Build the full HTTP router from environment configuration (used by `main.rs`).
pub async fn build_app() -> anyhow::Result<Router> {
    let services = services::build_services().await?;
    Ok(router_with(Arc::new(services)))
}

/// Router over already-wired services; tests use this with their own config.
pub fn router_with(services: Arc<services::AppServices>) -> Router {
    Router::new()
        .route("/health", get(routes::system::health))
        .merge(routes::router())
        .layer(ServiceBuilder::new().layer(Extension(services)))
}
