use axum::{
    Router,
    http::StatusCode,
    routing::{get, post},
};

use crate::app::errors;

pub mod admin;
pub mod jobs;
pub mod metrics;
pub mod system;

/// Router for every endpoint except `/health`.
pub fn router() -> Router {
    Router::new()
        .route("/jobs", post(jobs::add_job).get(jobs::list_jobs))
        .route("/jobs/stats", get(jobs::stats))
        .route("/jobs/:id", get(jobs::get_job))
        .route("/sync", post(jobs::sync))
        .route("/repositories/:id/metrics", get(metrics::team_metrics))
        .nest("/admin", admin::router())
}

/// Run a synchronous store call off the async executor.
///
/// Job and metrics stores block (Redis and Postgres are bridged with
/// `block_on`), so they never run on a runtime worker thread.
pub(crate) async fn blocking<T, F>(f: F) -> Result<T, axum::response::Response>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f).await.map_err(|e| {
        errors::json_error(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", e.to_string())
    })
}
