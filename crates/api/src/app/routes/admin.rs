use std::sync::Arc;

use axum::{
    Json, Router,
    extract::Extension,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};

use crate::app::services::AppServices;

pub fn router() -> Router {
    Router::new()
        .route("/scheduler", get(scheduler_status))
        .route("/scheduler/trigger", post(trigger_scheduler))
}

/// Request an out-of-cycle TEAM_METRICS batch. Triggers are coalesced.
pub async fn trigger_scheduler(Extension(services): Extension<Arc<AppServices>>) -> impl IntoResponse {
    services.trigger_scheduler();
    tracing::info!("team metrics batch triggered");
    (StatusCode::ACCEPTED, Json(serde_json::json!({ "triggered": true })))
}

pub async fn scheduler_status(Extension(services): Extension<Arc<AppServices>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "backend": services.backend,
        "backgroundJobsEnabled": services.queue.background_jobs_enabled(),
        "lastBatch": services.last_batch(),
    }))
}
