use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use devpulse_analytics::StoreError;
use devpulse_infra::jobs::{JobStoreError, QueueError};

pub fn queue_error_to_response(err: QueueError) -> axum::response::Response {
    match err {
        QueueError::Disabled => json_error(
            StatusCode::FORBIDDEN,
            "background_jobs_disabled",
            "background jobs are disabled",
        ),
        QueueError::InvalidJobType(_) => json_error(StatusCode::BAD_REQUEST, "invalid_job_type", err.to_string()),
        QueueError::InvalidPayload(msg) => json_error(StatusCode::BAD_REQUEST, "invalid_payload", msg),
        QueueError::Store(JobStoreError::NotFound(id)) => {
            json_error(StatusCode::NOT_FOUND, "not_found", format!("job {id} not found"))
        }
        QueueError::Store(e) => json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", e.to_string()),
    }
}

pub fn store_error_to_response(err: StoreError) -> axum::response::Response {
    match err {
        StoreError::NotFound(msg) => json_error(StatusCode::NOT_FOUND, "not_found", msg),
        e => json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", e.to_string()),
    }
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}
