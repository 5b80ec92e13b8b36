use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json,
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::IntoResponse,
};

use devpulse_infra::handlers::SyncPayload;
use devpulse_infra::jobs::{JobId, JobOptions, JobPriority, JobStatus, JobType};

use crate::app::routes::blocking;
use crate::app::services::AppServices;
use crate::app::{dto, errors};

const DEFAULT_LIST_LIMIT: usize = 50;
const MAX_LIST_LIMIT: usize = 500;

fn bad_request(code: &'static str, message: impl Into<String>) -> axum::response::Response {
    errors::json_error(StatusCode::BAD_REQUEST, code, message)
}

fn job_options(body: &dto::AddJobRequest) -> Result<JobOptions, axum::response::Response> {
    let mut options = JobOptions::new();
    if let Some(priority) = &body.priority {
        let priority: JobPriority = priority
            .parse()
            .map_err(|e| bad_request("invalid_priority", format!("{e}")))?;
        options = options.priority(priority);
    }
    if let Some(id) = &body.id {
        let id: JobId = id.parse().map_err(|e| bad_request("invalid_job_id", format!("{e}")))?;
        options = options.id(id);
    }
    if let Some(max_attempts) = body.max_attempts {
        options = options.max_attempts(max_attempts);
    }
    if let Some(delay_ms) = body.delay_ms {
        options = options.delay(Duration::from_millis(delay_ms));
    }
    Ok(options)
}

async fn submit(
    services: Arc<AppServices>,
    job_type: JobType,
    payload: serde_json::Value,
    options: JobOptions,
) -> axum::response::Response {
    let queue = services.queue.clone();
    match blocking(move || queue.add_job(job_type, payload, options)).await {
        Ok(Ok(job)) => (StatusCode::CREATED, Json(dto::JobAccepted::from(&job))).into_response(),
        Ok(Err(e)) => errors::queue_error_to_response(e),
        Err(resp) => resp,
    }
}

pub async fn add_job(
    Extension(services): Extension<Arc<AppServices>>,
    Json(body): Json<dto::AddJobRequest>,
) -> axum::response::Response {
    let job_type: JobType = match body.job_type.parse() {
        Ok(t) => t,
        Err(e) => return bad_request("invalid_job_type", format!("{e}")),
    };
    let options = match job_options(&body) {
        Ok(o) => o,
        Err(resp) => return resp,
    };

    submit(services, job_type, body.payload, options).await
}

/// Enqueue a full (INITIAL_SYNC) or incremental sync for one user.
pub async fn sync(
    Extension(services): Extension<Arc<AppServices>>,
    Json(body): Json<dto::SyncRequest>,
) -> axum::response::Response {
    let job_type = if body.initial {
        JobType::InitialSync
    } else {
        JobType::IncrementalSync
    };
    let payload = SyncPayload {
        user_id: body.user_id,
        repository_ids: body.repository_ids,
    };
    let payload = match serde_json::to_value(&payload) {
        Ok(v) => v,
        Err(e) => return bad_request("invalid_payload", e.to_string()),
    };

    submit(services, job_type, payload, JobOptions::new()).await
}

pub async fn get_job(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let job_id: JobId = match id.parse() {
        Ok(id) => id,
        Err(e) => return bad_request("invalid_job_id", format!("{e}")),
    };

    let queue = services.queue.clone();
    match blocking(move || queue.get_job(&job_id)).await {
        Ok(Ok(Some(job))) => Json(job).into_response(),
        Ok(Ok(None)) => errors::json_error(StatusCode::NOT_FOUND, "not_found", format!("job {id} not found")),
        Ok(Err(e)) => errors::queue_error_to_response(e),
        Err(resp) => resp,
    }
}

pub async fn list_jobs(
    Extension(services): Extension<Arc<AppServices>>,
    Query(query): Query<dto::ListJobsQuery>,
) -> axum::response::Response {
    let status: Option<JobStatus> = match query.status.as_deref().map(str::parse::<JobStatus>).transpose() {
        Ok(s) => s,
        Err(e) => return bad_request("invalid_status", format!("{e}")),
    };
    let limit = query
        .limit
        .unwrap_or(DEFAULT_LIST_LIMIT)
        .clamp(1, MAX_LIST_LIMIT);

    let queue = services.queue.clone();
    match blocking(move || queue.list(status, limit)).await {
        Ok(Ok(jobs)) => Json(jobs).into_response(),
        Ok(Err(e)) => errors::queue_error_to_response(e),
        Err(resp) => resp,
    }
}

pub async fn stats(Extension(services): Extension<Arc<AppServices>>) -> axum::response::Response {
    let queue = services.queue.clone();
    match blocking(move || queue.stats()).await {
        Ok(Ok(stats)) => Json(stats).into_response(),
        Ok(Err(e)) => errors::queue_error_to_response(e),
        Err(resp) => resp,
    }
}
