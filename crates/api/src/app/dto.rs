use serde::{Deserialize, Serialize};

use devpulse_core::{RepositoryId, UserId};
use devpulse_infra::jobs::{Job, JobId, JobStatus, JobType};

// -------------------------
// Request DTOs
// -------------------------

/// Body of `POST /jobs`. `type` and `priority` are parsed by hand so an
/// unknown value maps to a 400 with a specific error code.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddJobRequest {
    #[serde(rename = "type")]
    pub job_type: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    pub priority: Option<String>,
    pub id: Option<String>,
    pub max_attempts: Option<u32>,
    pub delay_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequest {
    pub user_id: UserId,
    pub repository_ids: Option<Vec<RepositoryId>>,
    #[serde(default)]
    pub initial: bool,
}

#[derive(Debug, Deserialize)]
pub struct ListJobsQuery {
    pub status: Option<String>,
    pub limit: Option<usize>,
}

// -------------------------
// Response DTOs
// -------------------------

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobAccepted {
    pub job_id: JobId,
    #[serde(rename = "type")]
    pub job_type: JobType,
    pub status: JobStatus,
}

impl From<&Job> for JobAccepted {
    fn from(job: &Job) -> Self {
        Self {
            job_id: job.id.clone(),
            job_type: job.job_type,
            status: job.status,
        }
    }
}
