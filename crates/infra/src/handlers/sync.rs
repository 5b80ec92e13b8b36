use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use devpulse_analytics::{DataStore, RepositoryHost, RepositoryRef};
use devpulse_core::{RepositoryId, UserId};

use super::{host_failure, store_failure};
use crate::jobs::{HandlerError, JobContext, JobHandler};

/// Payload of INITIAL_SYNC and INCREMENTAL_SYNC jobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncPayload {
    pub user_id: UserId,
    /// Restrict the sync to these repositories; all of the user's otherwise.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository_ids: Option<Vec<RepositoryId>>,
}

/// Result recorded on a completed sync job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub repositories: usize,
    pub commits_fetched: usize,
    pub commits_stored: usize,
    pub failed_repositories: Vec<String>,
}

/// Pulls repositories and commits from the host into the data store.
pub struct SyncHandler {
    host: Arc<dyn RepositoryHost>,
    data: Arc<dyn DataStore>,
    /// Full history when true; only commits newer than the stored ones otherwise.
    full_history: bool,
}

impl SyncHandler {
    pub fn initial(host: Arc<dyn RepositoryHost>, data: Arc<dyn DataStore>) -> Self {
        Self {
            host,
            data,
            full_history: true,
        }
    }

    pub fn incremental(host: Arc<dyn RepositoryHost>, data: Arc<dyn DataStore>) -> Self {
        Self {
            host,
            data,
            full_history: false,
        }
    }

    fn sync_repository(&self, repository: &RepositoryRef) -> Result<(usize, usize), HandlerError> {
        self.data.upsert_repository(repository).map_err(store_failure)?;

        let since = if self.full_history {
            None
        } else {
            self.data
                .latest_commit_at(repository.id)
                .map_err(store_failure)?
        };
        let commits = self
            .host
            .fetch_commits(repository, since)
            .map_err(host_failure)?;
        let stored = self.data.store_commits(&commits).map_err(store_failure)?;
        Ok((commits.len(), stored))
    }
}

impl JobHandler for SyncHandler {
    fn handle(&self, ctx: &JobContext<'_>) -> Result<serde_json::Value, HandlerError> {
        let payload: SyncPayload = ctx.payload()?;

        let mut repositories = self
            .host
            .list_repositories(payload.user_id)
            .map_err(host_failure)?;
        if let Some(wanted) = &payload.repository_ids {
            repositories.retain(|r| wanted.contains(&r.id));
        }

        let mut report = SyncReport {
            repositories: repositories.len(),
            ..SyncReport::default()
        };
        let mut last_failure: Option<HandlerError> = None;
        let mut permanent_failures = 0;

        for repository in &repositories {
            match self.sync_repository(repository) {
                Ok((fetched, stored)) => {
                    report.commits_fetched += fetched;
                    report.commits_stored += stored;
                }
                Err(e) => {
                    warn!(
                        job_id = %ctx.job.id,
                        repository = %repository.full_name,
                        error = %e,
                        "repository sync failed; continuing"
                    );
                    report.failed_repositories.push(repository.full_name.clone());
                    if !e.is_retryable() {
                        permanent_failures += 1;
                    }
                    last_failure = Some(e);
                }
            }
            ctx.heartbeat()?;
        }

        info!(
            job_id = %ctx.job.id,
            user_id = %payload.user_id,
            repositories = report.repositories,
            commits_stored = report.commits_stored,
            failed = report.failed_repositories.len(),
            "sync finished"
        );

        match last_failure {
            None => serde_json::to_value(&report).map_err(|e| HandlerError::permanent(e.to_string())),
            // Partial progress is kept; a retry only re-fetches what is missing.
            Some(e) if permanent_failures == repositories.len() => Err(e),
            Some(_) => Err(HandlerError::transient(format!(
                "{} of {} repositories failed to sync: {}",
                report.failed_repositories.len(),
                report.repositories,
                report.failed_repositories.join(", ")
            ))),
        }
    }
}
