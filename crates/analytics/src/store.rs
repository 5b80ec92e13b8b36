//! Store contracts consumed by the job handlers and the recurring scheduler.

use chrono::{DateTime, Utc};
use thiserror::Error;

use devpulse_core::{RepositoryId, TimeRange, UserId};

use crate::metrics::{
    CommitRecord, RepositoryRef, TeamMetrics, TeamMetricsRecord, UserMetrics, UserMetricsRecord,
};

#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("record not found: {0}")]
    NotFound(String),

    #[error("malformed record: {0}")]
    Malformed(String),

    #[error("storage error: {0}")]
    Storage(String),
}

/// Enumerates the repositories the recurring scheduler fans out over.
pub trait RepositoryCatalog: Send + Sync + 'static {
    fn repository_list(&self) -> Result<Vec<RepositoryRef>, StoreError>;
}

/// Relational data store for repositories and commits.
pub trait DataStore: RepositoryCatalog {
    /// Insert or update a repository row.
    fn upsert_repository(&self, repository: &RepositoryRef) -> Result<(), StoreError>;

    /// Store commits keyed by `(repository_id, sha)`; returns how many were new.
    fn store_commits(&self, commits: &[CommitRecord]) -> Result<usize, StoreError>;

    /// Authored time of the newest stored commit, if any.
    fn latest_commit_at(
        &self,
        repository_id: RepositoryId,
    ) -> Result<Option<DateTime<Utc>>, StoreError>;

    fn repository_commits(
        &self,
        repository_id: RepositoryId,
        time_range: TimeRange,
    ) -> Result<Vec<CommitRecord>, StoreError>;

    /// Commits by `author_id`, optionally restricted to one repository.
    fn author_commits(
        &self,
        author_id: UserId,
        repository_id: Option<RepositoryId>,
        time_range: TimeRange,
    ) -> Result<Vec<CommitRecord>, StoreError>;
}

/// Persistence for computed metrics.
///
/// Saves are upserts: writing the same key twice leaves one record holding
/// the latest values.
pub trait MetricsStore: Send + Sync + 'static {
    fn save_team_metrics(
        &self,
        repository_id: RepositoryId,
        timestamp: DateTime<Utc>,
        metrics: &TeamMetrics,
    ) -> Result<(), StoreError>;

    /// Snapshots for one repository, oldest first.
    fn team_metrics(&self, repository_id: RepositoryId) -> Result<Vec<TeamMetricsRecord>, StoreError>;

    fn save_user_metrics(
        &self,
        user_id: UserId,
        repository_id: Option<RepositoryId>,
        timestamp: DateTime<Utc>,
        metrics: &UserMetrics,
    ) -> Result<(), StoreError>;

    fn user_metrics(&self, user_id: UserId) -> Result<Vec<UserMetricsRecord>, StoreError>;
}
