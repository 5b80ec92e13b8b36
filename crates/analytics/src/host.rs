use chrono::{DateTime, Utc};
use thiserror::Error;

use devpulse_core::UserId;

use crate::metrics::{CommitRecord, RepositoryRef};

#[derive(Debug, Clone, Error)]
pub enum HostError {
    #[error("repository host unavailable: {0}")]
    Unavailable(String),

    #[error("rate limited by repository host")]
    RateLimited,

    #[error("access denied: {0}")]
    AccessDenied(String),
}

/// The remote VCS host the sync handlers pull from.
pub trait RepositoryHost: Send + Sync + 'static {
    fn list_repositories(&self, user_id: UserId) -> Result<Vec<RepositoryRef>, HostError>;

    /// Commits authored at or after `since` (full history when `None`).
    fn fetch_commits(
        &self,
        repository: &RepositoryRef,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<CommitRecord>, HostError>;
}
