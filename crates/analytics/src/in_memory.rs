//! In-memory collaborators for tests/dev.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, RwLock};

use chrono::{DateTime, Utc};

use devpulse_core::{RepositoryId, TimeRange, UserId};

use crate::host::{HostError, RepositoryHost};
use crate::metrics::{
    CommitRecord, RepositoryRef, TeamMetrics, TeamMetricsRecord, UserMetrics, UserMetricsRecord,
};
use crate::store::{DataStore, MetricsStore, RepositoryCatalog, StoreError};

fn poisoned() -> StoreError {
    StoreError::Storage("in-memory store lock poisoned".to_string())
}

#[derive(Debug, Default)]
struct DataInner {
    repositories: BTreeMap<RepositoryId, RepositoryRef>,
    commits: HashMap<(RepositoryId, String), CommitRecord>,
}

/// In-memory repository/commit store.
#[derive(Debug, Default)]
pub struct InMemoryDataStore {
    inner: RwLock<DataInner>,
}

impl InMemoryDataStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn commit_count(&self) -> usize {
        self.inner.read().map(|i| i.commits.len()).unwrap_or(0)
    }
}

impl RepositoryCatalog for InMemoryDataStore {
    fn repository_list(&self) -> Result<Vec<RepositoryRef>, StoreError> {
        let inner = self.inner.read().map_err(|_| poisoned())?;
        Ok(inner.repositories.values().cloned().collect())
    }
}

impl DataStore for InMemoryDataStore {
    fn upsert_repository(&self, repository: &RepositoryRef) -> Result<(), StoreError> {
        let mut inner = self.inner.write().map_err(|_| poisoned())?;
        inner.repositories.insert(repository.id, repository.clone());
        Ok(())
    }

    fn store_commits(&self, commits: &[CommitRecord]) -> Result<usize, StoreError> {
        let mut inner = self.inner.write().map_err(|_| poisoned())?;
        let mut inserted = 0;
        for commit in commits {
            let key = (commit.repository_id, commit.sha.clone());
            if inner.commits.insert(key, commit.clone()).is_none() {
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    fn latest_commit_at(
        &self,
        repository_id: RepositoryId,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        let inner = self.inner.read().map_err(|_| poisoned())?;
        Ok(inner
            .commits
            .values()
            .filter(|c| c.repository_id == repository_id)
            .map(|c| c.authored_at)
            .max())
    }

    fn repository_commits(
        &self,
        repository_id: RepositoryId,
        time_range: TimeRange,
    ) -> Result<Vec<CommitRecord>, StoreError> {
        let inner = self.inner.read().map_err(|_| poisoned())?;
        let mut commits: Vec<_> = inner
            .commits
            .values()
            .filter(|c| c.repository_id == repository_id && time_range.contains(c.authored_at))
            .cloned()
            .collect();
        commits.sort_by_key(|c| c.authored_at);
        Ok(commits)
    }

    fn author_commits(
        &self,
        author_id: UserId,
        repository_id: Option<RepositoryId>,
        time_range: TimeRange,
    ) -> Result<Vec<CommitRecord>, StoreError> {
        let inner = self.inner.read().map_err(|_| poisoned())?;
        let mut commits: Vec<_> = inner
            .commits
            .values()
            .filter(|c| {
                c.author_id == author_id
                    && repository_id.is_none_or(|r| c.repository_id == r)
                    && time_range.contains(c.authored_at)
            })
            .cloned()
            .collect();
        commits.sort_by_key(|c| c.authored_at);
        Ok(commits)
    }
}

#[derive(Debug, Default)]
struct MetricsInner {
    team: BTreeMap<(RepositoryId, DateTime<Utc>), TeamMetricsRecord>,
    user: BTreeMap<(UserId, Option<RepositoryId>, DateTime<Utc>), UserMetricsRecord>,
}

/// In-memory metrics store; keyed maps make every save an upsert.
#[derive(Debug, Default)]
pub struct InMemoryMetricsStore {
    inner: RwLock<MetricsInner>,
}

impl InMemoryMetricsStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MetricsStore for InMemoryMetricsStore {
    fn save_team_metrics(
        &self,
        repository_id: RepositoryId,
        timestamp: DateTime<Utc>,
        metrics: &TeamMetrics,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().map_err(|_| poisoned())?;
        inner.team.insert(
            (repository_id, timestamp),
            TeamMetricsRecord {
                repository_id,
                timestamp,
                metrics: metrics.clone(),
                updated_at: Utc::now(),
            },
        );
        Ok(())
    }

    fn team_metrics(&self, repository_id: RepositoryId) -> Result<Vec<TeamMetricsRecord>, StoreError> {
        let inner = self.inner.read().map_err(|_| poisoned())?;
        Ok(inner
            .team
            .range((repository_id, DateTime::<Utc>::MIN_UTC)..=(repository_id, DateTime::<Utc>::MAX_UTC))
            .map(|(_, record)| record.clone())
            .collect())
    }

    fn save_user_metrics(
        &self,
        user_id: UserId,
        repository_id: Option<RepositoryId>,
        timestamp: DateTime<Utc>,
        metrics: &UserMetrics,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().map_err(|_| poisoned())?;
        inner.user.insert(
            (user_id, repository_id, timestamp),
            UserMetricsRecord {
                user_id,
                repository_id,
                timestamp,
                metrics: metrics.clone(),
                updated_at: Utc::now(),
            },
        );
        Ok(())
    }

    fn user_metrics(&self, user_id: UserId) -> Result<Vec<UserMetricsRecord>, StoreError> {
        let inner = self.inner.read().map_err(|_| poisoned())?;
        let mut records: Vec<_> = inner
            .user
            .values()
            .filter(|r| r.user_id == user_id)
            .cloned()
            .collect();
        records.sort_by_key(|r| r.timestamp);
        Ok(records)
    }
}

/// Repository host serving a fixed set of repositories and commits.
#[derive(Debug, Default)]
pub struct StaticRepositoryHost {
    repositories: RwLock<Vec<RepositoryRef>>,
    commits: RwLock<Vec<CommitRecord>>,
    outages: Mutex<HashMap<RepositoryId, u32>>,
    revoked: Mutex<HashSet<RepositoryId>>,
}

impl StaticRepositoryHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_repository(&self, repository: RepositoryRef) {
        if let Ok(mut repos) = self.repositories.write() {
            repos.push(repository);
        }
    }

    pub fn add_commits(&self, commits: impl IntoIterator<Item = CommitRecord>) {
        if let Ok(mut all) = self.commits.write() {
            all.extend(commits);
        }
    }

    /// Make the next `times` commit fetches for `repository_id` fail.
    pub fn fail_fetches(&self, repository_id: RepositoryId, times: u32) {
        if let Ok(mut outages) = self.outages.lock() {
            outages.insert(repository_id, times);
        }
    }

    /// Make every commit fetch for `repository_id` fail with `AccessDenied`.
    pub fn revoke_access(&self, repository_id: RepositoryId) {
        if let Ok(mut revoked) = self.revoked.lock() {
            revoked.insert(repository_id);
        }
    }
}

impl RepositoryHost for StaticRepositoryHost {
    fn list_repositories(&self, user_id: UserId) -> Result<Vec<RepositoryRef>, HostError> {
        let repos = self
            .repositories
            .read()
            .map_err(|_| HostError::Unavailable("lock poisoned".to_string()))?;
        Ok(repos.iter().filter(|r| r.owner_id == user_id).cloned().collect())
    }

    fn fetch_commits(
        &self,
        repository: &RepositoryRef,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<CommitRecord>, HostError> {
        if self.revoked.lock().is_ok_and(|r| r.contains(&repository.id)) {
            return Err(HostError::AccessDenied(format!("{} revoked", repository.full_name)));
        }
        if let Ok(mut outages) = self.outages.lock() {
            if let Some(remaining) = outages.get_mut(&repository.id) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(HostError::Unavailable(format!(
                        "simulated outage for {}",
                        repository.full_name
                    )));
                }
            }
        }

        let commits = self
            .commits
            .read()
            .map_err(|_| HostError::Unavailable("lock poisoned".to_string()))?;
        Ok(commits
            .iter()
            .filter(|c| c.repository_id == repository.id && since.is_none_or(|s| c.authored_at >= s))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{KnowledgeDistribution, TeamCollaboration, TeamVelocity};
    use chrono::TimeZone;

    fn commit(repo: RepositoryId, sha: &str) -> CommitRecord {
        CommitRecord {
            sha: sha.to_string(),
            repository_id: repo,
            author_id: UserId::new(),
            authored_at: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
            additions: 1,
            deletions: 0,
            files: vec![],
        }
    }

    fn team_metrics(commits: u64) -> TeamMetrics {
        TeamMetrics {
            time_range: TimeRange::last_days(Utc::now(), 30),
            velocity: TeamVelocity {
                commit_count: commits,
                commits_per_day: commits as f64 / 30.0,
                lines_changed: 0,
                contributors: 1,
            },
            collaboration: TeamCollaboration {
                contributors: 1,
                files_touched: 0,
                shared_files: 0,
                collaboration_index: 0.0,
            },
            knowledge: KnowledgeDistribution {
                contributors: vec![],
                bus_factor: 0,
            },
        }
    }

    #[test]
    fn storing_same_commit_twice_counts_once() {
        let store = InMemoryDataStore::new();
        let repo = RepositoryId::new();

        assert_eq!(store.store_commits(&[commit(repo, "a"), commit(repo, "b")]).unwrap(), 2);
        assert_eq!(store.store_commits(&[commit(repo, "b"), commit(repo, "c")]).unwrap(), 1);
        assert_eq!(store.commit_count(), 3);
    }

    #[test]
    fn team_metrics_save_overwrites_same_key() {
        let store = InMemoryMetricsStore::new();
        let repo = RepositoryId::new();
        let ts = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();

        store.save_team_metrics(repo, ts, &team_metrics(1)).unwrap();
        store.save_team_metrics(repo, ts, &team_metrics(7)).unwrap();

        let records = store.team_metrics(repo).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].metrics.velocity.commit_count, 7);
    }

    #[test]
    fn team_metrics_are_scoped_to_repository() {
        let store = InMemoryMetricsStore::new();
        let ts = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        let a = RepositoryId::new();
        let b = RepositoryId::new();

        store.save_team_metrics(a, ts, &team_metrics(1)).unwrap();
        store.save_team_metrics(b, ts, &team_metrics(2)).unwrap();

        assert_eq!(store.team_metrics(a).unwrap().len(), 1);
        assert_eq!(store.team_metrics(b).unwrap()[0].metrics.velocity.commit_count, 2);
    }

    #[test]
    fn static_host_simulates_outages() {
        let host = StaticRepositoryHost::new();
        let owner = UserId::new();
        let repo = RepositoryRef {
            id: RepositoryId::new(),
            owner_id: owner,
            full_name: "acme/api".to_string(),
        };
        host.add_repository(repo.clone());
        host.add_commits([commit(repo.id, "a")]);
        host.fail_fetches(repo.id, 1);

        assert!(host.fetch_commits(&repo, None).is_err());
        assert_eq!(host.fetch_commits(&repo, None).unwrap().len(), 1);
        assert_eq!(host.list_repositories(owner).unwrap().len(), 1);
    }
}
