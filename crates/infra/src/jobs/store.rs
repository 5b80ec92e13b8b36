//! Job storage implementations.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::types::{Job, JobId, JobStatus, WorkerId, instant_after};

/// Outcome of [`JobStore::enqueue`].
#[derive(Debug, Clone, PartialEq)]
pub enum Enqueued {
    /// The job was stored (possibly replacing a finished job with the same id).
    New(Job),
    /// A non-terminal job with the same id already exists; nothing was written.
    Existing(Job),
}

impl Enqueued {
    pub fn job(&self) -> &Job {
        match self {
            Enqueued::New(job) | Enqueued::Existing(job) => job,
        }
    }

    pub fn into_job(self) -> Job {
        match self {
            Enqueued::New(job) | Enqueued::Existing(job) => job,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, Enqueued::New(_))
    }
}

/// Job store abstraction.
///
/// `claim_next` is the only operation that must be mutually exclusive across
/// workers; implementations make it atomic.
pub trait JobStore: Send + Sync {
    /// Store a new job, assigning its enqueue sequence.
    fn enqueue(&self, job: Job) -> Result<Enqueued, JobStoreError>;

    /// Get a job by ID.
    fn get(&self, job_id: &JobId) -> Result<Option<Job>, JobStoreError>;

    /// Claim the highest-priority, earliest ready job for `worker`.
    /// Returns None if no jobs are available.
    fn claim_next(
        &self,
        worker: &WorkerId,
        lease_duration: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, JobStoreError>;

    /// Write back the outcome of an attempt.
    ///
    /// Rejected with `LeaseLost` unless the stored job is still ACTIVE under
    /// `worker`.
    fn finish(&self, job: &Job, worker: &WorkerId) -> Result<(), JobStoreError>;

    /// Write back the outcome of a reaped attempt.
    ///
    /// Like `finish`, but the stored lease must also still be expired at
    /// `now`; a lease renewed since `expired_leases` was read yields
    /// `LeaseLost`.
    fn release_expired(&self, job: &Job, worker: &WorkerId, now: DateTime<Utc>) -> Result<(), JobStoreError>;

    /// Push the lease deadline of an ACTIVE job held by `worker`.
    fn extend_lease(
        &self,
        job_id: &JobId,
        worker: &WorkerId,
        lease_duration: Duration,
        now: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, JobStoreError>;

    /// ACTIVE jobs whose lease expired before `now`.
    fn expired_leases(&self, now: DateTime<Utc>) -> Result<Vec<Job>, JobStoreError>;

    /// List jobs, oldest first.
    fn list(&self, status: Option<JobStatus>, limit: usize) -> Result<Vec<Job>, JobStoreError>;

    /// Get job statistics.
    fn stats(&self) -> Result<JobStats, JobStoreError>;
}

/// Job store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("lease on job {0} is no longer held by this worker")]
    LeaseLost(JobId),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Job counts per status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobStats {
    pub waiting: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
    pub delayed: usize,
}

impl JobStats {
    pub fn record(&mut self, status: JobStatus) {
        match status {
            JobStatus::Waiting => self.waiting += 1,
            JobStatus::Active => self.active += 1,
            JobStatus::Completed => self.completed += 1,
            JobStatus::Failed => self.failed += 1,
            JobStatus::Delayed => self.delayed += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.waiting + self.active + self.completed + self.failed + self.delayed
    }
}

#[derive(Debug, Default)]
struct Inner {
    jobs: HashMap<JobId, Job>,
    next_sequence: u64,
}

/// In-memory job store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    inner: RwLock<Inner>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn held_by(job: &Job, worker: &WorkerId) -> bool {
    job.status == JobStatus::Active && job.lease_holder() == Some(worker)
}

impl JobStore for InMemoryJobStore {
    fn enqueue(&self, mut job: Job) -> Result<Enqueued, JobStoreError> {
        let mut inner = self.write();
        if let Some(existing) = inner.jobs.get(&job.id) {
            if !existing.status.is_terminal() {
                return Ok(Enqueued::Existing(existing.clone()));
            }
        }

        inner.next_sequence += 1;
        job.sequence = inner.next_sequence;
        inner.jobs.insert(job.id.clone(), job.clone());
        Ok(Enqueued::New(job))
    }

    fn get(&self, job_id: &JobId) -> Result<Option<Job>, JobStoreError> {
        Ok(self.read().jobs.get(job_id).cloned())
    }

    fn claim_next(
        &self,
        worker: &WorkerId,
        lease_duration: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, JobStoreError> {
        let mut inner = self.write();

        let next = inner
            .jobs
            .values()
            .filter(|j| j.is_claimable(now))
            .min_by_key(|j| j.claim_order())
            .map(|j| j.id.clone());

        let Some(job_id) = next else {
            return Ok(None);
        };
        let job = inner
            .jobs
            .get_mut(&job_id)
            .ok_or_else(|| JobStoreError::NotFound(job_id.clone()))?;
        job.claim(worker.clone(), lease_duration, now);
        Ok(Some(job.clone()))
    }

    fn finish(&self, job: &Job, worker: &WorkerId) -> Result<(), JobStoreError> {
        let mut inner = self.write();
        let stored = inner
            .jobs
            .get_mut(&job.id)
            .ok_or_else(|| JobStoreError::NotFound(job.id.clone()))?;

        if !held_by(stored, worker) || stored.attempts != job.attempts {
            return Err(JobStoreError::LeaseLost(job.id.clone()));
        }
        *stored = job.clone();
        Ok(())
    }

    fn release_expired(&self, job: &Job, worker: &WorkerId, now: DateTime<Utc>) -> Result<(), JobStoreError> {
        let mut inner = self.write();
        let stored = inner
            .jobs
            .get_mut(&job.id)
            .ok_or_else(|| JobStoreError::NotFound(job.id.clone()))?;

        let expired = stored.lease.as_ref().is_some_and(|l| l.expires_at < now);
        if !held_by(stored, worker) || stored.attempts != job.attempts || !expired {
            return Err(JobStoreError::LeaseLost(job.id.clone()));
        }
        *stored = job.clone();
        Ok(())
    }

    fn extend_lease(
        &self,
        job_id: &JobId,
        worker: &WorkerId,
        lease_duration: Duration,
        now: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, JobStoreError> {
        let mut inner = self.write();
        let stored = inner
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| JobStoreError::NotFound(job_id.clone()))?;

        if !held_by(stored, worker) {
            return Err(JobStoreError::LeaseLost(job_id.clone()));
        }
        let expires_at = instant_after(now, lease_duration);
        if let Some(lease) = stored.lease.as_mut() {
            lease.expires_at = expires_at;
        }
        Ok(expires_at)
    }

    fn expired_leases(&self, now: DateTime<Utc>) -> Result<Vec<Job>, JobStoreError> {
        let inner = self.read();
        let mut expired: Vec<_> = inner
            .jobs
            .values()
            .filter(|j| {
                j.status == JobStatus::Active
                    && j.lease.as_ref().is_some_and(|l| l.expires_at < now)
            })
            .cloned()
            .collect();
        expired.sort_by_key(|j| j.sequence);
        Ok(expired)
    }

    fn list(&self, status: Option<JobStatus>, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        let inner = self.read();
        let mut result: Vec<_> = inner
            .jobs
            .values()
            .filter(|j| status.is_none_or(|s| j.status == s))
            .cloned()
            .collect();

        result.sort_by_key(|j| (j.created_at, j.sequence));
        result.truncate(limit);
        Ok(result)
    }

    fn stats(&self) -> Result<JobStats, JobStoreError> {
        let inner = self.read();
        let mut stats = JobStats::default();
        for job in inner.jobs.values() {
            stats.record(job.status);
        }
        Ok(stats)
    }
}

impl<S: JobStore + ?Sized> JobStore for Arc<S> {
    fn enqueue(&self, job: Job) -> Result<Enqueued, JobStoreError> {
        (**self).enqueue(job)
    }

    fn get(&self, job_id: &JobId) -> Result<Option<Job>, JobStoreError> {
        (**self).get(job_id)
    }

    fn claim_next(
        &self,
        worker: &WorkerId,
        lease_duration: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, JobStoreError> {
        (**self).claim_next(worker, lease_duration, now)
    }

    fn finish(&self, job: &Job, worker: &WorkerId) -> Result<(), JobStoreError> {
        (**self).finish(job, worker)
    }

    fn release_expired(&self, job: &Job, worker: &WorkerId, now: DateTime<Utc>) -> Result<(), JobStoreError> {
        (**self).release_expired(job, worker, now)
    }

    fn extend_lease(
        &self,
        job_id: &JobId,
        worker: &WorkerId,
        lease_duration: Duration,
        now: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, JobStoreError> {
        (**self).extend_lease(job_id, worker, lease_duration, now)
    }

    fn expired_leases(&self, now: DateTime<Utc>) -> Result<Vec<Job>, JobStoreError> {
        (**self).expired_leases(now)
    }

    fn list(&self, status: Option<JobStatus>, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        (**self).list(status, limit)
    }

    fn stats(&self) -> Result<JobStats, JobStoreError> {
        (**self).stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::types::{JobPriority, JobType, RetryPolicy};
    use proptest::prelude::*;

    const LEASE: Duration = Duration::from_secs(30);

    fn job(priority: JobPriority, now: DateTime<Utc>) -> Job {
        Job::new(
            JobId::new(),
            JobType::TeamMetrics,
            serde_json::json!({"repositoryId": "r"}),
            priority,
            3,
            None,
            now,
        )
    }

    fn worker(name: &str) -> WorkerId {
        WorkerId::new(name)
    }

    #[test]
    fn enqueue_and_claim() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();

        let enqueued = store.enqueue(job(JobPriority::Medium, now)).unwrap();
        assert!(enqueued.is_new());

        let claimed = store.claim_next(&worker("w1"), LEASE, now).unwrap().unwrap();
        assert_eq!(claimed.id, enqueued.job().id);
        assert_eq!(claimed.status, JobStatus::Active);
        assert_eq!(claimed.attempts, 1);

        // No more jobs
        assert!(store.claim_next(&worker("w2"), LEASE, now).unwrap().is_none());
    }

    #[test]
    fn higher_priority_is_claimed_first() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();

        let low = store.enqueue(job(JobPriority::Low, now)).unwrap().into_job();
        let high = store.enqueue(job(JobPriority::High, now)).unwrap().into_job();
        let medium = store.enqueue(job(JobPriority::Medium, now)).unwrap().into_job();

        let w = worker("w1");
        let order: Vec<_> = (0..3)
            .map(|_| store.claim_next(&w, LEASE, now).unwrap().unwrap().id)
            .collect();
        assert_eq!(order, vec![high.id, medium.id, low.id]);
    }

    #[test]
    fn duplicate_id_returns_pending_job_unchanged() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        let id = JobId::for_target(JobType::TeamMetrics, "repo-1");

        let mut first = job(JobPriority::Medium, now);
        first.id = id.clone();
        store.enqueue(first).unwrap();

        let mut second = job(JobPriority::High, now);
        second.id = id.clone();
        let outcome = store.enqueue(second).unwrap();

        assert!(!outcome.is_new());
        assert_eq!(outcome.job().priority, JobPriority::Medium);
        assert_eq!(store.stats().unwrap().total(), 1);
    }

    #[test]
    fn finished_id_can_be_reused() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        let id = JobId::for_target(JobType::TeamMetrics, "repo-1");
        let w = worker("w1");

        let mut first = job(JobPriority::Medium, now);
        first.id = id.clone();
        store.enqueue(first).unwrap();
        let mut claimed = store.claim_next(&w, LEASE, now).unwrap().unwrap();
        claimed.complete(serde_json::json!(null), now);
        store.finish(&claimed, &w).unwrap();

        let mut again = job(JobPriority::Medium, now);
        again.id = id.clone();
        let outcome = store.enqueue(again).unwrap();

        assert!(outcome.is_new());
        assert_eq!(store.get(&id).unwrap().unwrap().status, JobStatus::Waiting);
    }

    #[test]
    fn delayed_job_waits_until_due() {
        let store = InMemoryJobStore::new();
        let w = worker("w1");
        let t0 = Utc::now();

        store.enqueue(job(JobPriority::High, t0)).unwrap();
        let mut claimed = store.claim_next(&w, LEASE, t0).unwrap().unwrap();
        let policy = RetryPolicy::fixed(3, Duration::from_secs(10));
        claimed.fail("boom", true, &policy, t0);
        store.finish(&claimed, &w).unwrap();

        assert!(store.claim_next(&w, LEASE, t0 + chrono::Duration::seconds(5)).unwrap().is_none());
        let retried = store
            .claim_next(&w, LEASE, t0 + chrono::Duration::seconds(10))
            .unwrap()
            .unwrap();
        assert_eq!(retried.attempts, 2);
    }

    #[test]
    fn stale_worker_cannot_finish() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        store.enqueue(job(JobPriority::Medium, now)).unwrap();

        let first = worker("w1");
        let mut claimed = store.claim_next(&first, LEASE, now).unwrap().unwrap();

        // Lease expires and the job is retried by someone else.
        let mut expired = store.expired_leases(now + chrono::Duration::seconds(31)).unwrap();
        assert_eq!(expired.len(), 1);
        let mut reaped = expired.remove(0);
        reaped.fail("lease expired", true, &RetryPolicy::fixed(3, Duration::ZERO), now);
        store
            .release_expired(&reaped, &first, now + chrono::Duration::seconds(31))
            .unwrap();
        let second = worker("w2");
        store.claim_next(&second, LEASE, now).unwrap().unwrap();

        claimed.complete(serde_json::json!(null), now);
        assert!(matches!(
            store.finish(&claimed, &first),
            Err(JobStoreError::LeaseLost(_))
        ));
        assert!(matches!(
            store.extend_lease(&claimed.id, &first, LEASE, now),
            Err(JobStoreError::LeaseLost(_))
        ));
    }

    #[test]
    fn heartbeat_after_expiry_scan_keeps_the_lease() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        store.enqueue(job(JobPriority::Medium, now)).unwrap();
        let w1 = worker("w1");
        let claimed = store.claim_next(&w1, LEASE, now).unwrap().unwrap();

        let scan_at = now + chrono::Duration::seconds(31);
        let mut expired = store.expired_leases(scan_at).unwrap();
        assert_eq!(expired.len(), 1);

        // The worker renews before the reaper writes its verdict back.
        store.extend_lease(&claimed.id, &w1, LEASE, scan_at).unwrap();

        let mut reaped = expired.remove(0);
        reaped.fail("lease expired", true, &RetryPolicy::fixed(3, Duration::ZERO), scan_at);
        assert!(matches!(
            store.release_expired(&reaped, &w1, scan_at),
            Err(JobStoreError::LeaseLost(_))
        ));

        let stored = store.get(&claimed.id).unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Active);
        assert_eq!(stored.attempts, 1);
        assert!(store.claim_next(&worker("w2"), LEASE, scan_at).unwrap().is_none());
    }

    #[test]
    fn heartbeat_extends_lease() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        store.enqueue(job(JobPriority::Medium, now)).unwrap();
        let w = worker("w1");
        let claimed = store.claim_next(&w, LEASE, now).unwrap().unwrap();

        let later = now + chrono::Duration::seconds(25);
        let expires_at = store.extend_lease(&claimed.id, &w, LEASE, later).unwrap();

        assert_eq!(expires_at, later + chrono::Duration::seconds(30));
        assert!(store.expired_leases(now + chrono::Duration::seconds(40)).unwrap().is_empty());
    }

    #[test]
    fn stats_tracking() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();

        for _ in 0..5 {
            store.enqueue(job(JobPriority::Medium, now)).unwrap();
        }

        let stats = store.stats().unwrap();
        assert_eq!(stats.waiting, 5);

        let w = worker("w1");
        store.claim_next(&w, LEASE, now).unwrap();
        store.claim_next(&w, LEASE, now).unwrap();

        let stats = store.stats().unwrap();
        assert_eq!(stats.waiting, 3);
        assert_eq!(stats.active, 2);
        assert_eq!(store.list(Some(JobStatus::Active), 10).unwrap().len(), 2);
        assert_eq!(store.list(None, 4).unwrap().len(), 4);
    }

    fn priority_strategy() -> impl Strategy<Value = JobPriority> {
        prop_oneof![
            Just(JobPriority::High),
            Just(JobPriority::Medium),
            Just(JobPriority::Low),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig { cases: 128, ..ProptestConfig::default() })]

        /// Claims come out sorted by priority rank, FIFO within a rank.
        #[test]
        fn claim_order_is_priority_then_fifo(priorities in prop::collection::vec(priority_strategy(), 1..40)) {
            let store = InMemoryJobStore::new();
            let now = Utc::now();
            let w = WorkerId::new("w");

            for p in &priorities {
                store.enqueue(job(*p, now)).unwrap();
            }

            let mut claimed = Vec::new();
            while let Some(job) = store.claim_next(&w, LEASE, now).unwrap() {
                claimed.push((job.priority.rank(), job.sequence));
            }

            prop_assert_eq!(claimed.len(), priorities.len());
            let mut sorted = claimed.clone();
            sorted.sort();
            prop_assert_eq!(claimed, sorted);
        }
    }
}
