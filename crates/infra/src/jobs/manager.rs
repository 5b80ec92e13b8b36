//! Queue manager: admission, handler registration, state queries and outcome
//! recording.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, error, warn};

use super::flag::BackgroundJobsFlag;
use super::registry::{HandlerError, HandlerRegistry, JobHandler};
use super::store::{JobStats, JobStore, JobStoreError};
use super::types::{Job, JobId, JobOptions, JobStatus, JobType, RetryPolicy, WorkerId};

/// Admission error returned synchronously from `add_job`.
#[derive(Debug, Clone, thiserror::Error)]
pub enum QueueError {
    #[error("background jobs are disabled")]
    Disabled,
    #[error("no handler registered for job type {0}")]
    InvalidJobType(JobType),
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
    #[error(transparent)]
    Store(#[from] JobStoreError),
}

/// Something that accepts new jobs. The recurring scheduler only needs this.
pub trait JobSubmitter: Send + Sync {
    fn submit(
        &self,
        job_type: JobType,
        payload: serde_json::Value,
        options: JobOptions,
    ) -> Result<Job, QueueError>;
}

impl<T: JobSubmitter + ?Sized> JobSubmitter for Arc<T> {
    fn submit(
        &self,
        job_type: JobType,
        payload: serde_json::Value,
        options: JobOptions,
    ) -> Result<Job, QueueError> {
        (**self).submit(job_type, payload, options)
    }
}

/// Public API of the job pipeline. Owns the retry policy.
pub struct QueueManager<S: JobStore> {
    store: S,
    registry: Arc<HandlerRegistry>,
    flag: Arc<dyn BackgroundJobsFlag>,
    retry: RetryPolicy,
    lease_duration: Duration,
}

impl<S: JobStore> QueueManager<S> {
    pub fn new(store: S, registry: Arc<HandlerRegistry>, flag: Arc<dyn BackgroundJobsFlag>) -> Self {
        Self {
            store,
            registry,
            flag,
            retry: RetryPolicy::default(),
            lease_duration: Duration::from_secs(300),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_lease_duration(mut self, lease_duration: Duration) -> Self {
        self.lease_duration = lease_duration;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn lease_duration(&self) -> Duration {
        self.lease_duration
    }

    pub fn background_jobs_enabled(&self) -> bool {
        self.flag.background_jobs_enabled()
    }

    /// Admit a job. Never executes work synchronously.
    ///
    /// With a caller-supplied id that matches a WAITING, DELAYED or ACTIVE
    /// job, the existing job is returned unchanged.
    pub fn add_job(
        &self,
        job_type: JobType,
        payload: serde_json::Value,
        options: JobOptions,
    ) -> Result<Job, QueueError> {
        if !self.flag.background_jobs_enabled() {
            return Err(QueueError::Disabled);
        }
        if !self.registry.contains(job_type) {
            return Err(QueueError::InvalidJobType(job_type));
        }
        validate_payload(job_type, &payload)?;

        let job = Job::new(
            options.id.unwrap_or_default(),
            job_type,
            payload,
            options.priority.unwrap_or_else(|| job_type.default_priority()),
            options.max_attempts.unwrap_or(self.retry.max_attempts),
            options.delay,
            Utc::now(),
        );

        let enqueued = self.store.enqueue(job)?;
        let job = enqueued.job();
        if enqueued.is_new() {
            debug!(
                job_id = %job.id,
                job_type = %job.job_type,
                priority = job.priority.as_str(),
                status = %job.status,
                "job admitted"
            );
        } else {
            debug!(job_id = %job.id, status = %job.status, "job already pending; admission skipped");
        }
        Ok(enqueued.into_job())
    }

    /// Register the handler for `job_type`; the last registration wins.
    pub fn register_worker(&self, job_type: JobType, handler: Arc<dyn JobHandler>) {
        if self.registry.register(job_type, handler) {
            warn!(job_type = %job_type, "handler replaced");
        }
    }

    pub fn get_job_state(&self, job_id: &JobId) -> Result<Option<JobStatus>, QueueError> {
        Ok(self.store.get(job_id)?.map(|job| job.status))
    }

    pub fn get_job(&self, job_id: &JobId) -> Result<Option<Job>, QueueError> {
        Ok(self.store.get(job_id)?)
    }

    pub fn list(&self, status: Option<JobStatus>, limit: usize) -> Result<Vec<Job>, QueueError> {
        Ok(self.store.list(status, limit)?)
    }

    pub fn stats(&self) -> Result<JobStats, QueueError> {
        Ok(self.store.stats()?)
    }

    pub(crate) fn claim_next(&self, worker: &WorkerId) -> Result<Option<Job>, JobStoreError> {
        let job = self.store.claim_next(worker, self.lease_duration, Utc::now())?;
        if let Some(job) = &job {
            debug!(
                job_id = %job.id,
                job_type = %job.job_type,
                worker = %worker,
                attempt = job.attempts,
                "job claimed"
            );
        }
        Ok(job)
    }

    pub(crate) fn mark_completed(
        &self,
        mut job: Job,
        worker: &WorkerId,
        result: serde_json::Value,
    ) -> Result<Job, JobStoreError> {
        job.complete(result, Utc::now());
        self.store.finish(&job, worker)?;
        debug!(job_id = %job.id, worker = %worker, attempt = job.attempts, "job completed");
        Ok(job)
    }

    pub(crate) fn mark_failed(
        &self,
        mut job: Job,
        worker: &WorkerId,
        failure: &HandlerError,
    ) -> Result<Job, JobStoreError> {
        self.fail_at(&mut job, failure, Utc::now());
        self.store.finish(&job, worker)?;
        Ok(job)
    }

    fn fail_at(&self, job: &mut Job, failure: &HandlerError, now: DateTime<Utc>) {
        job.fail(failure.to_string(), failure.is_retryable(), &self.retry, now);
        log_failure(job, failure);
    }

    /// Fail every ACTIVE job whose lease expired; returns how many were reaped.
    ///
    /// The expiry is re-checked atomically by the store, so a heartbeat that
    /// lands after the scan keeps the job with its worker.
    pub(crate) fn reap_expired_leases(&self, now: DateTime<Utc>) -> Result<usize, JobStoreError> {
        let mut reaped = 0;
        for job in self.store.expired_leases(now)? {
            let Some(holder) = job.lease_holder().cloned() else {
                continue;
            };
            let failure = HandlerError::transient("lease expired");
            let mut released = job.clone();
            released.fail(failure.to_string(), true, &self.retry, now);
            match self.store.release_expired(&released, &holder, now) {
                Ok(()) => {
                    warn!(job_id = %job.id, worker = %holder, attempt = job.attempts, "lease expired");
                    log_failure(&released, &failure);
                    reaped += 1;
                }
                // Finished or renewed by its worker in the meantime.
                Err(JobStoreError::LeaseLost(_)) => {
                    debug!(job_id = %job.id, worker = %holder, "lease renewed before reaping");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(reaped)
    }
}

fn log_failure(job: &Job, failure: &HandlerError) {
    match job.status {
        JobStatus::Delayed => warn!(
            job_id = %job.id,
            job_type = %job.job_type,
            attempt = job.attempts,
            max_attempts = job.max_attempts,
            next_retry_at = ?job.next_retry_at,
            error = %failure,
            "job failed; retry scheduled"
        ),
        _ => error!(
            job_id = %job.id,
            job_type = %job.job_type,
            attempt = job.attempts,
            retryable = failure.is_retryable(),
            error = %failure,
            "job failed permanently"
        ),
    }
}

impl<S: JobStore> JobSubmitter for QueueManager<S> {
    fn submit(
        &self,
        job_type: JobType,
        payload: serde_json::Value,
        options: JobOptions,
    ) -> Result<Job, QueueError> {
        self.add_job(job_type, payload, options)
    }
}

fn validate_payload(job_type: JobType, payload: &serde_json::Value) -> Result<(), QueueError> {
    let object = payload
        .as_object()
        .ok_or_else(|| QueueError::InvalidPayload("payload must be a JSON object".to_string()))?;

    for field in job_type.required_fields() {
        if object.get(*field).is_none_or(|v| v.is_null()) {
            return Err(QueueError::InvalidPayload(format!(
                "{job_type} payload requires `{field}`"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::flag::StaticFlag;
    use crate::jobs::registry::{JobContext, handler_fn};
    use crate::jobs::store::InMemoryJobStore;
    use crate::jobs::types::JobPriority;
    use serde_json::json;

    fn manager(enabled: bool) -> QueueManager<Arc<InMemoryJobStore>> {
        let registry = Arc::new(HandlerRegistry::new());
        for job_type in JobType::ALL {
            registry.register(
                job_type,
                handler_fn(|_ctx: &JobContext<'_>| Ok(serde_json::Value::Null)),
            );
        }
        QueueManager::new(InMemoryJobStore::arc(), registry, Arc::new(StaticFlag::new(enabled)))
    }

    #[test]
    fn admission_fails_when_disabled() {
        let queue = manager(false);
        let err = queue
            .add_job(JobType::TeamMetrics, json!({"repositoryId": "r"}), JobOptions::new())
            .unwrap_err();

        assert!(matches!(err, QueueError::Disabled));
        assert_eq!(queue.stats().unwrap().total(), 0);
    }

    #[test]
    fn unregistered_type_is_rejected_at_admission() {
        let queue = QueueManager::new(
            InMemoryJobStore::arc(),
            Arc::new(HandlerRegistry::new()),
            Arc::new(StaticFlag::default()),
        );
        let err = queue
            .add_job(JobType::InitialSync, json!({"userId": "u"}), JobOptions::new())
            .unwrap_err();

        assert!(matches!(err, QueueError::InvalidJobType(JobType::InitialSync)));
    }

    #[test]
    fn payload_must_carry_required_fields() {
        let queue = manager(true);

        assert!(matches!(
            queue.add_job(JobType::TeamMetrics, json!(["nope"]), JobOptions::new()),
            Err(QueueError::InvalidPayload(_))
        ));
        assert!(matches!(
            queue.add_job(JobType::MetricsCalculation, json!({"repositoryId": "r"}), JobOptions::new()),
            Err(QueueError::InvalidPayload(_))
        ));
    }

    #[test]
    fn default_priority_follows_job_type() {
        let queue = manager(true);

        let sync = queue
            .add_job(JobType::InitialSync, json!({"userId": "u"}), JobOptions::new())
            .unwrap();
        let team = queue
            .add_job(JobType::TeamMetrics, json!({"repositoryId": "r"}), JobOptions::new())
            .unwrap();
        let low = queue
            .add_job(
                JobType::TeamMetrics,
                json!({"repositoryId": "r"}),
                JobOptions::new().priority(JobPriority::Low),
            )
            .unwrap();

        assert_eq!(sync.priority, JobPriority::High);
        assert_eq!(team.priority, JobPriority::Medium);
        assert_eq!(low.priority, JobPriority::Low);
        assert_eq!(queue.get_job_state(&sync.id).unwrap(), Some(JobStatus::Waiting));
        assert_eq!(team.max_attempts, 3);
    }

    #[test]
    fn delayed_admission() {
        let queue = manager(true);
        let job = queue
            .add_job(
                JobType::TeamMetrics,
                json!({"repositoryId": "r"}),
                JobOptions::new().delay(Duration::from_secs(60)),
            )
            .unwrap();

        assert_eq!(job.status, JobStatus::Delayed);
        assert!(queue.claim_next(&WorkerId::new("w")).unwrap().is_none());
    }

    #[test]
    fn resubmitting_pending_id_is_a_no_op() {
        let queue = manager(true);
        let id = JobId::for_target(JobType::TeamMetrics, "r:2024-05-01");

        let first = queue
            .add_job(JobType::TeamMetrics, json!({"repositoryId": "r"}), JobOptions::new().id(id.clone()))
            .unwrap();
        let second = queue
            .add_job(
                JobType::TeamMetrics,
                json!({"repositoryId": "r", "extra": true}),
                JobOptions::new().id(id.clone()),
            )
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(queue.stats().unwrap().waiting, 1);
    }

    #[test]
    fn unknown_job_state_is_none() {
        let queue = manager(true);
        assert_eq!(queue.get_job_state(&JobId::new()).unwrap(), None);
    }

    #[test]
    fn expired_lease_is_released_for_retry() {
        let queue = manager(true).with_retry_policy(RetryPolicy::fixed(3, Duration::ZERO));
        let job = queue
            .add_job(JobType::TeamMetrics, json!({"repositoryId": "r"}), JobOptions::new())
            .unwrap();
        let worker = WorkerId::new("w1");
        let claimed = queue.claim_next(&worker).unwrap().unwrap();

        let later = Utc::now() + chrono::Duration::seconds(301);
        assert_eq!(queue.reap_expired_leases(later).unwrap(), 1);

        let stored = queue.get_job(&job.id).unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Delayed);
        assert_eq!(stored.last_error.as_deref(), Some("lease expired"));

        // The original worker's late outcome is discarded.
        assert!(matches!(
            queue.mark_completed(claimed, &worker, serde_json::Value::Null),
            Err(JobStoreError::LeaseLost(_))
        ));
    }

    #[test]
    fn renewed_lease_survives_reaping() {
        let queue = manager(true);
        let job = queue
            .add_job(JobType::TeamMetrics, json!({"repositoryId": "r"}), JobOptions::new())
            .unwrap();
        let worker = WorkerId::new("w1");
        let claimed = queue.claim_next(&worker).unwrap().unwrap();

        let renewed_at = Utc::now() + chrono::Duration::seconds(250);
        queue
            .store()
            .extend_lease(&claimed.id, &worker, queue.lease_duration(), renewed_at)
            .unwrap();

        let later = Utc::now() + chrono::Duration::seconds(301);
        assert_eq!(queue.reap_expired_leases(later).unwrap(), 0);
        assert_eq!(queue.get_job_state(&job.id).unwrap(), Some(JobStatus::Active));
        assert!(queue.mark_completed(claimed, &worker, serde_json::Value::Null).is_ok());
    }
}
