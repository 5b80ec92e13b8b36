//! Fixed-size worker pool plus lease reaper.

use std::any::Any;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{debug, error, info, warn};

use super::manager::QueueManager;
use super::registry::{HandlerError, JobContext};
use super::store::{JobStore, JobStoreError};
use super::types::{Job, JobStatus, WorkerId};

/// Worker pool configuration.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Name for logging and thread names
    pub name: String,
    /// Number of concurrent execution slots
    pub workers: usize,
    /// How long an idle slot sleeps before polling again
    pub poll_interval: Duration,
    /// How often the reaper looks for expired leases
    pub reap_interval: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            name: "job-worker".to_string(),
            workers: 4,
            poll_interval: Duration::from_millis(100),
            reap_interval: Duration::from_secs(1),
        }
    }
}

impl WorkerPoolConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_reap_interval(mut self, reap_interval: Duration) -> Self {
        self.reap_interval = reap_interval;
        self
    }
}

/// Pool runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct PoolStats {
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_retried: u64,
    pub jobs_failed: u64,
    /// Outcomes rejected because the lease had already been lost
    pub outcomes_discarded: u64,
    pub leases_reaped: u64,
    pub current_running: usize,
    pub uptime_secs: u64,
}

type SharedStats = Arc<Mutex<PoolStats>>;

fn lock(stats: &Mutex<PoolStats>) -> MutexGuard<'_, PoolStats> {
    stats.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Handle to control a running pool.
#[derive(Debug)]
pub struct WorkerPoolHandle {
    shutdown: Arc<AtomicBool>,
    joins: Vec<thread::JoinHandle<()>>,
    stats: SharedStats,
    started: Instant,
}

impl WorkerPoolHandle {
    /// Request graceful shutdown; in-flight jobs finish first.
    pub fn shutdown(mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        for join in self.joins.drain(..) {
            let _ = join.join();
        }
    }

    /// Get current pool statistics.
    pub fn stats(&self) -> PoolStats {
        let mut stats = lock(&self.stats).clone();
        stats.uptime_secs = self.started.elapsed().as_secs();
        stats
    }
}

/// Claims ready jobs and runs them through the registered handlers.
pub struct WorkerPool;

impl WorkerPool {
    /// Spawn `config.workers` slots and one lease reaper.
    pub fn spawn<S>(queue: Arc<QueueManager<S>>, config: WorkerPoolConfig) -> io::Result<WorkerPoolHandle>
    where
        S: JobStore + 'static,
    {
        let shutdown = Arc::new(AtomicBool::new(false));
        let stats: SharedStats = Arc::new(Mutex::new(PoolStats::default()));
        let mut joins = Vec::with_capacity(config.workers + 1);

        for slot in 0..config.workers.max(1) {
            let worker = WorkerId::for_slot(&config.name, slot);
            let queue = queue.clone();
            let slot_shutdown = shutdown.clone();
            let stats = stats.clone();
            let poll_interval = config.poll_interval;
            let spawned = thread::Builder::new()
                .name(format!("{}-{slot}", config.name))
                .spawn(move || worker_loop(&queue, &worker, poll_interval, &slot_shutdown, &stats));
            match spawned {
                Ok(join) => joins.push(join),
                Err(e) => {
                    shutdown.store(true, Ordering::SeqCst);
                    for join in joins {
                        let _ = join.join();
                    }
                    return Err(e);
                }
            }
        }

        let reaper = {
            let queue = queue.clone();
            let reaper_shutdown = shutdown.clone();
            let stats = stats.clone();
            let interval = config.reap_interval;
            thread::Builder::new()
                .name(format!("{}-reaper", config.name))
                .spawn(move || reaper_loop(&queue, interval, &reaper_shutdown, &stats))
        };
        match reaper {
            Ok(join) => joins.push(join),
            Err(e) => {
                shutdown.store(true, Ordering::SeqCst);
                for join in joins {
                    let _ = join.join();
                }
                return Err(e);
            }
        }

        info!(pool = %config.name, workers = config.workers.max(1), "worker pool started");
        Ok(WorkerPoolHandle {
            shutdown,
            joins,
            stats,
            started: Instant::now(),
        })
    }

    /// Claim and execute at most one job as `worker`.
    ///
    /// Returns the job as it was recorded, or `None` when nothing was ready.
    pub fn run_next<S: JobStore>(
        queue: &QueueManager<S>,
        worker: &WorkerId,
    ) -> Result<Option<Job>, JobStoreError> {
        let stats = Mutex::new(PoolStats::default());
        run_next(queue, worker, &stats)
    }

    /// Run jobs as `worker` until none is ready; returns how many ran.
    pub fn drain<S: JobStore>(queue: &QueueManager<S>, worker: &WorkerId) -> Result<usize, JobStoreError> {
        let mut ran = 0;
        while Self::run_next(queue, worker)?.is_some() {
            ran += 1;
        }
        Ok(ran)
    }
}

fn worker_loop<S: JobStore>(
    queue: &QueueManager<S>,
    worker: &WorkerId,
    poll_interval: Duration,
    shutdown: &AtomicBool,
    stats: &Mutex<PoolStats>,
) {
    debug!(worker = %worker, "worker slot started");

    while !shutdown.load(Ordering::SeqCst) {
        match run_next(queue, worker, stats) {
            Ok(Some(_)) => {}
            Ok(None) => thread::sleep(poll_interval),
            Err(e) => {
                error!(worker = %worker, error = %e, "failed to claim job");
                thread::sleep(poll_interval);
            }
        }
    }

    debug!(worker = %worker, "worker slot stopped");
}

fn reaper_loop<S: JobStore>(
    queue: &QueueManager<S>,
    interval: Duration,
    shutdown: &AtomicBool,
    stats: &Mutex<PoolStats>,
) {
    let mut next_run = Instant::now() + interval;

    while !shutdown.load(Ordering::SeqCst) {
        if Instant::now() < next_run {
            thread::sleep(
                next_run
                    .saturating_duration_since(Instant::now())
                    .min(Duration::from_millis(50)),
            );
            continue;
        }
        next_run = Instant::now() + interval;

        match queue.reap_expired_leases(Utc::now()) {
            Ok(0) => {}
            Ok(n) => lock(stats).leases_reaped += n as u64,
            Err(e) => error!(error = %e, "lease reaper failed"),
        }
    }
}

fn run_next<S: JobStore>(
    queue: &QueueManager<S>,
    worker: &WorkerId,
    stats: &Mutex<PoolStats>,
) -> Result<Option<Job>, JobStoreError> {
    let Some(job) = queue.claim_next(worker)? else {
        return Ok(None);
    };

    lock(stats).current_running += 1;
    let outcome = execute(queue, &job, worker);

    let recorded = match outcome {
        Ok(result) => queue.mark_completed(job.clone(), worker, result),
        Err(failure) => queue.mark_failed(job.clone(), worker, &failure),
    };

    let mut s = lock(stats);
    s.current_running = s.current_running.saturating_sub(1);
    s.jobs_processed += 1;
    match recorded {
        Ok(job) => {
            match job.status {
                JobStatus::Completed => s.jobs_succeeded += 1,
                JobStatus::Delayed => s.jobs_retried += 1,
                _ => s.jobs_failed += 1,
            }
            Ok(Some(job))
        }
        Err(JobStoreError::LeaseLost(id)) => {
            s.outcomes_discarded += 1;
            drop(s);
            warn!(job_id = %id, worker = %worker, "lease lost; outcome discarded");
            Ok(queue.get_job(&id).ok().flatten().or(Some(job)))
        }
        Err(e) => Err(e),
    }
}

fn execute<S: JobStore>(
    queue: &QueueManager<S>,
    job: &Job,
    worker: &WorkerId,
) -> Result<serde_json::Value, HandlerError> {
    let Some(handler) = queue.registry().get(job.job_type) else {
        return Err(HandlerError::permanent(format!(
            "no handler registered for job type {}",
            job.job_type
        )));
    };

    let ctx = JobContext::new(job, worker, queue.store(), queue.lease_duration());
    panic::catch_unwind(AssertUnwindSafe(|| handler.handle(&ctx)))
        .unwrap_or_else(|payload| Err(HandlerError::transient(panic_message(payload.as_ref()))))
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    let detail = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    format!("handler panicked: {detail}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::flag::StaticFlag;
    use crate::jobs::registry::{HandlerRegistry, handler_fn};
    use crate::jobs::store::InMemoryJobStore;
    use crate::jobs::types::{JobId, JobOptions, JobPriority, JobType, RetryPolicy};
    use serde_json::json;
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::AtomicU32;

    type Queue = QueueManager<Arc<InMemoryJobStore>>;

    fn queue() -> Queue {
        QueueManager::new(
            InMemoryJobStore::arc(),
            Arc::new(HandlerRegistry::new()),
            Arc::new(StaticFlag::default()),
        )
        .with_retry_policy(RetryPolicy::fixed(3, Duration::ZERO))
    }

    fn team_job(queue: &Queue, priority: JobPriority) -> Job {
        queue
            .add_job(
                JobType::TeamMetrics,
                json!({"repositoryId": "r"}),
                JobOptions::new().priority(priority),
            )
            .unwrap()
    }

    #[test]
    fn mixed_priorities_run_high_first() {
        let queue = queue();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        queue.register_worker(
            JobType::TeamMetrics,
            handler_fn(move |ctx: &JobContext<'_>| {
                sink.lock().unwrap().push(ctx.job.priority);
                Ok(json!(null))
            }),
        );

        for p in [JobPriority::Low, JobPriority::Medium, JobPriority::High, JobPriority::Low, JobPriority::High] {
            team_job(&queue, p);
        }
        WorkerPool::drain(&queue, &WorkerId::new("w")).unwrap();

        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                JobPriority::High,
                JobPriority::High,
                JobPriority::Medium,
                JobPriority::Low,
                JobPriority::Low,
            ]
        );
    }

    #[test]
    fn always_failing_job_ends_failed_after_max_attempts() {
        let queue = queue();
        queue.register_worker(
            JobType::TeamMetrics,
            handler_fn(|_ctx: &JobContext<'_>| Err(HandlerError::transient("repository host down"))),
        );
        let job = team_job(&queue, JobPriority::Medium);

        let ran = WorkerPool::drain(&queue, &WorkerId::new("w")).unwrap();

        let stored = queue.get_job(&job.id).unwrap().unwrap();
        assert_eq!(ran, 3);
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(stored.attempts, stored.max_attempts);
        assert_eq!(stored.last_error.as_deref(), Some("repository host down"));
        assert_eq!(stored.history.len(), 3);
    }

    #[test]
    fn job_succeeding_on_second_attempt_completes() {
        let queue = queue();
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        queue.register_worker(
            JobType::TeamMetrics,
            handler_fn(move |_ctx: &JobContext<'_>| {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(HandlerError::transient("flaky"))
                } else {
                    Ok(json!({"saved": true}))
                }
            }),
        );
        let job = team_job(&queue, JobPriority::Medium);

        let first = WorkerPool::run_next(&queue, &WorkerId::new("w")).unwrap().unwrap();
        assert_eq!(first.status, JobStatus::Delayed);
        assert!(first.next_retry_at.is_some());

        WorkerPool::drain(&queue, &WorkerId::new("w")).unwrap();
        let stored = queue.get_job(&job.id).unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Completed);
        assert_eq!(stored.attempts, 2);
        assert_eq!(stored.result, Some(json!({"saved": true})));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn permanent_failure_is_not_retried() {
        let queue = queue();
        queue.register_worker(
            JobType::TeamMetrics,
            handler_fn(|_ctx: &JobContext<'_>| Err(HandlerError::permanent("unknown repository"))),
        );
        let job = team_job(&queue, JobPriority::Medium);

        assert_eq!(WorkerPool::drain(&queue, &WorkerId::new("w")).unwrap(), 1);
        let stored = queue.get_job(&job.id).unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(stored.attempts, 1);
    }

    #[test]
    fn panicking_handler_is_a_retryable_failure() {
        let queue = queue();
        queue.register_worker(
            JobType::TeamMetrics,
            handler_fn(|_ctx: &JobContext<'_>| -> Result<serde_json::Value, HandlerError> {
                panic!("metrics engine exploded")
            }),
        );
        let job = team_job(&queue, JobPriority::Medium);

        let first = WorkerPool::run_next(&queue, &WorkerId::new("w")).unwrap().unwrap();
        assert_eq!(first.status, JobStatus::Delayed);
        assert!(first.last_error.unwrap().contains("metrics engine exploded"));

        WorkerPool::drain(&queue, &WorkerId::new("w")).unwrap();
        assert_eq!(queue.get_job_state(&job.id).unwrap(), Some(JobStatus::Failed));
    }

    #[test]
    fn last_registered_handler_runs() {
        let queue = queue();
        queue.register_worker(JobType::TeamMetrics, handler_fn(|_ctx: &JobContext<'_>| Ok(json!("old"))));
        queue.register_worker(JobType::TeamMetrics, handler_fn(|_ctx: &JobContext<'_>| Ok(json!("new"))));
        let job = team_job(&queue, JobPriority::Medium);

        WorkerPool::drain(&queue, &WorkerId::new("w")).unwrap();

        assert_eq!(queue.get_job(&job.id).unwrap().unwrap().result, Some(json!("new")));
    }

    #[test]
    fn pool_never_runs_a_job_twice_concurrently() {
        let queue = Arc::new(queue());
        let in_flight = Arc::new(Mutex::new(HashSet::<JobId>::new()));
        let runs = Arc::new(Mutex::new(HashMap::<JobId, u32>::new()));
        let overlap = Arc::new(AtomicBool::new(false));

        {
            let in_flight = in_flight.clone();
            let runs = runs.clone();
            let overlap = overlap.clone();
            queue.register_worker(
                JobType::TeamMetrics,
                handler_fn(move |ctx: &JobContext<'_>| {
                    if !in_flight.lock().unwrap().insert(ctx.job.id.clone()) {
                        overlap.store(true, Ordering::SeqCst);
                    }
                    *runs.lock().unwrap().entry(ctx.job.id.clone()).or_default() += 1;
                    thread::sleep(Duration::from_millis(5));
                    in_flight.lock().unwrap().remove(&ctx.job.id);
                    Ok(json!(null))
                }),
            );
        }

        for _ in 0..40 {
            team_job(&queue, JobPriority::Medium);
        }

        let handle = WorkerPool::spawn(
            queue.clone(),
            WorkerPoolConfig::default()
                .with_workers(4)
                .with_poll_interval(Duration::from_millis(5)),
        )
        .unwrap();

        let deadline = Instant::now() + Duration::from_secs(10);
        while queue.stats().unwrap().completed < 40 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        let stats = handle.stats();
        handle.shutdown();

        assert!(!overlap.load(Ordering::SeqCst));
        assert_eq!(queue.stats().unwrap().completed, 40);
        assert!(runs.lock().unwrap().values().all(|&n| n == 1));
        assert_eq!(stats.jobs_succeeded, 40);
    }

    #[test]
    fn shutdown_lets_in_flight_job_finish() {
        let queue = Arc::new(queue());
        let (started_tx, started_rx) = std::sync::mpsc::channel::<()>();
        let started_tx = Mutex::new(started_tx);
        queue.register_worker(
            JobType::TeamMetrics,
            handler_fn(move |_ctx: &JobContext<'_>| {
                let _ = started_tx.lock().unwrap().send(());
                thread::sleep(Duration::from_millis(100));
                Ok(json!(null))
            }),
        );
        let job = team_job(&queue, JobPriority::Medium);

        let handle = WorkerPool::spawn(
            queue.clone(),
            WorkerPoolConfig::default()
                .with_workers(1)
                .with_poll_interval(Duration::from_millis(5)),
        )
        .unwrap();
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        handle.shutdown();

        assert_eq!(queue.get_job_state(&job.id).unwrap(), Some(JobStatus::Completed));
    }

    #[test]
    fn shutdown_stops_every_slot_and_the_reaper() {
        let queue = Arc::new(queue());
        let handle = WorkerPool::spawn(
            queue,
            WorkerPoolConfig::default()
                .with_workers(3)
                .with_poll_interval(Duration::from_millis(5))
                .with_reap_interval(Duration::from_millis(10)),
        )
        .unwrap();

        assert_eq!(handle.joins.len(), 4);
        assert_eq!(handle.stats().current_running, 0);
        handle.shutdown();
    }
}
