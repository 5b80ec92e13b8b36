//! Recurring TEAM_METRICS scheduler.
//!
//! Fans one TEAM_METRICS job out per tracked repository on a fixed cadence.
//! Each enqueue is isolated: a failing (or panicking) repository is logged,
//! recorded in the batch report, and the loop moves on.

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use devpulse_analytics::{RepositoryCatalog, StoreError};
use devpulse_core::RepositoryId;

use crate::handlers::{TeamMetricsPayload, start_of_day};
use crate::jobs::{JobId, JobOptions, JobPriority, JobSubmitter, JobType};

/// One repository the batch could not enqueue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchFailure {
    pub repository_id: RepositoryId,
    pub error: String,
}

/// Outcome of one scheduler run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchReport {
    pub started_at: DateTime<Utc>,
    pub repositories: usize,
    pub enqueued: Vec<JobId>,
    pub failures: Vec<BatchFailure>,
}

/// Deterministic id: one TEAM_METRICS job per repository per UTC day.
pub fn team_metrics_job_id(repository_id: RepositoryId, now: DateTime<Utc>) -> JobId {
    JobId::for_target(
        JobType::TeamMetrics,
        format!("{repository_id}:{}", now.date_naive().format("%Y-%m-%d")),
    )
}

/// Enqueue one TEAM_METRICS job per repository in `catalog`.
///
/// Only a failure to list repositories is returned as an error; per-item
/// failures land in the report.
pub fn run_batch(
    catalog: &dyn RepositoryCatalog,
    submitter: &dyn JobSubmitter,
    now: DateTime<Utc>,
) -> Result<BatchReport, StoreError> {
    let repositories = catalog.repository_list()?;
    let timestamp = start_of_day(now);

    let mut report = BatchReport {
        started_at: now,
        repositories: repositories.len(),
        enqueued: Vec::with_capacity(repositories.len()),
        failures: Vec::new(),
    };

    for repository in &repositories {
        let payload = TeamMetricsPayload {
            repository_id: repository.id,
            time_range: None,
            timestamp: Some(timestamp),
        };
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            let payload = serde_json::to_value(&payload)
                .map_err(|e| format!("failed to encode payload: {e}"))?;
            submitter
                .submit(
                    JobType::TeamMetrics,
                    payload,
                    JobOptions::new()
                        .priority(JobPriority::Medium)
                        .id(team_metrics_job_id(repository.id, now)),
                )
                .map_err(|e| e.to_string())
        }))
        .unwrap_or_else(|_| Err("enqueue panicked".to_string()));

        match outcome {
            Ok(job) => report.enqueued.push(job.id),
            Err(error) => {
                warn!(
                    repository_id = %repository.id,
                    repository = %repository.full_name,
                    error = %error,
                    "failed to enqueue team metrics; continuing"
                );
                report.failures.push(BatchFailure {
                    repository_id: repository.id,
                    error,
                });
            }
        }
    }

    info!(
        repositories = report.repositories,
        enqueued = report.enqueued.len(),
        failed = report.failures.len(),
        "team metrics batch finished"
    );
    Ok(report)
}

/// Config for the recurring scheduler.
#[derive(Debug, Clone)]
pub struct RecurringScheduler {
    pub interval: Duration,
    pub run_on_startup: bool,
    /// Retries of a failed repository listing before waiting for the next tick
    pub max_retries: u32,
    pub base_backoff: Duration,
}

impl Default for RecurringScheduler {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(24 * 60 * 60),
            run_on_startup: false,
            max_retries: 5,
            base_backoff: Duration::from_millis(250),
        }
    }
}

/// Handle for the running scheduler (shutdown + manual trigger).
#[derive(Debug)]
pub struct RecurringSchedulerHandle {
    shutdown: mpsc::Sender<()>,
    trigger: mpsc::SyncSender<()>,
    last_report: Arc<Mutex<Option<BatchReport>>>,
    join: Option<thread::JoinHandle<()>>,
}

impl RecurringSchedulerHandle {
    /// Request a run now. Triggers are coalesced: if one is already pending
    /// this is a no-op.
    pub fn trigger(&self) {
        let _ = self.trigger.try_send(());
    }

    /// Report of the most recent completed batch.
    pub fn last_report(&self) -> Option<BatchReport> {
        self.last_report
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Gracefully stop the scheduler thread.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }
}

impl RecurringScheduler {
    /// Spawn the scheduler thread.
    ///
    /// - Schedule: runs every `interval` (and once at startup if configured)
    /// - Manual trigger: `handle.trigger()`
    /// - Listing failures: retried with bounded exponential backoff; never propagate
    pub fn spawn(
        &self,
        name: &str,
        catalog: Arc<dyn RepositoryCatalog>,
        submitter: Arc<dyn JobSubmitter>,
    ) -> std::io::Result<RecurringSchedulerHandle> {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let (trigger_tx, trigger_rx) = mpsc::sync_channel::<()>(1);
        let last_report = Arc::new(Mutex::new(None));

        let cfg = self.clone();
        let runner_name = name.to_string();
        let reports = last_report.clone();
        let join = thread::Builder::new().name(name.to_string()).spawn(move || {
            scheduler_loop(
                &runner_name,
                cfg,
                shutdown_rx,
                trigger_rx,
                catalog.as_ref(),
                submitter.as_ref(),
                &reports,
            )
        })?;

        Ok(RecurringSchedulerHandle {
            shutdown: shutdown_tx,
            trigger: trigger_tx,
            last_report,
            join: Some(join),
        })
    }
}

fn scheduler_loop(
    name: &str,
    cfg: RecurringScheduler,
    shutdown_rx: mpsc::Receiver<()>,
    trigger_rx: mpsc::Receiver<()>,
    catalog: &dyn RepositoryCatalog,
    submitter: &dyn JobSubmitter,
    last_report: &Mutex<Option<BatchReport>>,
) {
    info!(scheduler = name, interval_secs = cfg.interval.as_secs(), "team metrics scheduler started");

    let interval = cfg.interval.max(Duration::from_secs(1));
    let mut next_tick = Instant::now() + interval;
    let mut pending = cfg.run_on_startup;
    let mut failures: u32 = 0;
    let mut backoff_until: Option<Instant> = None;

    loop {
        // Shutdown has priority; a dropped handle also stops the loop.
        match shutdown_rx.try_recv() {
            Ok(()) | Err(mpsc::TryRecvError::Disconnected) => break,
            Err(mpsc::TryRecvError::Empty) => {}
        }

        let now = Instant::now();
        if now >= next_tick {
            pending = true;
            // Keep a stable cadence even if we were delayed.
            while next_tick <= now {
                next_tick += interval;
            }
        }

        while trigger_rx.try_recv().is_ok() {
            pending = true;
        }

        if let Some(until) = backoff_until {
            if Instant::now() < until {
                thread::sleep(Duration::from_millis(50));
                continue;
            }
            backoff_until = None;
        }

        if !pending {
            let sleep_for = next_tick
                .saturating_duration_since(Instant::now())
                .min(Duration::from_millis(250));
            thread::sleep(sleep_for);
            continue;
        }

        pending = false;

        match run_batch(catalog, submitter, Utc::now()) {
            Ok(report) => {
                failures = 0;
                *last_report.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(report);
            }
            Err(e) => {
                warn!(scheduler = name, error = %e, "failed to list repositories");
                failures += 1;
                if failures <= cfg.max_retries {
                    pending = true;
                    backoff_until = Some(Instant::now() + backoff(cfg.base_backoff, failures));
                } else {
                    failures = 0;
                }
            }
        }
    }

    info!(scheduler = name, "team metrics scheduler stopped");
}

fn backoff(base: Duration, attempt: u32) -> Duration {
    // Exponential backoff: base * 2^(attempt-1), capped.
    let pow = 1u32 << attempt.saturating_sub(1).min(10);
    let ms = base.as_millis().saturating_mul(u128::from(pow));
    Duration::from_millis(ms.min(10_000) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{HandlerRegistry, InMemoryJobStore, Job, QueueError, QueueManager, StaticFlag, handler_fn};
    use devpulse_analytics::RepositoryRef;
    use devpulse_core::UserId;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Catalog {
        repositories: Vec<RepositoryRef>,
        outages: AtomicU32,
    }

    impl Catalog {
        fn with(count: usize) -> Self {
            let owner = UserId::new();
            Self {
                repositories: (1..=count)
                    .map(|i| RepositoryRef {
                        id: RepositoryId::new(),
                        owner_id: owner,
                        full_name: format!("acme/repo-{i}"),
                    })
                    .collect(),
                outages: AtomicU32::new(0),
            }
        }
    }

    impl RepositoryCatalog for Catalog {
        fn repository_list(&self) -> Result<Vec<RepositoryRef>, StoreError> {
            if self.outages.load(Ordering::SeqCst) > 0 {
                self.outages.fetch_sub(1, Ordering::SeqCst);
                return Err(StoreError::Storage("connection reset".to_string()));
            }
            Ok(self.repositories.clone())
        }
    }

    /// Records every attempt; fails (or panics) for one repository.
    struct FlakySubmitter {
        bad: RepositoryId,
        panic: bool,
        attempted: Mutex<Vec<RepositoryId>>,
    }

    impl JobSubmitter for FlakySubmitter {
        fn submit(
            &self,
            job_type: JobType,
            payload: serde_json::Value,
            options: JobOptions,
        ) -> Result<Job, QueueError> {
            let payload: TeamMetricsPayload = serde_json::from_value(payload).unwrap();
            self.attempted.lock().unwrap().push(payload.repository_id);
            if payload.repository_id == self.bad {
                if self.panic {
                    panic!("submitter exploded");
                }
                return Err(QueueError::InvalidPayload("rejected".to_string()));
            }
            Ok(Job::new(
                options.id.unwrap_or_default(),
                job_type,
                serde_json::to_value(&payload).unwrap(),
                options.priority.unwrap_or_default(),
                3,
                None,
                Utc::now(),
            ))
        }
    }

    fn queue() -> Arc<QueueManager<Arc<InMemoryJobStore>>> {
        let registry = Arc::new(HandlerRegistry::new());
        registry.register(JobType::TeamMetrics, handler_fn(|_ctx| Ok(serde_json::Value::Null)));
        Arc::new(QueueManager::new(InMemoryJobStore::arc(), registry, Arc::new(StaticFlag::default())))
    }

    fn assert_isolated(panic: bool) {
        let catalog = Catalog::with(5);
        let ids: Vec<_> = catalog.repositories.iter().map(|r| r.id).collect();
        let submitter = FlakySubmitter {
            bad: ids[2],
            panic,
            attempted: Mutex::new(Vec::new()),
        };

        let report = run_batch(&catalog, &submitter, Utc::now()).unwrap();

        assert_eq!(*submitter.attempted.lock().unwrap(), ids);
        assert_eq!(report.repositories, 5);
        assert_eq!(report.enqueued.len(), 4);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].repository_id, ids[2]);
    }

    #[test]
    fn failing_repository_does_not_stop_the_batch() {
        assert_isolated(false);
    }

    #[test]
    fn panicking_enqueue_does_not_stop_the_batch() {
        assert_isolated(true);
    }

    #[test]
    fn same_day_rerun_does_not_duplicate_jobs() {
        let catalog = Catalog::with(3);
        let queue = queue();
        let now = Utc::now();

        let first = run_batch(&catalog, queue.as_ref(), now).unwrap();
        let second = run_batch(&catalog, queue.as_ref(), now).unwrap();

        assert_eq!(first.enqueued, second.enqueued);
        assert_eq!(queue.stats().unwrap().waiting, 3);

        let job = queue.get_job(&first.enqueued[0]).unwrap().unwrap();
        assert_eq!(job.priority, JobPriority::Medium);
        assert_eq!(job.payload["timestamp"], serde_json::json!(start_of_day(now)));
    }

    #[test]
    fn job_id_is_stable_per_day() {
        let repo = RepositoryId::new();
        let now = Utc::now();
        let id = team_metrics_job_id(repo, now);

        assert_eq!(id, team_metrics_job_id(repo, now));
        assert!(id.as_str().starts_with(&format!("TEAM_METRICS:{repo}:")));
        assert_ne!(id, team_metrics_job_id(repo, now + chrono::Duration::days(1)));
    }

    #[test]
    fn trigger_runs_a_batch_and_listing_failures_are_retried() {
        let catalog = Arc::new(Catalog::with(2));
        catalog.outages.store(1, Ordering::SeqCst);
        let queue = queue();

        let scheduler = RecurringScheduler {
            base_backoff: Duration::from_millis(10),
            ..RecurringScheduler::default()
        };
        let handle = scheduler.spawn("test-scheduler", catalog, queue.clone()).unwrap();
        handle.trigger();

        let deadline = Instant::now() + Duration::from_secs(5);
        while handle.last_report().is_none() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(20));
        }
        let report = handle.last_report();
        handle.shutdown();

        assert_eq!(report.map(|r| r.enqueued.len()), Some(2));
        assert_eq!(queue.stats().unwrap().waiting, 2);
    }

    #[test]
    fn backoff_is_capped() {
        assert_eq!(backoff(Duration::from_millis(250), 1), Duration::from_millis(250));
        assert_eq!(backoff(Duration::from_millis(250), 3), Duration::from_secs(1));
        assert_eq!(backoff(Duration::from_millis(250), 30), Duration::from_secs(10));
    }
}
