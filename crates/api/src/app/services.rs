use std::sync::Arc;

use devpulse_analytics::{
    CommitStatsEngine, DataStore, InMemoryDataStore, InMemoryMetricsStore, MetricsStore,
    RepositoryCatalog, RepositoryHost, StaticRepositoryHost,
};
use devpulse_infra::config::QueueConfig;
use devpulse_infra::handlers::{HandlerDeps, register_default_handlers};
use devpulse_infra::jobs::{
    HandlerRegistry, InMemoryJobStore, JobStore, QueueManager, StaticFlag, WorkerPool, WorkerPoolHandle,
};
use devpulse_infra::scheduler::RecurringSchedulerHandle;

#[cfg(feature = "redis")]
use devpulse_infra::{analytics_store::PostgresAnalyticsStore, jobs::RedisJobStore};
#[cfg(feature = "redis")]
use sqlx::PgPool;

/// Queue manager over whichever job store the process was wired with.
pub type AppQueue = QueueManager<Arc<dyn JobStore>>;

/// Everything the routes need, plus the background threads kept alive for
/// the lifetime of the process.
pub struct AppServices {
    pub queue: Arc<AppQueue>,
    pub metrics: Arc<dyn MetricsStore>,
    pub flag: Arc<StaticFlag>,
    pub backend: &'static str,
    scheduler: RecurringSchedulerHandle,
    _pool: WorkerPoolHandle,
}

impl AppServices {
    pub fn trigger_scheduler(&self) {
        self.scheduler.trigger();
    }

    pub fn last_batch(&self) -> Option<devpulse_infra::scheduler::BatchReport> {
        self.scheduler.last_report()
    }
}

/// Collaborators behind the queue: stores, host and engine.
pub struct Backend {
    pub name: &'static str,
    pub jobs: Arc<dyn JobStore>,
    pub host: Arc<dyn RepositoryHost>,
    pub data: Arc<dyn DataStore>,
    pub catalog: Arc<dyn RepositoryCatalog>,
    pub metrics: Arc<dyn MetricsStore>,
}

impl Backend {
    pub fn in_memory() -> Self {
        let data = Arc::new(InMemoryDataStore::new());
        Self {
            name: "in_memory",
            jobs: InMemoryJobStore::arc(),
            host: Arc::new(StaticRepositoryHost::new()),
            data: data.clone(),
            catalog: data,
            metrics: Arc::new(InMemoryMetricsStore::new()),
        }
    }
}

pub async fn build_services() -> anyhow::Result<AppServices> {
    let config = QueueConfig::from_env()?;

    let use_persistent = std::env::var("USE_PERSISTENT_STORES")
        .unwrap_or_else(|_| "false".to_string())
        .parse::<bool>()
        .unwrap_or(false);

    if use_persistent {
        #[cfg(feature = "redis")]
        {
            let backend = build_persistent_backend().await?;
            return start_services(config, backend);
        }
        #[cfg(not(feature = "redis"))]
        {
            tracing::warn!(
                "USE_PERSISTENT_STORES=true but redis feature not enabled, falling back to in-memory"
            );
        }
    }

    start_services(config, Backend::in_memory())
}

/// Wire the queue, handlers, worker pool and recurring scheduler on `backend`.
pub fn start_services(config: QueueConfig, backend: Backend) -> anyhow::Result<AppServices> {
    let registry = Arc::new(HandlerRegistry::new());
    register_default_handlers(
        &registry,
        &HandlerDeps {
            host: backend.host.clone(),
            data: backend.data.clone(),
            engine: Arc::new(CommitStatsEngine::new(backend.data.clone())),
            metrics: backend.metrics.clone(),
        },
    );

    let flag = Arc::new(StaticFlag::new(config.background_jobs_enabled));
    let queue = Arc::new(
        QueueManager::new(backend.jobs.clone(), registry, flag.clone())
            .with_retry_policy(config.retry.clone())
            .with_lease_duration(config.lease_duration),
    );

    let pool = WorkerPool::spawn(queue.clone(), config.pool_config())?;
    let scheduler = config
        .scheduler()
        .spawn("team-metrics-scheduler", backend.catalog.clone(), queue.clone())?;

    tracing::info!(
        backend = backend.name,
        workers = config.workers,
        background_jobs = config.background_jobs_enabled,
        "job pipeline started"
    );

    Ok(AppServices {
        queue,
        metrics: backend.metrics,
        flag,
        backend: backend.name,
        scheduler,
        _pool: pool,
    })
}

#[cfg(feature = "redis")]
async fn build_persistent_backend() -> anyhow::Result<Backend> {
    use anyhow::Context;

    let database_url =
        std::env::var("DATABASE_URL").context("DATABASE_URL must be set when USE_PERSISTENT_STORES=true")?;
    let redis_url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string());

    let pool = PgPool::connect(&database_url)
        .await
        .context("failed to connect to Postgres")?;
    let store = Arc::new(PostgresAnalyticsStore::new(pool)?);
    store.migrate().await?;

    let jobs = RedisJobStore::new(&redis_url, None)?;

    Ok(Backend {
        name: "persistent",
        jobs: Arc::new(jobs),
        // Repository hosting is not wired to a real provider here.
        host: Arc::new(StaticRepositoryHost::new()),
        data: store.clone(),
        catalog: store.clone(),
        metrics: store,
    })
}
