//! Job handlers for the four job types.
//!
//! Sync handlers pull from the repository host into the data store; metrics
//! handlers call the analytics engine and upsert through the metrics store.
//! Every write they make is keyed, so a retried attempt converges on the
//! same rows.

mod metrics;
mod sync;

use std::sync::Arc;

use devpulse_analytics::{
    AnalyticsEngine, AnalyticsError, DataStore, HostError, MetricsStore, RepositoryHost, StoreError,
};

use crate::jobs::{HandlerError, HandlerRegistry, JobType};

pub use metrics::{
    DEFAULT_BURNOUT_WINDOW_DAYS, DEFAULT_METRICS_RANGE_DAYS, MetricsCalculationHandler,
    MetricsCalculationPayload, TeamMetricsHandler, TeamMetricsPayload, start_of_day,
};
pub use sync::{SyncHandler, SyncPayload, SyncReport};

/// External collaborators the handlers drive.
#[derive(Clone)]
pub struct HandlerDeps {
    pub host: Arc<dyn RepositoryHost>,
    pub data: Arc<dyn DataStore>,
    pub engine: Arc<dyn AnalyticsEngine>,
    pub metrics: Arc<dyn MetricsStore>,
}

/// Register one handler per job type.
pub fn register_default_handlers(registry: &HandlerRegistry, deps: &HandlerDeps) {
    registry.register(
        JobType::InitialSync,
        Arc::new(SyncHandler::initial(deps.host.clone(), deps.data.clone())),
    );
    registry.register(
        JobType::IncrementalSync,
        Arc::new(SyncHandler::incremental(deps.host.clone(), deps.data.clone())),
    );
    registry.register(
        JobType::MetricsCalculation,
        Arc::new(MetricsCalculationHandler::new(deps.engine.clone(), deps.metrics.clone())),
    );
    registry.register(
        JobType::TeamMetrics,
        Arc::new(TeamMetricsHandler::new(deps.engine.clone(), deps.metrics.clone())),
    );
}

pub(crate) fn store_failure(e: StoreError) -> HandlerError {
    match e {
        StoreError::Storage(_) => HandlerError::transient(e.to_string()),
        StoreError::NotFound(_) | StoreError::Malformed(_) => HandlerError::permanent(e.to_string()),
    }
}

pub(crate) fn host_failure(e: HostError) -> HandlerError {
    match e {
        HostError::Unavailable(_) | HostError::RateLimited => HandlerError::transient(e.to_string()),
        HostError::AccessDenied(_) => HandlerError::permanent(e.to_string()),
    }
}

pub(crate) fn analytics_failure(e: AnalyticsError) -> HandlerError {
    match e {
        AnalyticsError::InvalidInput(_) => HandlerError::permanent(e.to_string()),
        AnalyticsError::Data(store) => store_failure(store),
        AnalyticsError::Computation(_) => HandlerError::transient(e.to_string()),
    }
}
