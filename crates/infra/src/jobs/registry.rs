//! Per-type handler registry and the context handed to handlers.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;

use super::store::{JobStore, JobStoreError};
use super::types::{Job, JobType, WorkerId};

/// Handler failure, classified for the retry policy.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandlerError {
    /// Eligible for retry (remote outage, store hiccup, lost lease, panic).
    #[error("{0}")]
    Transient(String),
    /// Retrying cannot help (e.g. undecodable payload); fails the job now.
    #[error("{0}")]
    Permanent(String),
}

impl HandlerError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent(message.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, HandlerError::Transient(_))
    }
}

/// Everything a handler may touch while executing one attempt.
pub struct JobContext<'a> {
    pub job: &'a Job,
    pub worker: &'a WorkerId,
    store: &'a dyn JobStore,
    lease_duration: Duration,
}

impl<'a> JobContext<'a> {
    pub fn new(
        job: &'a Job,
        worker: &'a WorkerId,
        store: &'a dyn JobStore,
        lease_duration: Duration,
    ) -> Self {
        Self {
            job,
            worker,
            store,
            lease_duration,
        }
    }

    /// Decode the payload; a mismatch is a permanent failure.
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T, HandlerError> {
        serde_json::from_value(self.job.payload.clone()).map_err(|e| {
            HandlerError::permanent(format!("invalid {} payload: {e}", self.job.job_type))
        })
    }

    /// Extend the lease for long-running work.
    ///
    /// Fails once the lease has been lost; the handler should stop then since
    /// its outcome will be discarded.
    pub fn heartbeat(&self) -> Result<DateTime<Utc>, HandlerError> {
        self.store
            .extend_lease(&self.job.id, self.worker, self.lease_duration, Utc::now())
            .map_err(|e| match e {
                JobStoreError::LeaseLost(_) => HandlerError::transient(e.to_string()),
                other => HandlerError::transient(format!("heartbeat failed: {other}")),
            })
    }
}

/// Executes jobs of one type.
pub trait JobHandler: Send + Sync {
    fn handle(&self, ctx: &JobContext<'_>) -> Result<serde_json::Value, HandlerError>;
}

impl<F> JobHandler for F
where
    F: Fn(&JobContext<'_>) -> Result<serde_json::Value, HandlerError> + Send + Sync,
{
    fn handle(&self, ctx: &JobContext<'_>) -> Result<serde_json::Value, HandlerError> {
        self(ctx)
    }
}

/// Wrap a closure as a shareable handler.
pub fn handler_fn<F>(f: F) -> Arc<dyn JobHandler>
where
    F: Fn(&JobContext<'_>) -> Result<serde_json::Value, HandlerError> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// One handler per job type, shared by the queue manager and its workers.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<JobType, Arc<dyn JobHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `job_type`. A later registration replaces an
    /// earlier one; returns true when something was replaced.
    pub fn register(&self, job_type: JobType, handler: Arc<dyn JobHandler>) -> bool {
        let mut handlers = self
            .handlers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        handlers.insert(job_type, handler).is_some()
    }

    pub fn get(&self, job_type: JobType) -> Option<Arc<dyn JobHandler>> {
        let handlers = self
            .handlers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        handlers.get(&job_type).cloned()
    }

    pub fn contains(&self, job_type: JobType) -> bool {
        self.get(job_type).is_some()
    }

    pub fn registered_types(&self) -> Vec<JobType> {
        let handlers = self
            .handlers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut types: Vec<_> = handlers.keys().copied().collect();
        types.sort();
        types
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("types", &self.registered_types())
            .finish()
    }
}
