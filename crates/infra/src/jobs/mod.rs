//! Background job pipeline: priority queue, worker pool, retry and leases.
//!
//! ## Design
//!
//! - Jobs are typed (`JobType`) and routed to one handler per type
//! - HIGH before MEDIUM before LOW; FIFO within a tier
//! - Retry policy with configurable backoff, owned by the queue manager
//! - Handler errors are transient (retried) or permanent (failed at once)
//! - Leases bound how long a worker may hold a job; expired leases are reaped
//!
//! ## Components
//!
//! - `Job`: core job record with payload, status and attempt history
//! - `JobStore`: persistence with an atomic claim (in-memory or Redis)
//! - `QueueManager`: admission, registration, state queries, outcome recording
//! - `WorkerPool`: execution slots and the lease reaper

pub mod flag;
pub mod manager;
pub mod pool;
#[cfg(feature = "redis")]
pub mod redis_store;
pub mod registry;
pub mod store;
pub mod types;

pub use flag::{BackgroundJobsFlag, StaticFlag};
pub use manager::{JobSubmitter, QueueError, QueueManager};
pub use pool::{PoolStats, WorkerPool, WorkerPoolConfig, WorkerPoolHandle};
#[cfg(feature = "redis")]
pub use redis_store::RedisJobStore;
pub use registry::{HandlerError, HandlerRegistry, JobContext, JobHandler, handler_fn};
pub use store::{Enqueued, InMemoryJobStore, JobStats, JobStore, JobStoreError};
pub use types::{
    BackoffStrategy, Job, JobAttemptRecord, JobId, JobOptions, JobPriority, JobStatus, JobType,
    Lease, ParseError, RetryPolicy, WorkerId,
};
