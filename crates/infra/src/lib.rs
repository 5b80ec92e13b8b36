//! `devpulse-infra`
//!
//! **Responsibility:** the background job pipeline: the queue manager and its
//! stores, the worker pool, the job handlers, the recurring TEAM_METRICS
//! scheduler, and the Postgres analytics store.

pub mod analytics_store;
pub mod config;
pub mod handlers;
pub mod jobs;
pub mod scheduler;
