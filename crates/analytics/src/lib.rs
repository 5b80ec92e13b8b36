//! `devpulse-analytics`
//!
//! **Responsibility:** the boundary between the job pipeline and the systems it
//! drives: the repository host, the relational data store, the metrics store
//! and the analytics engine.
//!
//! The pipeline only depends on the traits here. Scoring formulas are not part
//! of the contract; `CommitStatsEngine` is a plain commit-statistics engine for
//! development wiring and tests.

pub mod commit_stats;
pub mod engine;
pub mod host;
pub mod in_memory;
pub mod metrics;
pub mod store;

pub use commit_stats::CommitStatsEngine;
pub use engine::{AnalyticsEngine, AnalyticsError};
pub use host::{HostError, RepositoryHost};
pub use in_memory::{InMemoryDataStore, InMemoryMetricsStore, StaticRepositoryHost};
pub use metrics::{
    BurnoutLevel, BurnoutScore, CommitRecord, ContributorShare, KnowledgeDistribution,
    ProductivityMetrics, RepositoryRef, TeamCollaboration, TeamMetrics, TeamMetricsRecord,
    TeamVelocity, UserMetrics, UserMetricsRecord,
};
pub use store::{DataStore, MetricsStore, RepositoryCatalog, StoreError};
