use thiserror::Error;

use devpulse_core::{RepositoryId, TimeRange, UserId};

use crate::metrics::{
    BurnoutScore, KnowledgeDistribution, ProductivityMetrics, TeamCollaboration, TeamVelocity,
};
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum AnalyticsError {
    #[error("invalid analytics input: {0}")]
    InvalidInput(String),

    #[error("analytics data unavailable: {0}")]
    Data(#[from] StoreError),

    #[error("analytics computation failed: {0}")]
    Computation(String),
}

/// Call contract of the analytics engine.
///
/// Implementations may block on database reads; they must not write.
pub trait AnalyticsEngine: Send + Sync + 'static {
    fn productivity_metrics(
        &self,
        user_id: UserId,
        time_range: TimeRange,
        repository_id: Option<RepositoryId>,
    ) -> Result<ProductivityMetrics, AnalyticsError>;

    fn burnout_risk(
        &self,
        user_id: UserId,
        repository_id: Option<RepositoryId>,
        window_days: u32,
    ) -> Result<BurnoutScore, AnalyticsError>;

    fn team_velocity(
        &self,
        repository_id: RepositoryId,
        time_range: TimeRange,
    ) -> Result<TeamVelocity, AnalyticsError>;

    fn team_collaboration(
        &self,
        repository_id: RepositoryId,
        time_range: TimeRange,
    ) -> Result<TeamCollaboration, AnalyticsError>;

    fn knowledge_distribution(
        &self,
        repository_id: RepositoryId,
        time_range: TimeRange,
    ) -> Result<KnowledgeDistribution, AnalyticsError>;
}
