//! Records exchanged with the external stores and the analytics engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use devpulse_core::{RepositoryId, TimeRange, UserId};

/// A tracked repository as listed by the data store or the repository host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepositoryRef {
    pub id: RepositoryId,
    pub owner_id: UserId,
    pub full_name: String,
}

/// One commit as fetched from the repository host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitRecord {
    pub sha: String,
    pub repository_id: RepositoryId,
    pub author_id: UserId,
    pub authored_at: DateTime<Utc>,
    pub additions: u32,
    pub deletions: u32,
    #[serde(default)]
    pub files: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductivityMetrics {
    pub user_id: UserId,
    pub repository_id: Option<RepositoryId>,
    pub time_range: TimeRange,
    pub commit_count: u64,
    pub active_days: u64,
    pub lines_added: u64,
    pub lines_removed: u64,
    pub commits_per_active_day: f64,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BurnoutLevel {
    Low,
    Moderate,
    High,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BurnoutScore {
    pub user_id: UserId,
    pub repository_id: Option<RepositoryId>,
    pub window_days: u32,
    /// Risk in `[0, 1]`.
    pub score: f64,
    pub level: BurnoutLevel,
    pub after_hours_ratio: f64,
    pub weekend_ratio: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TeamVelocity {
    pub commit_count: u64,
    pub commits_per_day: f64,
    pub lines_changed: u64,
    pub contributors: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TeamCollaboration {
    pub contributors: u64,
    pub files_touched: u64,
    pub shared_files: u64,
    /// Share of touched files edited by more than one contributor.
    pub collaboration_index: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContributorShare {
    pub user_id: UserId,
    pub commit_share: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KnowledgeDistribution {
    /// Sorted by descending share.
    pub contributors: Vec<ContributorShare>,
    /// Smallest number of contributors that together authored half the commits.
    pub bus_factor: u64,
}

/// Everything a TEAM_METRICS run computes for one repository.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TeamMetrics {
    pub time_range: TimeRange,
    pub velocity: TeamVelocity,
    pub collaboration: TeamCollaboration,
    pub knowledge: KnowledgeDistribution,
}

/// Everything a METRICS_CALCULATION run computes for one user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserMetrics {
    pub productivity: ProductivityMetrics,
    pub burnout: BurnoutScore,
}

/// A persisted team metrics snapshot, keyed by `(repository_id, timestamp)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TeamMetricsRecord {
    pub repository_id: RepositoryId,
    pub timestamp: DateTime<Utc>,
    pub metrics: TeamMetrics,
    pub updated_at: DateTime<Utc>,
}

/// A persisted user metrics snapshot, keyed by `(user_id, repository_id, timestamp)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserMetricsRecord {
    pub user_id: UserId,
    pub repository_id: Option<RepositoryId>,
    pub timestamp: DateTime<Utc>,
    pub metrics: UserMetrics,
    pub updated_at: DateTime<Utc>,
}
