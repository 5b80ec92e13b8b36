use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{Datelike, Timelike, Utc, Weekday};

use devpulse_core::{RepositoryId, TimeRange, UserId};

use crate::engine::{AnalyticsEngine, AnalyticsError};
use crate::metrics::{
    BurnoutLevel, BurnoutScore, CommitRecord, ContributorShare, KnowledgeDistribution,
    ProductivityMetrics, TeamCollaboration, TeamVelocity,
};
use crate::store::DataStore;

/// Deterministic engine computing plain commit statistics from the data store.
///
/// Model:
/// - Productivity: commit and line counts over the window, per active day.
/// - Burnout: weighted share of commits made after hours (before 08:00 or from
///   20:00 UTC) and on weekends.
/// - Knowledge: per-author commit share; bus factor is the number of top
///   authors covering half of the commits.
pub struct CommitStatsEngine {
    data: Arc<dyn DataStore>,
    after_hours_weight: f64,
}

impl CommitStatsEngine {
    pub fn new(data: Arc<dyn DataStore>) -> Self {
        Self {
            data,
            after_hours_weight: 0.6,
        }
    }

    fn repository_commits(
        &self,
        repository_id: RepositoryId,
        time_range: TimeRange,
    ) -> Result<Vec<CommitRecord>, AnalyticsError> {
        Ok(self.data.repository_commits(repository_id, time_range)?)
    }
}

fn ratio(part: usize, whole: usize) -> f64 {
    if whole == 0 { 0.0 } else { part as f64 / whole as f64 }
}

fn is_after_hours(commit: &CommitRecord) -> bool {
    let hour = commit.authored_at.hour();
    !(8..20).contains(&hour)
}

fn is_weekend(commit: &CommitRecord) -> bool {
    matches!(commit.authored_at.weekday(), Weekday::Sat | Weekday::Sun)
}

impl AnalyticsEngine for CommitStatsEngine {
    fn productivity_metrics(
        &self,
        user_id: UserId,
        time_range: TimeRange,
        repository_id: Option<RepositoryId>,
    ) -> Result<ProductivityMetrics, AnalyticsError> {
        let commits = self.data.author_commits(user_id, repository_id, time_range)?;

        let active_days: BTreeSet<_> = commits.iter().map(|c| c.authored_at.date_naive()).collect();
        let lines_added: u64 = commits.iter().map(|c| u64::from(c.additions)).sum();
        let lines_removed: u64 = commits.iter().map(|c| u64::from(c.deletions)).sum();

        Ok(ProductivityMetrics {
            user_id,
            repository_id,
            time_range,
            commit_count: commits.len() as u64,
            active_days: active_days.len() as u64,
            lines_added,
            lines_removed,
            commits_per_active_day: ratio(commits.len(), active_days.len()),
        })
    }

    fn burnout_risk(
        &self,
        user_id: UserId,
        repository_id: Option<RepositoryId>,
        window_days: u32,
    ) -> Result<BurnoutScore, AnalyticsError> {
        if window_days == 0 {
            return Err(AnalyticsError::InvalidInput(
                "burnout window must be at least one day".to_string(),
            ));
        }

        let window = TimeRange::last_days(Utc::now(), window_days);
        let commits = self.data.author_commits(user_id, repository_id, window)?;

        let after_hours_ratio = ratio(commits.iter().filter(|c| is_after_hours(c)).count(), commits.len());
        let weekend_ratio = ratio(commits.iter().filter(|c| is_weekend(c)).count(), commits.len());
        let score = (self.after_hours_weight * after_hours_ratio
            + (1.0 - self.after_hours_weight) * weekend_ratio)
            .clamp(0.0, 1.0);

        let level = if score >= 0.6 {
            BurnoutLevel::High
        } else if score >= 0.3 {
            BurnoutLevel::Moderate
        } else {
            BurnoutLevel::Low
        };

        Ok(BurnoutScore {
            user_id,
            repository_id,
            window_days,
            score,
            level,
            after_hours_ratio,
            weekend_ratio,
        })
    }

    fn team_velocity(
        &self,
        repository_id: RepositoryId,
        time_range: TimeRange,
    ) -> Result<TeamVelocity, AnalyticsError> {
        let commits = self.repository_commits(repository_id, time_range)?;
        let contributors: BTreeSet<_> = commits.iter().map(|c| c.author_id).collect();
        let lines_changed = commits
            .iter()
            .map(|c| u64::from(c.additions) + u64::from(c.deletions))
            .sum();

        Ok(TeamVelocity {
            commit_count: commits.len() as u64,
            commits_per_day: commits.len() as f64 / time_range.days() as f64,
            lines_changed,
            contributors: contributors.len() as u64,
        })
    }

    fn team_collaboration(
        &self,
        repository_id: RepositoryId,
        time_range: TimeRange,
    ) -> Result<TeamCollaboration, AnalyticsError> {
        let commits = self.repository_commits(repository_id, time_range)?;

        let mut authors_by_file: HashMap<&str, BTreeSet<UserId>> = HashMap::new();
        for commit in &commits {
            for file in &commit.files {
                authors_by_file.entry(file.as_str()).or_default().insert(commit.author_id);
            }
        }

        let contributors: BTreeSet<_> = commits.iter().map(|c| c.author_id).collect();
        let shared = authors_by_file.values().filter(|a| a.len() > 1).count();

        Ok(TeamCollaboration {
            contributors: contributors.len() as u64,
            files_touched: authors_by_file.len() as u64,
            shared_files: shared as u64,
            collaboration_index: ratio(shared, authors_by_file.len()),
        })
    }

    fn knowledge_distribution(
        &self,
        repository_id: RepositoryId,
        time_range: TimeRange,
    ) -> Result<KnowledgeDistribution, AnalyticsError> {
        let commits = self.repository_commits(repository_id, time_range)?;

        let mut per_author: BTreeMap<UserId, usize> = BTreeMap::new();
        for commit in &commits {
            *per_author.entry(commit.author_id).or_default() += 1;
        }

        let mut contributors: Vec<ContributorShare> = per_author
            .into_iter()
            .map(|(user_id, count)| ContributorShare {
                user_id,
                commit_share: ratio(count, commits.len()),
            })
            .collect();
        contributors.sort_by(|a, b| b.commit_share.total_cmp(&a.commit_share));

        let mut covered = 0.0;
        let mut bus_factor = 0;
        for share in &contributors {
            if covered >= 0.5 {
                break;
            }
            covered += share.commit_share;
            bus_factor += 1;
        }

        Ok(KnowledgeDistribution {
            contributors,
            bus_factor,
        })
    }
}
