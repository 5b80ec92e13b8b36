use std::sync::Arc;

use chrono::{DateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use devpulse_analytics::{AnalyticsEngine, MetricsStore, TeamMetrics, UserMetrics};
use devpulse_core::{RepositoryId, TimeRange, UserId};

use super::{analytics_failure, store_failure};
use crate::jobs::{HandlerError, JobContext, JobHandler};

pub const DEFAULT_METRICS_RANGE_DAYS: u32 = 30;
pub const DEFAULT_BURNOUT_WINDOW_DAYS: u32 = 30;

/// Midnight UTC of the day containing `at`; the default snapshot key.
pub fn start_of_day(at: DateTime<Utc>) -> DateTime<Utc> {
    at.date_naive().and_time(NaiveTime::MIN).and_utc()
}

/// Payload of METRICS_CALCULATION jobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsCalculationPayload {
    pub user_id: UserId,
    #[serde(default)]
    pub repository_id: Option<RepositoryId>,
    #[serde(default)]
    pub time_range: Option<TimeRange>,
    #[serde(default)]
    pub window_days: Option<u32>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

/// Payload of TEAM_METRICS jobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TeamMetricsPayload {
    pub repository_id: RepositoryId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_range: Option<TimeRange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

fn to_json<T: Serialize>(value: &T) -> Result<serde_json::Value, HandlerError> {
    serde_json::to_value(value).map_err(|e| HandlerError::permanent(e.to_string()))
}

/// Productivity and burnout metrics for one user.
pub struct MetricsCalculationHandler {
    engine: Arc<dyn AnalyticsEngine>,
    metrics: Arc<dyn MetricsStore>,
}

impl MetricsCalculationHandler {
    pub fn new(engine: Arc<dyn AnalyticsEngine>, metrics: Arc<dyn MetricsStore>) -> Self {
        Self { engine, metrics }
    }
}

impl JobHandler for MetricsCalculationHandler {
    fn handle(&self, ctx: &JobContext<'_>) -> Result<serde_json::Value, HandlerError> {
        let payload: MetricsCalculationPayload = ctx.payload()?;
        let now = Utc::now();
        let time_range = payload
            .time_range
            .unwrap_or_else(|| TimeRange::last_days(now, DEFAULT_METRICS_RANGE_DAYS));
        let timestamp = payload.timestamp.unwrap_or_else(|| start_of_day(now));

        let productivity = self
            .engine
            .productivity_metrics(payload.user_id, time_range, payload.repository_id)
            .map_err(analytics_failure)?;
        let burnout = self
            .engine
            .burnout_risk(
                payload.user_id,
                payload.repository_id,
                payload.window_days.unwrap_or(DEFAULT_BURNOUT_WINDOW_DAYS),
            )
            .map_err(analytics_failure)?;

        let metrics = UserMetrics {
            productivity,
            burnout,
        };
        self.metrics
            .save_user_metrics(payload.user_id, payload.repository_id, timestamp, &metrics)
            .map_err(store_failure)?;

        debug!(job_id = %ctx.job.id, user_id = %payload.user_id, %timestamp, "user metrics saved");
        to_json(&metrics)
    }
}

/// Velocity, collaboration and knowledge distribution for one repository.
pub struct TeamMetricsHandler {
    engine: Arc<dyn AnalyticsEngine>,
    metrics: Arc<dyn MetricsStore>,
}

impl TeamMetricsHandler {
    pub fn new(engine: Arc<dyn AnalyticsEngine>, metrics: Arc<dyn MetricsStore>) -> Self {
        Self { engine, metrics }
    }
}

impl JobHandler for TeamMetricsHandler {
    fn handle(&self, ctx: &JobContext<'_>) -> Result<serde_json::Value, HandlerError> {
        let payload: TeamMetricsPayload = ctx.payload()?;
        let now = Utc::now();
        let repository_id = payload.repository_id;
        let time_range = payload
            .time_range
            .unwrap_or_else(|| TimeRange::last_days(now, DEFAULT_METRICS_RANGE_DAYS));
        let timestamp = payload.timestamp.unwrap_or_else(|| start_of_day(now));

        let metrics = TeamMetrics {
            time_range,
            velocity: self
                .engine
                .team_velocity(repository_id, time_range)
                .map_err(analytics_failure)?,
            collaboration: self
                .engine
                .team_collaboration(repository_id, time_range)
                .map_err(analytics_failure)?,
            knowledge: self
                .engine
                .knowledge_distribution(repository_id, time_range)
                .map_err(analytics_failure)?,
        };

        self.metrics
            .save_team_metrics(repository_id, timestamp, &metrics)
            .map_err(store_failure)?;

        debug!(job_id = %ctx.job.id, repository_id = %repository_id, %timestamp, "team metrics saved");
        to_json(&metrics)
    }
}
