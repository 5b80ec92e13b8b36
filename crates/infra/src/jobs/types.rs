//! Core job types and policies.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Caller-defined job identifier.
///
/// Generated ids are UUIDv7 strings. Callers that want duplicate suppression
/// derive the id from the job target with [`JobId::for_target`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    /// Deterministic id for "this kind of work on this target".
    pub fn for_target(job_type: JobType, target: impl std::fmt::Display) -> Self {
        Self(format!("{}:{}", job_type.as_str(), target))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for JobId {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(ParseError::new("job id", s));
        }
        Ok(Self(trimmed.to_string()))
    }
}

/// Failure to parse one of the job enums or ids from text.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid {what}: {value:?}")]
pub struct ParseError {
    pub what: &'static str,
    pub value: String,
}

impl ParseError {
    fn new(what: &'static str, value: &str) -> Self {
        Self {
            what,
            value: value.to_string(),
        }
    }
}

/// Job type, used to route a job to its handler.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobType {
    /// Full-history repository sync for a user.
    InitialSync,
    /// Sync of commits newer than the last stored one.
    IncrementalSync,
    /// Productivity + burnout metrics for a user.
    MetricsCalculation,
    /// Velocity, collaboration and knowledge metrics for a repository.
    TeamMetrics,
}

impl JobType {
    pub const ALL: [JobType; 4] = [
        JobType::InitialSync,
        JobType::IncrementalSync,
        JobType::MetricsCalculation,
        JobType::TeamMetrics,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::InitialSync => "INITIAL_SYNC",
            JobType::IncrementalSync => "INCREMENTAL_SYNC",
            JobType::MetricsCalculation => "METRICS_CALCULATION",
            JobType::TeamMetrics => "TEAM_METRICS",
        }
    }

    /// Priority used when the caller does not pick one.
    pub fn default_priority(&self) -> JobPriority {
        match self {
            JobType::InitialSync => JobPriority::High,
            JobType::IncrementalSync | JobType::MetricsCalculation | JobType::TeamMetrics => {
                JobPriority::Medium
            }
        }
    }

    /// Payload fields that must be present for admission.
    pub fn required_fields(&self) -> &'static [&'static str] {
        match self {
            JobType::InitialSync | JobType::IncrementalSync | JobType::MetricsCalculation => {
                &["userId"]
            }
            JobType::TeamMetrics => &["repositoryId"],
        }
    }
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobType {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobType::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| ParseError::new("job type", s))
    }
}

/// Dequeue priority. HIGH is claimed before MEDIUM before LOW.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobPriority {
    High,
    Medium,
    Low,
}

impl JobPriority {
    /// Claim rank: lower ranks are claimed first.
    pub fn rank(&self) -> u8 {
        match self {
            JobPriority::High => 0,
            JobPriority::Medium => 1,
            JobPriority::Low => 2,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobPriority::High => "HIGH",
            JobPriority::Medium => "MEDIUM",
            JobPriority::Low => "LOW",
        }
    }
}

impl Default for JobPriority {
    fn default() -> Self {
        Self::Medium
    }
}

impl FromStr for JobPriority {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "HIGH" => Ok(JobPriority::High),
            "MEDIUM" => Ok(JobPriority::Medium),
            "LOW" => Ok(JobPriority::Low),
            _ => Err(ParseError::new("job priority", s)),
        }
    }
}

/// Job lifecycle status.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// Queued, waiting to be claimed
    Waiting,
    /// Claimed by exactly one worker
    Active,
    /// Handler succeeded
    Completed,
    /// Attempts exhausted or permanent failure; never retried
    Failed,
    /// Waiting for `next_retry_at` (retry backoff or admission delay)
    Delayed,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Waiting,
        JobStatus::Active,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Delayed,
    ];

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Waiting => "WAITING",
            JobStatus::Active => "ACTIVE",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
            JobStatus::Delayed => "DELAYED",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .into_iter()
            .find(|st| st.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| ParseError::new("job status", s))
    }
}

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// Exponential backoff: base * 2^(attempt-1)
    Exponential,
    /// Linear backoff: base * attempt
    Linear,
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        Self::Exponential
    }
}

impl FromStr for BackoffStrategy {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fixed" => Ok(Self::Fixed),
            "exponential" => Ok(Self::Exponential),
            "linear" => Ok(Self::Linear),
            _ => Err(ParseError::new("backoff strategy", s)),
        }
    }
}

/// Retry policy owned by the queue manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Attempts granted to jobs that don't set their own (1 = no retries)
    pub max_attempts: u32,
    /// Base delay between retries
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    /// Backoff strategy
    pub strategy: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(300),
            strategy: BackoffStrategy::Exponential,
        }
    }
}

impl RetryPolicy {
    /// Create a policy with fixed delays.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
        }
    }

    /// Create a policy with exponential backoff.
    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
        }
    }

    /// Delay before the retry that follows failed attempt number `attempt` (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let delay = match self.strategy {
            BackoffStrategy::Fixed => self.base_delay,
            BackoffStrategy::Exponential => {
                let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
                self.base_delay.saturating_mul(factor)
            }
            BackoffStrategy::Linear => self.base_delay.saturating_mul(attempt),
        };

        delay.min(self.max_delay)
    }
}

/// Identity of a worker slot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(String);

impl WorkerId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// `<pool>-<slot>-<random suffix>`; unique across restarts.
    pub fn for_slot(pool: &str, slot: usize) -> Self {
        let suffix = Uuid::now_v7().simple().to_string();
        Self(format!("{pool}-{slot}-{}", &suffix[suffix.len() - 8..]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Time-bounded ownership of an ACTIVE job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lease {
    pub worker_id: WorkerId,
    pub expires_at: DateTime<Utc>,
}

/// Options accepted by `add_job`.
#[derive(Debug, Clone, Default)]
pub struct JobOptions {
    pub priority: Option<JobPriority>,
    pub id: Option<JobId>,
    pub max_attempts: Option<u32>,
    pub delay: Option<Duration>,
}

impl JobOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn priority(mut self, priority: JobPriority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn id(mut self, id: JobId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

pub(crate) fn instant_after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// A background job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: JobId,
    #[serde(rename = "type")]
    pub job_type: JobType,
    /// JSON object consumed by the handler
    pub payload: serde_json::Value,
    pub priority: JobPriority,
    pub status: JobStatus,
    /// Executions so far; incremented on every claim
    pub attempts: u32,
    pub max_attempts: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Set only while DELAYED
    pub next_retry_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Set only while ACTIVE
    pub lease: Option<Lease>,
    /// Value returned by the handler on success
    pub result: Option<serde_json::Value>,
    /// Store-assigned enqueue order (FIFO tie-breaker)
    pub sequence: u64,
    /// One record per finished attempt
    pub history: Vec<JobAttemptRecord>,
}

/// Record of a job execution attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobAttemptRecord {
    pub attempt: u32,
    pub worker_id: Option<WorkerId>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub success: bool,
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl Job {
    /// Create a WAITING job (DELAYED when `delay` is non-zero).
    pub fn new(
        id: JobId,
        job_type: JobType,
        payload: serde_json::Value,
        priority: JobPriority,
        max_attempts: u32,
        delay: Option<Duration>,
        now: DateTime<Utc>,
    ) -> Self {
        let next_retry_at = delay.filter(|d| !d.is_zero()).map(|d| instant_after(now, d));
        Self {
            id,
            job_type,
            payload,
            priority,
            status: if next_retry_at.is_some() {
                JobStatus::Delayed
            } else {
                JobStatus::Waiting
            },
            attempts: 0,
            max_attempts: max_attempts.max(1),
            created_at: now,
            started_at: None,
            completed_at: None,
            next_retry_at,
            last_error: None,
            lease: None,
            result: None,
            sequence: 0,
            history: Vec::new(),
        }
    }

    /// WAITING, or DELAYED with `next_retry_at` reached.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            JobStatus::Waiting => true,
            JobStatus::Delayed => self.next_retry_at.is_none_or(|at| at <= now),
            _ => false,
        }
    }

    /// Sort key among claimable jobs: priority, then enqueue order.
    pub fn claim_order(&self) -> (u8, DateTime<Utc>, u64) {
        (self.priority.rank(), self.created_at, self.sequence)
    }

    pub fn lease_holder(&self) -> Option<&WorkerId> {
        self.lease.as_ref().map(|l| &l.worker_id)
    }

    /// Mark job as claimed by `worker_id`.
    pub fn claim(&mut self, worker_id: WorkerId, lease_duration: Duration, now: DateTime<Utc>) {
        self.status = JobStatus::Active;
        self.attempts += 1;
        self.started_at = Some(now);
        self.next_retry_at = None;
        self.lease = Some(Lease {
            worker_id,
            expires_at: instant_after(now, lease_duration),
        });
    }

    fn record_attempt(&mut self, success: bool, error: Option<String>, now: DateTime<Utc>) {
        let started_at = self.started_at.unwrap_or(now);
        self.history.push(JobAttemptRecord {
            attempt: self.attempts,
            worker_id: self.lease.take().map(|l| l.worker_id),
            started_at,
            finished_at: now,
            success,
            error,
            duration_ms: (now - started_at).num_milliseconds().max(0) as u64,
        });
    }

    /// Mark job as completed.
    pub fn complete(&mut self, result: serde_json::Value, now: DateTime<Utc>) {
        self.record_attempt(true, None, now);
        self.status = JobStatus::Completed;
        self.completed_at = Some(now);
        self.result = Some(result);
    }

    /// Record a failed attempt and pick the next status.
    ///
    /// Retryable failures with attempts left become DELAYED with
    /// `next_retry_at = now + backoff(attempts)`; everything else is FAILED.
    pub fn fail(
        &mut self,
        error: impl Into<String>,
        retryable: bool,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> JobStatus {
        let error = error.into();
        self.record_attempt(false, Some(error.clone()), now);
        self.last_error = Some(error);

        if retryable && self.attempts < self.max_attempts {
            self.status = JobStatus::Delayed;
            self.next_retry_at = Some(instant_after(now, policy.delay_for_attempt(self.attempts)));
        } else {
            self.status = JobStatus::Failed;
            self.completed_at = Some(now);
            self.next_retry_at = None;
        }
        self.status
    }
}
