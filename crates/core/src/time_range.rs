//! Half-open time window used by every analytics computation.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};

/// A `[start, end)` window in UTC.
///
/// Compared by value; construction validates that `start < end`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawTimeRange")]
pub struct TimeRange {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

#[derive(Deserialize)]
struct RawTimeRange {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

impl TryFrom<RawTimeRange> for TimeRange {
    type Error = DomainError;

    fn try_from(raw: RawTimeRange) -> Result<Self, Self::Error> {
        TimeRange::new(raw.start, raw.end)
    }
}

impl TimeRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> DomainResult<Self> {
        if start >= end {
            return Err(DomainError::validation(format!(
                "time range start ({start}) must be before end ({end})"
            )));
        }
        Ok(Self { start, end })
    }

    /// The `days`-long window ending at `end`. Zero days is widened to one.
    pub fn last_days(end: DateTime<Utc>, days: u32) -> Self {
        let days = i64::from(days.max(1));
        Self {
            start: end - Duration::days(days),
            end,
        }
    }

    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    pub fn end(&self) -> DateTime<Utc> {
        self.end
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at >= self.start && at < self.end
    }

    /// Length in whole days, never less than one.
    pub fn days(&self) -> i64 {
        (self.end - self.start).num_days().max(1)
    }
}
