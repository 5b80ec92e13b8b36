//! Queue configuration loaded from `DEVPULSE_*` environment variables.

use std::str::FromStr;
use std::time::Duration;

use crate::jobs::{BackoffStrategy, RetryPolicy, WorkerPoolConfig};
use crate::scheduler::RecurringScheduler;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?} ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Runtime knobs of the job pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueConfig {
    pub background_jobs_enabled: bool,
    pub workers: usize,
    pub poll_interval: Duration,
    pub lease_duration: Duration,
    pub retry: RetryPolicy,
    pub team_metrics_interval: Duration,
    pub team_metrics_on_startup: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            background_jobs_enabled: true,
            workers: 4,
            poll_interval: Duration::from_millis(100),
            lease_duration: Duration::from_secs(300),
            retry: RetryPolicy::default(),
            team_metrics_interval: Duration::from_secs(24 * 60 * 60),
            team_metrics_on_startup: false,
        }
    }
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) if raw.trim().is_empty() => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            key,
            value: raw.clone(),
            reason: e.to_string(),
        }),
    }
}

fn positive(key: &'static str, value: u64) -> Result<u64, ConfigError> {
    if value == 0 {
        return Err(ConfigError::Invalid {
            key,
            value: value.to_string(),
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(value)
}

impl QueueConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key/value source; unset keys keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let workers = positive(
            "DEVPULSE_WORKERS",
            parse(&lookup, "DEVPULSE_WORKERS", defaults.workers as u64)?,
        )?;
        let poll_ms = positive(
            "DEVPULSE_POLL_INTERVAL_MS",
            parse(&lookup, "DEVPULSE_POLL_INTERVAL_MS", 100u64)?,
        )?;
        let lease_secs = positive("DEVPULSE_LEASE_SECS", parse(&lookup, "DEVPULSE_LEASE_SECS", 300u64)?)?;
        let max_attempts = positive(
            "DEVPULSE_MAX_ATTEMPTS",
            parse(&lookup, "DEVPULSE_MAX_ATTEMPTS", u64::from(defaults.retry.max_attempts))?,
        )?;
        let base_ms: u64 = parse(&lookup, "DEVPULSE_RETRY_BASE_MS", 2_000u64)?;
        let max_ms: u64 = parse(&lookup, "DEVPULSE_RETRY_MAX_MS", 300_000u64)?;
        let strategy: BackoffStrategy =
            parse(&lookup, "DEVPULSE_RETRY_STRATEGY", BackoffStrategy::Exponential)?;
        let interval_secs = positive(
            "DEVPULSE_TEAM_METRICS_INTERVAL_SECS",
            parse(&lookup, "DEVPULSE_TEAM_METRICS_INTERVAL_SECS", 86_400u64)?,
        )?;

        Ok(Self {
            background_jobs_enabled: parse(&lookup, "DEVPULSE_BACKGROUND_JOBS", true)?,
            workers: workers as usize,
            poll_interval: Duration::from_millis(poll_ms),
            lease_duration: Duration::from_secs(lease_secs),
            retry: RetryPolicy {
                max_attempts: u32::try_from(max_attempts).unwrap_or(u32::MAX),
                base_delay: Duration::from_millis(base_ms),
                max_delay: Duration::from_millis(max_ms.max(base_ms)),
                strategy,
            },
            team_metrics_interval: Duration::from_secs(interval_secs),
            team_metrics_on_startup: parse(&lookup, "DEVPULSE_TEAM_METRICS_ON_STARTUP", false)?,
        })
    }

    pub fn pool_config(&self) -> WorkerPoolConfig {
        WorkerPoolConfig::default()
            .with_workers(self.workers)
            .with_poll_interval(self.poll_interval)
            .with_reap_interval((self.lease_duration / 4).clamp(Duration::from_millis(100), Duration::from_secs(5)))
    }

    pub fn scheduler(&self) -> RecurringScheduler {
        RecurringScheduler {
            interval: self.team_metrics_interval,
            run_on_startup: self.team_metrics_on_startup,
            ..RecurringScheduler::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<QueueConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        QueueConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_when_unset() {
        assert_eq!(config(&[]).unwrap(), QueueConfig::default());
    }

    #[test]
    fn reads_overrides() {
        let cfg = config(&[
            ("DEVPULSE_BACKGROUND_JOBS", "false"),
            ("DEVPULSE_WORKERS", "8"),
            ("DEVPULSE_MAX_ATTEMPTS", "5"),
            ("DEVPULSE_RETRY_STRATEGY", "linear"),
            ("DEVPULSE_RETRY_BASE_MS", "500"),
            ("DEVPULSE_TEAM_METRICS_ON_STARTUP", "true"),
        ])
        .unwrap();

        assert!(!cfg.background_jobs_enabled);
        assert_eq!(cfg.workers, 8);
        assert_eq!(cfg.retry.max_attempts, 5);
        assert_eq!(cfg.retry.strategy, BackoffStrategy::Linear);
        assert_eq!(cfg.retry.delay_for_attempt(2), Duration::from_secs(1));
        assert!(cfg.scheduler().run_on_startup);
        assert_eq!(cfg.pool_config().workers, 8);
    }

    #[test]
    fn malformed_values_are_errors() {
        let err = config(&[("DEVPULSE_WORKERS", "many")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "DEVPULSE_WORKERS", .. }));

        assert!(config(&[("DEVPULSE_WORKERS", "0")]).is_err());
        assert!(config(&[("DEVPULSE_RETRY_STRATEGY", "random")]).is_err());
        assert!(config(&[("DEVPULSE_BACKGROUND_JOBS", "maybe")]).is_err());
    }
}
