//! Orchestrator configuration, loaded from environment variables.

use std::time::Duration;

use jobforge_core::{BackoffStrategy, RetryPolicy};

use crate::queue::QueueOptions;

/// Headroom of the queue expiry over a full batch of handler timeouts.
const EXPIRY_MARGIN: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
}

/// Runtime settings for pollers, retries and the maintenance sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestratorConfig {
    /// Messages fetched per poll
    pub batch_size: usize,
    /// Sleep between polls that found nothing
    pub poll_interval: Duration,
    /// Deadline for a single handler invocation
    pub job_timeout: Duration,
    pub retry: RetryPolicy,
    pub stuck_threshold: Duration,
    pub maintenance_interval: Duration,
    /// Minimum age of a `Pending` record before it is checked for a missing
    /// queue delivery
    pub orphan_grace: Duration,
    /// Records expire this long after creation
    pub retention: Duration,
    /// Queue-side expiry of an active delivery. Must exceed
    /// `batch_size * job_timeout`; a batch runs one job at a time.
    pub queue_expire_in: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        let batch_size = 5;
        let job_timeout = Duration::from_secs(600);
        Self {
            batch_size,
            poll_interval: Duration::from_secs(2),
            job_timeout,
            retry: RetryPolicy::default(),
            stuck_threshold: Duration::from_secs(30 * 60),
            maintenance_interval: Duration::from_secs(60),
            orphan_grace: Duration::from_secs(300),
            retention: Duration::from_secs(24 * 60 * 60),
            queue_expire_in: default_expire_in(batch_size, job_timeout),
        }
    }
}

impl OrchestratorConfig {
    /// Read settings from the process environment; unset keys keep defaults,
    /// except the queue expiry, which follows batch size and timeout.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read settings through `lookup` (key -> value).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let secs = |d: Duration| d.as_secs();

        let batch_size: usize = parse(&lookup, "JOB_BATCH_SIZE", defaults.batch_size)?;
        if batch_size == 0 {
            return Err(invalid("JOB_BATCH_SIZE", "0"));
        }
        let max_attempts: u32 = parse(&lookup, "JOB_RETRY_LIMIT", defaults.retry.max_attempts)?;
        if max_attempts == 0 {
            return Err(invalid("JOB_RETRY_LIMIT", "0"));
        }

        let retry_delay = parse(&lookup, "JOB_RETRY_DELAY_SECS", secs(defaults.retry.base_delay))?;
        let backoff: bool = parse(&lookup, "JOB_RETRY_BACKOFF", true)?;
        let retry = RetryPolicy {
            max_attempts,
            base_delay: Duration::from_secs(retry_delay),
            strategy: if backoff {
                BackoffStrategy::Exponential
            } else {
                BackoffStrategy::Fixed
            },
            ..defaults.retry
        };

        let stuck_minutes = parse(
            &lookup,
            "JOB_STUCK_THRESHOLD_MINUTES",
            secs(defaults.stuck_threshold) / 60,
        )?;
        let retention_hours = parse(
            &lookup,
            "JOB_RETENTION_HOURS",
            secs(defaults.retention) / 3600,
        )?;

        let job_timeout = Duration::from_secs(parse(
            &lookup,
            "JOB_TIMEOUT_SECS",
            secs(defaults.job_timeout),
        )?);
        let maintenance_secs: u64 = parse(
            &lookup,
            "JOB_MAINTENANCE_INTERVAL_SECS",
            secs(defaults.maintenance_interval),
        )?;
        if maintenance_secs == 0 {
            return Err(invalid("JOB_MAINTENANCE_INTERVAL_SECS", "0"));
        }

        let batch_budget = batch_window(batch_size, job_timeout);
        let queue_expire_in = match lookup("JOB_QUEUE_EXPIRE_SECS") {
            None => default_expire_in(batch_size, job_timeout),
            Some(raw) => {
                let expire_secs: u64 = raw
                    .trim()
                    .parse()
                    .map_err(|_| invalid("JOB_QUEUE_EXPIRE_SECS", &raw))?;
                let expire_in = Duration::from_secs(expire_secs);
                if expire_in <= batch_budget {
                    return Err(invalid("JOB_QUEUE_EXPIRE_SECS", &raw));
                }
                expire_in
            }
        };

        Ok(Self {
            batch_size,
            poll_interval: Duration::from_secs(parse(
                &lookup,
                "JOB_POLL_INTERVAL_SECS",
                secs(defaults.poll_interval),
            )?),
            job_timeout,
            retry,
            stuck_threshold: Duration::from_secs(stuck_minutes.saturating_mul(60)),
            maintenance_interval: Duration::from_secs(maintenance_secs),
            orphan_grace: Duration::from_secs(parse(
                &lookup,
                "JOB_ORPHAN_GRACE_SECS",
                secs(defaults.orphan_grace),
            )?),
            retention: Duration::from_secs(retention_hours.saturating_mul(3600)),
            queue_expire_in,
        })
    }

    /// Queue options matching this configuration.
    pub fn queue_options(&self) -> QueueOptions {
        QueueOptions {
            retry_limit: self.retry.max_attempts,
            backoff: self.retry.clone(),
            default_expire_in: self.queue_expire_in,
        }
    }
}

/// Longest a delivery can stay active: every job of a batch runs to its
/// timeout, one after another.
fn batch_window(batch_size: usize, job_timeout: Duration) -> Duration {
    job_timeout.saturating_mul(u32::try_from(batch_size).unwrap_or(u32::MAX))
}

fn default_expire_in(batch_size: usize, job_timeout: Duration) -> Duration {
    batch_window(batch_size, job_timeout).saturating_add(EXPIRY_MARGIN)
}

fn parse<F, T>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|_| invalid(key, &raw)),
    }
}

fn invalid(key: &'static str, value: &str) -> ConfigError {
    ConfigError::Invalid {
        key,
        value: value.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_unset() {
        let config = OrchestratorConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config, OrchestratorConfig::default());
        assert_eq!(config.batch_size, 5);
        assert_eq!(config.stuck_threshold, Duration::from_secs(1800));
        assert_eq!(config.retry.max_attempts, 3);
    }

    #[test]
    fn reads_overrides() {
        let config = OrchestratorConfig::from_lookup(lookup(&[
            ("JOB_BATCH_SIZE", "10"),
            ("JOB_TIMEOUT_SECS", "30"),
            ("JOB_RETRY_LIMIT", "5"),
            ("JOB_RETRY_DELAY_SECS", "1"),
            ("JOB_RETRY_BACKOFF", "false"),
            ("JOB_STUCK_THRESHOLD_MINUTES", "2"),
        ]))
        .unwrap();

        assert_eq!(config.batch_size, 10);
        assert_eq!(config.job_timeout, Duration::from_secs(30));
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.base_delay, Duration::from_secs(1));
        assert_eq!(config.retry.strategy, BackoffStrategy::Fixed);
        assert_eq!(config.stuck_threshold, Duration::from_secs(120));

        let queue = config.queue_options();
        assert_eq!(queue.retry_limit, 5);
        assert_eq!(queue.default_expire_in, Duration::from_secs(10 * 30 + 300));
    }

    #[test]
    fn rejects_garbage() {
        let err = OrchestratorConfig::from_lookup(lookup(&[("JOB_POLL_INTERVAL_SECS", "soon")]))
            .unwrap_err();
        assert_eq!(
            err,
            ConfigError::Invalid {
                key: "JOB_POLL_INTERVAL_SECS",
                value: "soon".to_string()
            }
        );
    }

    #[test]
    fn rejects_zero_batch() {
        assert!(OrchestratorConfig::from_lookup(lookup(&[("JOB_BATCH_SIZE", "0")])).is_err());
    }

    #[test]
    fn default_expiry_outlasts_a_full_batch() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.queue_expire_in, Duration::from_secs(5 * 600 + 300));
        assert!(config.queue_expire_in > config.job_timeout * config.batch_size as u32);
    }

    #[test]
    fn rejects_expiry_shorter_than_batch() {
        // 5 jobs x 600s run back to back after one fetch
        let err = OrchestratorConfig::from_lookup(lookup(&[("JOB_QUEUE_EXPIRE_SECS", "900")]))
            .unwrap_err();
        assert_eq!(
            err,
            ConfigError::Invalid {
                key: "JOB_QUEUE_EXPIRE_SECS",
                value: "900".to_string()
            }
        );

        let exact = lookup(&[
            ("JOB_BATCH_SIZE", "2"),
            ("JOB_TIMEOUT_SECS", "60"),
            ("JOB_QUEUE_EXPIRE_SECS", "120"),
        ]);
        assert!(OrchestratorConfig::from_lookup(exact).is_err());

        let config = OrchestratorConfig::from_lookup(lookup(&[
            ("JOB_BATCH_SIZE", "2"),
            ("JOB_TIMEOUT_SECS", "60"),
            ("JOB_QUEUE_EXPIRE_SECS", "121"),
        ]))
        .unwrap();
        assert_eq!(config.queue_expire_in, Duration::from_secs(121));
    }

    #[test]
    fn rejects_zero_maintenance_interval() {
        let vars = lookup(&[("JOB_MAINTENANCE_INTERVAL_SECS", "0")]);
        let err = OrchestratorConfig::from_lookup(vars).unwrap_err();
        assert_eq!(
            err,
            ConfigError::Invalid {
                key: "JOB_MAINTENANCE_INTERVAL_SECS",
                value: "0".to_string()
            }
        );
    }
}
