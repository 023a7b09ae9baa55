//! Typed configuration for queues.
//!
//! `Default` gives the production constants (lease 15s, renew 10s, poll 5s).
//! `from_env` reads `WEFT_*` overrides once at startup and fails fast on
//! values it cannot parse.

use std::str::FromStr;
use std::time::Duration;

use crate::domain::RetryPolicy;
use crate::domain::errors::{Result, WeftError};

#[derive(Debug, Clone, PartialEq)]
pub struct QueueConfig {
    /// How long a lease lasts after acquisition or renewal.
    pub lease_timeout: Duration,

    /// How often a running handler's lease is refreshed. Must stay below `lease_timeout`.
    pub renew_interval: Duration,

    /// Fallback wait when no wake-up notification arrives.
    pub poll_interval: Duration,

    /// Candidates read from each index range during discovery.
    pub discovery_limit: usize,

    /// Rows examined per reclaim sweep.
    pub reclaim_limit: usize,

    /// `None` = retry forever.
    pub max_failures: Option<u32>,

    pub retry: RetryPolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            lease_timeout: Duration::from_secs(15),
            renew_interval: Duration::from_secs(10),
            poll_interval: Duration::from_secs(5),
            discovery_limit: 10,
            reclaim_limit: 100,
            max_failures: Some(5),
            retry: RetryPolicy::default(),
        }
    }
}

impl QueueConfig {
    /// Load overrides from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load overrides through `lookup` (environment, file, test map...).
    ///
    /// | key | unit |
    /// |---|---|
    /// | `WEFT_LEASE_TIMEOUT_MS` | ms |
    /// | `WEFT_RENEW_INTERVAL_MS` | ms |
    /// | `WEFT_POLL_INTERVAL_MS` | ms |
    /// | `WEFT_DISCOVERY_LIMIT` | rows |
    /// | `WEFT_MAX_FAILURES` | count, negative = unlimited |
    /// | `WEFT_RETRY_BASE_MS` / `WEFT_RETRY_MAX_MS` | ms |
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        if let Some(ms) = parse::<u64>(&lookup, "WEFT_LEASE_TIMEOUT_MS")? {
            config.lease_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse::<u64>(&lookup, "WEFT_RENEW_INTERVAL_MS")? {
            config.renew_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = parse::<u64>(&lookup, "WEFT_POLL_INTERVAL_MS")? {
            config.poll_interval = Duration::from_millis(ms);
        }
        if let Some(n) = parse::<usize>(&lookup, "WEFT_DISCOVERY_LIMIT")? {
            config.discovery_limit = n;
        }
        if let Some(n) = parse::<i64>(&lookup, "WEFT_MAX_FAILURES")? {
            config.max_failures = u32::try_from(n).ok();
        }
        if let Some(ms) = parse::<u64>(&lookup, "WEFT_RETRY_BASE_MS")? {
            config.retry.base_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = parse::<u64>(&lookup, "WEFT_RETRY_MAX_MS")? {
            config.retry.max_delay = Duration::from_millis(ms);
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.lease_timeout.is_zero() || self.renew_interval.is_zero() || self.poll_interval.is_zero() {
            return Err(WeftError::Config(
                "lease timeout, renew interval and poll interval must be positive".to_string(),
            ));
        }
        if self.renew_interval >= self.lease_timeout {
            return Err(WeftError::Config(format!(
                "renew interval {:?} must be shorter than lease timeout {:?}",
                self.renew_interval, self.lease_timeout
            )));
        }
        if self.discovery_limit == 0 || self.reclaim_limit == 0 {
            return Err(WeftError::Config("scan limits must be positive".to_string()));
        }
        if self.retry.base_delay > self.retry.max_delay {
            return Err(WeftError::Config(format!(
                "retry base delay {:?} exceeds max delay {:?}",
                self.retry.base_delay, self.retry.max_delay
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DelayedConfig {
    /// How often the elected driver looks for due rows.
    pub tick_interval: Duration,

    /// Rows handled per tick.
    pub batch_size: usize,

    /// Leadership lease. Renewed every tick, so keep it above `tick_interval`.
    pub lock_ttl: Duration,

    /// Deployment version of this process (a newer version takes the lock over).
    pub lock_version: u32,
}

impl Default for DelayedConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(3),
            batch_size: 10,
            lock_ttl: Duration::from_secs(15),
            lock_version: 1,
        }
    }
}

impl DelayedConfig {
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 || self.tick_interval.is_zero() {
            return Err(WeftError::Config("delayed batch size and tick interval must be positive".to_string()));
        }
        if self.lock_ttl <= self.tick_interval {
            return Err(WeftError::Config(format!(
                "lock ttl {:?} must exceed tick interval {:?}",
                self.lock_ttl, self.tick_interval
            )));
        }
        Ok(())
    }
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| WeftError::Config(format!("{key}={raw:?}: {e}"))),
    }
}
