//! Node configuration.
//!
//! Loaded from an optional TOML file, then overridden by `SCHEDULER__*` environment variables
//! (`SCHEDULER__LOCK_TIMEOUT_SECS=5`). Every key has a default, so an empty source is valid.
//!
//! The safety-net TTL of a scheduled task must outlive the scanner's lease: an unacknowledged task
//! has to be demoted by the scanner before the store is allowed to evict it.

use crate::error::{Result, SchedulerError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const ENV_PREFIX: &str = "SCHEDULER";

/// Settings of one scheduler node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Wait for the distributed lock on a task or context before giving up.
    pub lock_timeout_secs: u64,
    /// Safety-net TTL of a freshly scheduled task, cleared once the runtime acknowledges it.
    /// Must exceed the lease deadline (see [`SchedulerConfig::lease_deadline`]).
    pub scheduled_ttl_secs: u64,
    /// TTL of terminal tasks.
    pub task_ttl_secs: u64,
    /// TTL of finished contexts.
    pub context_ttl_secs: u64,
    /// Delay between node start and the first reconciliation pass.
    pub scanner_initial_delay_secs: u64,
    /// Time between two reconciliation passes.
    pub scanner_period_secs: u64,
    /// Scan passes a scheduled task may stay unacknowledged before it is rescheduled.
    pub scheduled_lease_passes: i64,
    /// Period of the in-memory backend's TTL sweep.
    pub eviction_period_secs: u64,
    /// Default `tracing` filter, overridden by `RUST_LOG`.
    pub log_filter: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            lock_timeout_secs: 20,
            scheduled_ttl_secs: 600,
            task_ttl_secs: 300,
            context_ttl_secs: 300,
            scanner_initial_delay_secs: 15,
            scanner_period_secs: 30,
            scheduled_lease_passes: 5,
            eviction_period_secs: 1,
            log_filter: "info".to_string(),
        }
    }
}

impl SchedulerConfig {
    /// Loads the configuration from `path` (if given) and the environment.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(::config::File::with_name(path).required(true));
        }
        let config: Self = builder
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Parses a TOML document; used for embedded and test configurations.
    pub fn from_toml(toml: &str) -> Result<Self> {
        let config: Self = ::config::Config::builder()
            .add_source(::config::File::from_str(toml, ::config::FileFormat::Toml))
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("lock_timeout_secs", self.lock_timeout_secs),
            ("scheduled_ttl_secs", self.scheduled_ttl_secs),
            ("task_ttl_secs", self.task_ttl_secs),
            ("context_ttl_secs", self.context_ttl_secs),
            ("scanner_period_secs", self.scanner_period_secs),
            ("eviction_period_secs", self.eviction_period_secs),
        ];
        if let Some((key, _)) = positive.iter().find(|(_, value)| *value == 0) {
            return Err(SchedulerError::Config(format!("{key} must be greater than zero")));
        }
        if self.scheduled_lease_passes <= 0 {
            return Err(SchedulerError::Config(
                "scheduled_lease_passes must be greater than zero".to_string(),
            ));
        }
        let deadline = self.lease_deadline();
        if self.scheduled_ttl() <= deadline {
            return Err(SchedulerError::Config(format!(
                "scheduled_ttl_secs ({}) must exceed the scanner lease deadline ({}s)",
                self.scheduled_ttl_secs,
                deadline.as_secs()
            )));
        }
        Ok(())
    }

    /// Latest time after scheduling at which the scanner demotes an unacknowledged task.
    ///
    /// A task scheduled right after a pass waits one extra period before its first lease pass,
    /// hence `passes + 1` periods on top of the initial delay.
    pub fn lease_deadline(&self) -> Duration {
        let passes = u32::try_from(self.scheduled_lease_passes.max(0))
            .unwrap_or(u32::MAX)
            .saturating_add(1);
        self.scanner_initial_delay()
            .saturating_add(self.scanner_period().saturating_mul(passes))
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }

    pub fn scheduled_ttl(&self) -> Duration {
        Duration::from_secs(self.scheduled_ttl_secs)
    }

    pub fn task_ttl(&self) -> Duration {
        Duration::from_secs(self.task_ttl_secs)
    }

    pub fn context_ttl(&self) -> Duration {
        Duration::from_secs(self.context_ttl_secs)
    }

    pub fn scanner_initial_delay(&self) -> Duration {
        Duration::from_secs(self.scanner_initial_delay_secs)
    }

    pub fn scanner_period(&self) -> Duration {
        Duration::from_secs(self.scanner_period_secs)
    }

    pub fn eviction_period(&self) -> Duration {
        Duration::from_secs(self.eviction_period_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = SchedulerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.lock_timeout(), Duration::from_secs(20));
        assert_eq!(config.task_ttl(), Duration::from_secs(300));
    }

    #[test]
    fn test_default_safety_ttl_outlives_lease() {
        let config = SchedulerConfig::default();

        // 15s initial delay + 6 periods of 30s
        assert_eq!(config.lease_deadline(), Duration::from_secs(195));
        assert!(config.scheduled_ttl() > config.lease_deadline());
    }

    #[test]
    fn test_safety_ttl_shorter_than_lease_is_rejected() {
        let result = SchedulerConfig::from_toml("scheduled_ttl_secs = 60");
        assert!(matches!(result, Err(SchedulerError::Config(_))));

        let config = SchedulerConfig {
            scheduled_ttl_secs: 100,
            scanner_initial_delay_secs: 10,
            scanner_period_secs: 10,
            scheduled_lease_passes: 7,
            ..Default::default()
        };
        assert!(config.validate().is_ok());

        let config = SchedulerConfig {
            scheduled_lease_passes: 9,
            ..config
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = SchedulerConfig::from_toml("lock_timeout_secs = 5\nlog_filter = \"debug\"").unwrap();

        assert_eq!(config.lock_timeout_secs, 5);
        assert_eq!(config.log_filter, "debug");
        assert_eq!(config.scanner_period_secs, 30);
    }

    #[test]
    fn test_zero_values_are_rejected() {
        let result = SchedulerConfig::from_toml("scanner_period_secs = 0");
        assert!(matches!(result, Err(SchedulerError::Config(_))));

        let config = SchedulerConfig {
            scheduled_lease_passes: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let result = SchedulerConfig::load(Some("/nonexistent/scheduler-config"));
        assert!(matches!(result, Err(SchedulerError::Config(_))));
    }
}
