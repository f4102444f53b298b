//! Configuration types.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;

/// Runtime configuration for the foreman process.
#[derive(Debug, Clone)]
pub struct ForemanConfig {
    /// Path of the libSQL database file.
    pub db_path: PathBuf,
    /// Root under which ephemeral task/chat working directories are created.
    pub work_dir: PathBuf,
    /// How often the task and chat processors poll for queued work.
    pub poll_interval: Duration,
    /// How often every CLI is re-checked.
    pub health_interval: Duration,
    /// Maximum time a health check may run before it is killed.
    pub health_timeout: Duration,
    /// How often the cleanup job runs.
    pub cleanup_interval: Duration,
    /// Terminal queue items older than this are deleted by cleanup.
    pub queue_retention: chrono::Duration,
    /// Processing settings shared by the task and chat processors.
    pub processor: ProcessorConfig,
    /// Directory for rolling log files (stderr only when unset).
    pub log_dir: Option<PathBuf>,
}

/// Settings for queue processing and the agent loop.
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Safety ceiling on agent passes per queue item.
    pub max_passes: u32,
    /// Per-invocation timeout enforced by the CLI adapter (`None` = unbounded).
    pub invocation_timeout: Option<Duration>,
    /// Consecutive failed items after which a task stops re-queuing (0 = unlimited).
    pub max_consecutive_failures: u32,
    /// Root under which ephemeral working directories are created.
    pub work_dir: PathBuf,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            max_passes: 100,
            invocation_timeout: Some(Duration::from_secs(3600)), // 1 hour
            max_consecutive_failures: 5,
            work_dir: default_work_dir(),
        }
    }
}

impl Default for ForemanConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/foreman.db"),
            work_dir: default_work_dir(),
            poll_interval: Duration::from_millis(1000),
            health_interval: Duration::from_secs(300), // 5 minutes
            health_timeout: Duration::from_secs(60),
            cleanup_interval: Duration::from_secs(86_400), // 24 hours
            queue_retention: chrono::Duration::days(7),
            processor: ProcessorConfig::default(),
            log_dir: None,
        }
    }
}

impl ForemanConfig {
    /// Build the configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let work_dir = env_path("FOREMAN_WORK_DIR").unwrap_or(defaults.work_dir);
        let invocation_timeout = match env_parse::<u64>("FOREMAN_INVOCATION_TIMEOUT_SECS")? {
            Some(0) => None,
            Some(secs) => Some(Duration::from_secs(secs)),
            None => defaults.processor.invocation_timeout,
        };

        let processor = ProcessorConfig {
            max_passes: env_parse("FOREMAN_MAX_AGENT_PASSES")?
                .unwrap_or(defaults.processor.max_passes),
            invocation_timeout,
            max_consecutive_failures: env_parse("FOREMAN_MAX_CONSECUTIVE_FAILURES")?
                .unwrap_or(defaults.processor.max_consecutive_failures),
            work_dir: work_dir.clone(),
        };

        let poll_ms: u64 = env_parse("QUEUE_POLL_INTERVAL_MS")?.unwrap_or(1000);

        let config = Self {
            db_path: env_path("FOREMAN_DB_PATH").unwrap_or(defaults.db_path),
            work_dir,
            poll_interval: Duration::from_millis(poll_ms),
            health_interval: env_parse("FOREMAN_HEALTH_INTERVAL_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.health_interval),
            health_timeout: env_parse("FOREMAN_HEALTH_TIMEOUT_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.health_timeout),
            cleanup_interval: env_parse("FOREMAN_CLEANUP_INTERVAL_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.cleanup_interval),
            queue_retention: env_parse::<i64>("FOREMAN_QUEUE_RETENTION_DAYS")?
                .map(chrono::Duration::days)
                .unwrap_or(defaults.queue_retention),
            processor,
            log_dir: env_path("FOREMAN_LOG_DIR"),
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject values the scheduler cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.processor.max_passes == 0 {
            return Err(invalid("FOREMAN_MAX_AGENT_PASSES", "must be at least 1"));
        }
        // tokio::time::interval panics on a zero period.
        for (key, interval) in [
            ("QUEUE_POLL_INTERVAL_MS", self.poll_interval),
            ("FOREMAN_HEALTH_INTERVAL_SECS", self.health_interval),
            ("FOREMAN_CLEANUP_INTERVAL_SECS", self.cleanup_interval),
        ] {
            if interval.is_zero() {
                return Err(invalid(key, "must be greater than zero"));
            }
        }
        Ok(())
    }
}

fn invalid(key: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.to_string(),
    }
}

fn default_work_dir() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(".agent-foreman/work")
}

fn env_path(key: &str) -> Option<PathBuf> {
    std::env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .map(PathBuf::from)
}

fn env_parse<T>(key: &str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => {
            raw.trim()
                .parse()
                .map(Some)
                .map_err(|e: T::Err| ConfigError::InvalidValue {
                    key: key.to_string(),
                    message: e.to_string(),
                })
        }
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = ForemanConfig::default();
        assert_eq!(config.poll_interval, Duration::from_millis(1000));
        assert_eq!(config.health_interval, Duration::from_secs(300));
        assert_eq!(config.cleanup_interval, Duration::from_secs(86_400));
        assert_eq!(config.processor.max_passes, 100);
        assert_eq!(config.processor.max_consecutive_failures, 5);
    }

    #[test]
    fn zero_intervals_are_rejected() {
        assert!(ForemanConfig::default().validate().is_ok());

        for (key, config) in [
            (
                "QUEUE_POLL_INTERVAL_MS",
                ForemanConfig {
                    poll_interval: Duration::ZERO,
                    ..ForemanConfig::default()
                },
            ),
            (
                "FOREMAN_HEALTH_INTERVAL_SECS",
                ForemanConfig {
                    health_interval: Duration::ZERO,
                    ..ForemanConfig::default()
                },
            ),
            (
                "FOREMAN_CLEANUP_INTERVAL_SECS",
                ForemanConfig {
                    cleanup_interval: Duration::ZERO,
                    ..ForemanConfig::default()
                },
            ),
        ] {
            match config.validate() {
                Err(ConfigError::InvalidValue { key: got, .. }) => assert_eq!(got, key),
                other => panic!("expected {key} to be rejected, got {other:?}"),
            }
        }
    }

    #[test]
    fn zero_max_passes_is_rejected() {
        let mut config = ForemanConfig::default();
        config.processor.max_passes = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn unset_env_var_parses_to_none() {
        let value: Option<u64> = env_parse("FOREMAN_TEST_SURELY_UNSET_VAR").unwrap();
        assert!(value.is_none());
    }
}
