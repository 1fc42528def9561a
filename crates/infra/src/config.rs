//! Daemon configuration.
//!
//! Every daemon starts from its queue preset; a TOML file can override any
//! field, and `DATABASE_URL` from the environment wins over the file.
//!
//! ```toml
//! [store]
//! database_url = "postgres://flightwork@localhost/tracking"
//! max_connections = 4
//!
//! [scheduler]
//! batch_size = 100
//! tier_cadences = [1, 2, 5, 10, 20]
//!
//! [retry]
//! max_retries = 5
//! strategy = "exponential"
//!
//! [controller]
//! interval_secs = 30
//!
//! [logging]
//! format = "pretty"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use flightwork_observability::LogFormat;

use crate::daemons::QueueKind;
use crate::queue::{BackoffStrategy, RetryPolicy, validate_identifier};
use crate::scheduler::{BacklogClassifier, ControllerConfig, LeaseRecovery, RunnerConfig, TierSchedule};

/// Environment variable holding the connection string.
pub const DATABASE_URL_ENV: &str = "DATABASE_URL";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("no database url: set DATABASE_URL or [store].database_url")]
    MissingDatabaseUrl,
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Raw file contents. Absent fields fall back to the queue preset.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DaemonSettings {
    pub store: StoreSettings,
    pub scheduler: SchedulerSettings,
    pub retry: RetrySettings,
    pub controller: ControllerSettings,
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreSettings {
    pub database_url: Option<String>,
    pub table: Option<String>,
    pub procedure: Option<String>,
    pub max_connections: Option<u32>,
    pub acquire_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SchedulerSettings {
    pub batch_size: Option<usize>,
    pub max_iterations: Option<u32>,
    pub backlog_threshold: Option<u64>,
    pub backlog_multiplier: Option<u32>,
    pub lease_timeout_secs: Option<u64>,
    pub tier_cadences: Option<Vec<u32>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetrySettings {
    pub max_retries: Option<u32>,
    pub strategy: Option<BackoffStrategy>,
    pub base_delay_ms: Option<u64>,
    pub max_delay_ms: Option<u64>,
    pub min_delay_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ControllerSettings {
    pub interval_secs: Option<u64>,
    pub idle_factor: Option<u32>,
    pub backlog_divisor: Option<u32>,
    pub min_interval_secs: Option<u64>,
    pub startup_stagger_secs: Option<u64>,
    pub stats_every_cycles: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingSettings {
    pub format: Option<LogFormat>,
}

/// Fully resolved configuration for one daemon.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub queue: QueueKind,
    pub database_url: String,
    pub table: String,
    pub procedure: String,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
    pub runner: RunnerConfig,
    pub retry: RetryPolicy,
    pub tiers: TierSchedule,
    pub controller: ControllerConfig,
    pub log_format: LogFormat,
}

impl DaemonSettings {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Overlay these settings on the preset of `queue`.
    ///
    /// `env_database_url` takes precedence over `[store].database_url`.
    pub fn resolve(
        &self,
        queue: QueueKind,
        env_database_url: Option<String>,
    ) -> Result<ResolvedConfig, ConfigError> {
        let preset = queue.preset();

        let database_url = env_database_url
            .filter(|url| !url.trim().is_empty())
            .or_else(|| self.store.database_url.clone())
            .filter(|url| !url.trim().is_empty())
            .ok_or(ConfigError::MissingDatabaseUrl)?;

        let table = self.store.table.clone().unwrap_or_else(|| preset.table.to_string());
        let procedure = self
            .store
            .procedure
            .clone()
            .unwrap_or_else(|| preset.procedure.to_string());
        validate_identifier(&table).map_err(|e| ConfigError::Invalid(e.to_string()))?;
        validate_identifier(&procedure).map_err(|e| ConfigError::Invalid(e.to_string()))?;

        let max_connections = positive("store.max_connections", self.store.max_connections.unwrap_or(4))?;
        let acquire_timeout =
            Duration::from_secs(self.store.acquire_timeout_secs.unwrap_or(10).max(1));

        let s = &self.scheduler;
        let batch_size = s.batch_size.unwrap_or(preset.batch_size);
        if batch_size == 0 {
            return Err(ConfigError::Invalid("scheduler.batch_size must be positive".into()));
        }
        let max_iterations = positive("scheduler.max_iterations", s.max_iterations.unwrap_or(preset.max_iterations))?;
        let multiplier = positive(
            "scheduler.backlog_multiplier",
            s.backlog_multiplier.unwrap_or(preset.backlog_multiplier),
        )?;
        let lease_timeout = s
            .lease_timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(preset.lease_timeout);
        if lease_timeout.is_zero() {
            return Err(ConfigError::Invalid("scheduler.lease_timeout_secs must be positive".into()));
        }
        let cadences = s.tier_cadences.clone().unwrap_or_else(|| preset.tier_cadences.clone());
        if cadences.contains(&0) {
            return Err(ConfigError::Invalid("scheduler.tier_cadences must be positive".into()));
        }

        let runner = RunnerConfig {
            batch_size,
            max_iterations,
            backlog: BacklogClassifier::new(
                s.backlog_threshold.unwrap_or(preset.backlog_threshold),
                multiplier,
            ),
            lease: LeaseRecovery::new(lease_timeout),
        };

        let r = &self.retry;
        let defaults = RetryPolicy::default();
        let retry = RetryPolicy {
            max_retries: r.max_retries.unwrap_or(preset.max_retries),
            base_delay: r.base_delay_ms.map(Duration::from_millis).unwrap_or(defaults.base_delay),
            max_delay: r.max_delay_ms.map(Duration::from_millis).unwrap_or(defaults.max_delay),
            min_delay: r.min_delay_ms.map(Duration::from_millis).unwrap_or(defaults.min_delay),
            strategy: r.strategy.unwrap_or(defaults.strategy),
        };
        if retry.max_delay < retry.min_delay {
            return Err(ConfigError::Invalid("retry.max_delay_ms is below retry.min_delay_ms".into()));
        }
        if retry.base_delay.max(retry.max_delay).max(retry.min_delay) > MAX_RETRY_DELAY {
            return Err(ConfigError::Invalid(format!(
                "retry delays must not exceed {} ms",
                MAX_RETRY_DELAY.as_millis()
            )));
        }

        let c = &self.controller;
        let base = ControllerConfig::default();
        let controller = ControllerConfig {
            interval: c.interval_secs.map(Duration::from_secs).unwrap_or(preset.interval),
            idle_factor: positive("controller.idle_factor", c.idle_factor.unwrap_or(base.idle_factor))?,
            backlog_divisor: positive(
                "controller.backlog_divisor",
                c.backlog_divisor.unwrap_or(base.backlog_divisor),
            )?,
            min_interval: c.min_interval_secs.map(Duration::from_secs).unwrap_or(base.min_interval),
            startup_stagger: c
                .startup_stagger_secs
                .map(Duration::from_secs)
                .unwrap_or(preset.startup_stagger),
            stats_every_cycles: c.stats_every_cycles.unwrap_or(base.stats_every_cycles),
        };
        if controller.interval.is_zero() {
            return Err(ConfigError::Invalid("controller.interval_secs must be positive".into()));
        }

        Ok(ResolvedConfig {
            queue,
            database_url,
            table,
            procedure,
            max_connections,
            acquire_timeout,
            runner,
            retry,
            tiers: TierSchedule::new(cadences),
            controller,
            log_format: self.logging.format.unwrap_or_default(),
        })
    }
}

/// Upper bound on any configured retry delay.
const MAX_RETRY_DELAY: Duration = Duration::from_secs(7 * 24 * 60 * 60);

fn positive(field: &str, value: u32) -> Result<u32, ConfigError> {
    if value == 0 {
        Err(ConfigError::Invalid(format!("{field} must be positive")))
    } else {
        Ok(value)
    }
}
