//! Application configuration structures.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};

/// Root application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Global kill switch; strategies refuse to start when set
    #[serde(default)]
    pub indexing_disabled: bool,

    /// Worker pool and queue settings
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Lock table settings
    #[serde(default)]
    pub locks: LockConfig,

    /// Rule file locations
    #[serde(default)]
    pub rules: RulesConfig,

    /// On-demand strategy settings
    #[serde(default)]
    pub on_demand: OnDemandConfig,

    /// Full-corpus sweep settings
    #[serde(default)]
    pub full_reindex: FullReindexConfig,

    /// Time-windowed strategy settings
    #[serde(default)]
    pub periodic: PeriodicConfig,

    /// Access rule change rechecks
    #[serde(default)]
    pub rule_recheck: RuleRecheckConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Load configuration or return default if loading fails.
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        Self::load(&path).unwrap_or_else(|e| {
            log::warn!(
                "Config load failed from {:?}: {}. Using defaults.",
                path.as_ref(),
                e
            );
            Self::default()
        })
    }

    /// Serialize the configuration back to TOML.
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Validate configuration values for basic sanity.
    pub fn validate(&self) -> Result<()> {
        let p = &self.pipeline;
        if p.filter_workers == 0 || p.transform_workers == 0 || p.index_workers == 0 {
            return Err(AppError::validation("pipeline worker counts must be > 0"));
        }
        if p.queue_capacity == 0 {
            return Err(AppError::validation("pipeline.queue_capacity must be > 0"));
        }
        if p.poll_interval_ms == 0 {
            return Err(AppError::validation("pipeline.poll_interval_ms must be > 0"));
        }
        if self.locks.owner.trim().is_empty() {
            return Err(AppError::validation("locks.owner is empty"));
        }
        if self.locks.ttl_ms == 0 {
            return Err(AppError::validation("locks.ttl_ms must be > 0"));
        }
        if self.locks.keepalive_ms >= self.locks.ttl_ms {
            return Err(AppError::validation(
                "locks.keepalive_ms must be shorter than locks.ttl_ms",
            ));
        }

        let f = &self.full_reindex;
        if f.batch_size == 0 {
            return Err(AppError::validation("full_reindex.batch_size must be > 0"));
        }
        if f.queue_limit == 0 {
            return Err(AppError::validation("full_reindex.queue_limit must be > 0"));
        }
        if f.modulo_divisor == 0 {
            return Err(AppError::validation(
                "full_reindex.modulo_divisor must be > 0",
            ));
        }
        if f.modulo_remainder >= f.modulo_divisor {
            return Err(AppError::validation(
                "full_reindex.modulo_remainder must be < modulo_divisor",
            ));
        }
        if let Some(max) = f.max_id {
            if f.min_id > max {
                return Err(AppError::validation("full_reindex.min_id exceeds max_id"));
            }
        }

        let w = &self.periodic;
        for (name, hour) in [("start_hour", w.start_hour), ("stop_hour", w.stop_hour)] {
            if hour > 23 {
                return Err(AppError::validation(format!(
                    "periodic.{} must be within 0..=23, got {}",
                    name, hour
                )));
            }
        }
        for (name, minute) in [
            ("start_minute", w.start_minute),
            ("stop_minute", w.stop_minute),
        ] {
            if minute > 59 {
                return Err(AppError::validation(format!(
                    "periodic.{} must be within 0..=59, got {}",
                    name, minute
                )));
            }
        }
        if w.batch_size == 0 {
            return Err(AppError::validation("periodic.batch_size must be > 0"));
        }

        let r = &self.rule_recheck;
        if r.schedule_hour > 23 || r.schedule_minute > 59 {
            return Err(AppError::validation(format!(
                "rule_recheck schedule {}:{:02} is not a time of day",
                r.schedule_hour, r.schedule_minute
            )));
        }
        if r.workers == 0 {
            return Err(AppError::validation("rule_recheck.workers must be > 0"));
        }
        Ok(())
    }
}

/// Worker pools, queue sizing and batch waits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "defaults::filter_workers")]
    pub filter_workers: usize,

    #[serde(default = "defaults::transform_workers")]
    pub transform_workers: usize,

    #[serde(default = "defaults::index_workers")]
    pub index_workers: usize,

    /// Capacity of each stage queue
    #[serde(default = "defaults::queue_capacity")]
    pub queue_capacity: usize,

    /// Upper bound between completion re-checks
    #[serde(default = "defaults::poll_interval")]
    pub poll_interval_ms: u64,

    /// A batch still running after this long is reported as stuck
    #[serde(default = "defaults::batch_timeout")]
    pub batch_timeout_secs: u64,

    /// Store extracted text in committed documents
    #[serde(default = "defaults::enabled")]
    pub index_full_text: bool,
}

impl PipelineConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn batch_timeout(&self) -> Duration {
        Duration::from_secs(self.batch_timeout_secs)
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            filter_workers: defaults::filter_workers(),
            transform_workers: defaults::transform_workers(),
            index_workers: defaults::index_workers(),
            queue_capacity: defaults::queue_capacity(),
            poll_interval_ms: defaults::poll_interval(),
            batch_timeout_secs: defaults::batch_timeout(),
            index_full_text: defaults::enabled(),
        }
    }
}

/// Lock table settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    /// Holder token written into every lock this process takes
    #[serde(default = "defaults::lock_owner")]
    pub owner: String,

    /// Lifetime of a lock since its last check-in
    #[serde(default = "defaults::lock_ttl")]
    pub ttl_ms: u64,

    /// Check-in interval for held locks
    #[serde(default = "defaults::lock_keepalive")]
    pub keepalive_ms: u64,

    /// Interval between stale-lock sweeps
    #[serde(default = "defaults::lock_sweep")]
    pub sweep_interval_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            owner: defaults::lock_owner(),
            ttl_ms: defaults::lock_ttl(),
            keepalive_ms: defaults::lock_keepalive(),
            sweep_interval_ms: defaults::lock_sweep(),
        }
    }
}

/// Rule files, relative to the storage directory.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RulesConfig {
    /// `+prefix` / `-prefix` lines
    #[serde(default)]
    pub surt_filter: Option<String>,

    /// JSON array of access rules
    #[serde(default)]
    pub access_rules: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OnDemandConfig {
    /// Poll interval while `stop` drains outstanding requests
    #[serde(default = "defaults::stop_poll")]
    pub stop_poll_ms: u64,

    /// Attempts made when the record is locked elsewhere
    #[serde(default = "defaults::lock_retries")]
    pub lock_retries: u32,

    #[serde(default = "defaults::lock_retry_delay")]
    pub lock_retry_delay_ms: u64,
}

impl Default for OnDemandConfig {
    fn default() -> Self {
        Self {
            stop_poll_ms: defaults::stop_poll(),
            lock_retries: defaults::lock_retries(),
            lock_retry_delay_ms: defaults::lock_retry_delay(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FullReindexConfig {
    #[serde(default)]
    pub min_id: u64,

    /// Unbounded when absent
    #[serde(default)]
    pub max_id: Option<u64>,

    /// Ids requested from the record source per round
    #[serde(default = "defaults::batch_size")]
    pub batch_size: usize,

    /// Batches allowed in flight before the sweep waits
    #[serde(default = "defaults::queue_limit")]
    pub queue_limit: usize,

    /// Only ids with `id % modulo_divisor == modulo_remainder` are indexed
    #[serde(default = "defaults::modulo_divisor")]
    pub modulo_divisor: u64,

    #[serde(default)]
    pub modulo_remainder: u64,

    /// Delay before a lock-deferred record is enqueued again
    #[serde(default = "defaults::retry_delay")]
    pub retry_delay_secs: u64,
}

impl Default for FullReindexConfig {
    fn default() -> Self {
        Self {
            min_id: 0,
            max_id: None,
            batch_size: defaults::batch_size(),
            queue_limit: defaults::queue_limit(),
            modulo_divisor: defaults::modulo_divisor(),
            modulo_remainder: 0,
            retry_delay_secs: defaults::retry_delay(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeriodicConfig {
    #[serde(default)]
    pub start_hour: u32,

    #[serde(default)]
    pub start_minute: u32,

    #[serde(default)]
    pub stop_hour: u32,

    #[serde(default)]
    pub stop_minute: u32,

    /// When false the window is ignored and the strategy always runs
    #[serde(default)]
    pub limit_running_time: bool,

    /// Sleep between window checks while outside the window
    #[serde(default = "defaults::wait_interval")]
    pub wait_interval_secs: u64,

    /// Sleep when the record source has nothing new
    #[serde(default = "defaults::idle_poll")]
    pub idle_poll_secs: u64,

    /// Delay before restarting after an unrequested stop
    #[serde(default = "defaults::restart_delay")]
    pub restart_delay_secs: u64,

    #[serde(default = "defaults::batch_size")]
    pub batch_size: usize,
}

impl Default for PeriodicConfig {
    fn default() -> Self {
        Self {
            start_hour: 0,
            start_minute: 0,
            stop_hour: 0,
            stop_minute: 0,
            limit_running_time: false,
            wait_interval_secs: defaults::wait_interval(),
            idle_poll_secs: defaults::idle_poll(),
            restart_delay_secs: defaults::restart_delay(),
            batch_size: defaults::batch_size(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleRecheckConfig {
    /// Local time of the daily run
    #[serde(default = "defaults::recheck_hour")]
    pub schedule_hour: u32,

    #[serde(default)]
    pub schedule_minute: u32,

    /// Documents rechecked concurrently
    #[serde(default = "defaults::recheck_workers")]
    pub workers: usize,

    /// Published rules, relative to the storage directory; falls back to
    /// `rules.access_rules`
    #[serde(default)]
    pub feed: Option<String>,
}

impl Default for RuleRecheckConfig {
    fn default() -> Self {
        Self {
            schedule_hour: defaults::recheck_hour(),
            schedule_minute: 0,
            workers: defaults::recheck_workers(),
            feed: None,
        }
    }
}

mod defaults {
    // Pipeline defaults
    pub fn filter_workers() -> usize {
        4
    }
    pub fn transform_workers() -> usize {
        4
    }
    pub fn index_workers() -> usize {
        2
    }
    pub fn queue_capacity() -> usize {
        1000
    }
    pub fn poll_interval() -> u64 {
        100
    }
    pub fn batch_timeout() -> u64 {
        3600
    }
    pub fn enabled() -> bool {
        true
    }

    // Lock defaults
    pub fn lock_owner() -> String {
        format!("indexer-{}", std::process::id())
    }
    pub fn lock_ttl() -> u64 {
        120_000
    }
    pub fn lock_keepalive() -> u64 {
        5_000
    }
    pub fn lock_sweep() -> u64 {
        300_000
    }

    // On-demand defaults
    pub fn stop_poll() -> u64 {
        1_000
    }
    pub fn lock_retries() -> u32 {
        3
    }
    pub fn lock_retry_delay() -> u64 {
        1_000
    }

    // Full reindex defaults
    pub fn batch_size() -> usize {
        100
    }
    pub fn queue_limit() -> usize {
        5
    }
    pub fn modulo_divisor() -> u64 {
        1
    }
    pub fn retry_delay() -> u64 {
        300
    }

    // Periodic defaults
    pub fn wait_interval() -> u64 {
        60
    }
    pub fn idle_poll() -> u64 {
        60
    }
    pub fn restart_delay() -> u64 {
        60
    }

    // Rule recheck defaults
    pub fn recheck_hour() -> u32 {
        2
    }
    pub fn recheck_workers() -> usize {
        5
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.locks.ttl_ms, 120_000);
        assert_eq!(config.full_reindex.batch_size, 100);
        assert_eq!(config.full_reindex.queue_limit, 5);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            indexing_disabled = true

            [pipeline]
            filter_workers = 1

            [periodic]
            start_hour = 22
            stop_hour = 6
            limit_running_time = true
            "#,
        )
        .unwrap();

        assert!(config.indexing_disabled);
        assert_eq!(config.pipeline.filter_workers, 1);
        assert_eq!(config.pipeline.index_workers, 2);
        assert_eq!(config.periodic.start_hour, 22);
        assert_eq!(config.periodic.wait_interval_secs, 60);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_window() {
        let mut config = Config::default();
        config.periodic.stop_minute = 60;
        assert!(matches!(config.validate(), Err(AppError::Validation(_))));

        let mut config = Config::default();
        config.periodic.start_hour = 24;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_modulo() {
        let mut config = Config::default();
        config.full_reindex.modulo_divisor = 4;
        config.full_reindex.modulo_remainder = 4;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rule_recheck_settings() {
        let config: Config = toml::from_str(
            r#"
            [rule_recheck]
            schedule_hour = 23
            schedule_minute = 30
            feed = "rules/published.json"
            "#,
        )
        .unwrap();
        assert_eq!(config.rule_recheck.workers, 5);
        assert_eq!(config.rule_recheck.feed.as_deref(), Some("rules/published.json"));
        assert!(config.validate().is_ok());
        assert_eq!(Config::default().rule_recheck.schedule_hour, 2);

        let mut config = Config::default();
        config.rule_recheck.schedule_minute = 60;
        assert!(config.validate().is_err());
        let mut config = Config::default();
        config.rule_recheck.workers = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_or_default_on_missing_file() {
        let config = Config::load_or_default("/nonexistent/config.toml");
        assert_eq!(config.pipeline.queue_capacity, 1000);
    }
}
