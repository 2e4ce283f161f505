//! File-based configuration.
//!
//! Every section is optional; missing sections and fields fall back to their
//! defaults.
//!
//! ```toml
//! [rate_limit]
//! max_requests = 10
//! per_seconds = 1.0
//!
//! [runner]
//! max_workers = 8
//! show_progress = true
//! deadline_secs = 30.0
//!
//! [retry]
//! max_attempts = 3
//! initial_delay_secs = 1.0
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::rate_limiter::{RateLimiter, RateLimiterConfig};
use crate::retry::{RetryConfig, RetryPolicy};
use crate::runner::{RunnerConfig, TaskRunner};

/// Top-level configuration for a limiter, a runner and a retry policy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Shared limiter settings; no limiter is built when absent.
    pub rate_limit: Option<RateLimiterConfig>,
    pub runner: RunnerConfig,
    /// Retry settings; failed items are not retried when absent.
    pub retry: Option<RetryConfig>,
}

impl Config {
    /// Parses a TOML document.
    ///
    /// ```rust
    /// use rate_guard_runner::Config;
    ///
    /// let config = Config::from_toml_str("[runner]\nmax_workers = 3\n").unwrap();
    /// assert_eq!(config.runner.max_workers, Some(3));
    /// assert!(config.rate_limit.is_none());
    /// ```
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Reads and parses a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        tracing::debug!(path = %path.display(), "loaded configuration file");
        Self::from_toml_str(&text)
    }

    /// Builds the configured limiter, if any.
    pub fn rate_limiter(&self) -> Result<Option<RateLimiter>, ConfigError> {
        self.rate_limit
            .clone()
            .map(RateLimiter::try_from)
            .transpose()
    }

    /// Builds the configured runner, with the retry policy attached when present.
    pub fn task_runner(&self) -> Result<TaskRunner, ConfigError> {
        let runner = TaskRunner::from_config(&self.runner)?;
        match self.retry.clone() {
            Some(retry) => Ok(runner.with_retry(RetryPolicy::try_from(retry)?)),
            None => Ok(runner),
        }
    }
}
