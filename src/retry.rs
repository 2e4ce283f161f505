//! Retry with exponential backoff for blocking operations.
//!
//! A [`RetryPolicy`] re-runs a failing operation after `initial_delay`,
//! multiplying the delay by `backoff_multiplier` after each attempt and
//! capping it at `max_delay`. With jitter enabled each sleep is stretched by a
//! random 0-100% so that workers that failed together do not retry together.
//!
//! # Example
//!
//! ```rust
//! use rate_guard_runner::retry::{retry, RetryPolicy};
//! use std::time::Duration;
//!
//! let policy = RetryPolicy::new(3, Duration::from_millis(1)).with_jitter(false);
//! let mut calls = 0;
//!
//! let result: Result<u32, &str> = retry(&policy, || {
//!     calls += 1;
//!     if calls < 3 { Err("busy") } else { Ok(calls) }
//! });
//!
//! assert_eq!(result, Ok(3));
//! ```

use std::fmt;
use std::thread;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// How often and how patiently to retry a failing operation.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt; `0` disables retrying
    max_attempts: u32,
    initial_delay: Duration,
    max_delay: Duration,
    backoff_multiplier: f64,
    jitter: bool,
}

impl Default for RetryPolicy {
    /// Three retries starting at one second, doubling up to a minute, with jitter.
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Creates a policy retrying up to `max_attempts` times, starting at
    /// `initial_delay` and doubling.
    pub fn new(max_attempts: u32, initial_delay: Duration) -> Self {
        RetryPolicy {
            max_attempts,
            initial_delay,
            max_delay: initial_delay.max(Duration::from_secs(60)),
            ..Self::default()
        }
    }

    /// A policy that never retries.
    pub fn none() -> Self {
        Self::new(0, Duration::ZERO)
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Sets the growth factor between consecutive delays. Values below `1.0`
    /// are treated as `1.0`.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = if multiplier.is_finite() { multiplier.max(1.0) } else { 1.0 };
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay before retry number `retry` (1-based), without jitter.
    ///
    /// ```rust
    /// use rate_guard_runner::retry::RetryPolicy;
    /// use std::time::Duration;
    ///
    /// let policy = RetryPolicy::new(5, Duration::from_millis(100))
    ///     .with_max_delay(Duration::from_millis(300));
    ///
    /// assert_eq!(policy.delay_for(1), Duration::from_millis(100));
    /// assert_eq!(policy.delay_for(2), Duration::from_millis(200));
    /// assert_eq!(policy.delay_for(3), Duration::from_millis(300));
    /// ```
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        Duration::try_from_secs_f64(secs)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Delay actually slept before retry number `retry`: [`delay_for`](Self::delay_for)
    /// plus jitter when enabled. Never overflows; saturates at [`Duration::MAX`].
    pub fn jittered_delay_for(&self, retry: u32) -> Duration {
        let delay = self.delay_for(retry);
        if self.jitter {
            add_jitter(delay)
        } else {
            delay
        }
    }
}

/// Stretches `delay` by a uniformly random 0-100%.
fn add_jitter(delay: Duration) -> Duration {
    let jitter_factor: f64 = rand::thread_rng().gen_range(0.0..=1.0);
    stretch(delay, jitter_factor)
}

/// `delay * (1 + factor)`, saturating at [`Duration::MAX`].
fn stretch(delay: Duration, factor: f64) -> Duration {
    Duration::try_from_secs_f64(delay.as_secs_f64() * (1.0 + factor)).unwrap_or(Duration::MAX)
}

/// Runs `operation`, retrying every error according to `policy`.
///
/// Returns the first success or the error of the last attempt.
pub fn retry<T, E, F>(policy: &RetryPolicy, operation: F) -> Result<T, E>
where
    F: FnMut() -> Result<T, E>,
    E: fmt::Display,
{
    retry_when(policy, operation, |_| true)
}

/// Runs `operation`, retrying only errors for which `should_retry` is true.
pub fn retry_when<T, E, F, P>(policy: &RetryPolicy, mut operation: F, should_retry: P) -> Result<T, E>
where
    F: FnMut() -> Result<T, E>,
    P: Fn(&E) -> bool,
    E: fmt::Display,
{
    let mut retries = 0;

    loop {
        match operation() {
            Ok(value) => {
                if retries > 0 {
                    tracing::info!(attempts = retries + 1, "operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) if retries < policy.max_attempts && should_retry(&e) => {
                retries += 1;
                let delay = policy.jittered_delay_for(retries);
                tracing::warn!(
                    error = %e,
                    attempt = retries,
                    max_attempts = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    "operation failed, retrying"
                );
                thread::sleep(delay);
            }
            Err(e) => {
                if retries > 0 {
                    tracing::warn!(
                        error = %e,
                        attempts = retries + 1,
                        "operation failed after all retry attempts"
                    );
                }
                return Err(e);
            }
        }
    }
}

/// Serializable form of [`RetryPolicy`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay_secs: f64,
    pub max_delay_secs: f64,
    pub backoff_multiplier: f64,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            max_attempts: 3,
            initial_delay_secs: 1.0,
            max_delay_secs: 60.0,
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

fn seconds(field: &'static str, value: f64) -> Result<Duration, ConfigError> {
    if !value.is_finite() || value < 0.0 {
        return Err(ConfigError::InvalidRetry {
            field,
            reason: format!("expected a non-negative number of seconds, got {value}"),
        });
    }
    Duration::try_from_secs_f64(value).map_err(|e| ConfigError::InvalidRetry {
        field,
        reason: e.to_string(),
    })
}

impl TryFrom<RetryConfig> for RetryPolicy {
    type Error = ConfigError;

    fn try_from(config: RetryConfig) -> Result<Self, Self::Error> {
        let initial_delay = seconds("initial_delay_secs", config.initial_delay_secs)?;
        let max_delay = seconds("max_delay_secs", config.max_delay_secs)?;
        if max_delay < initial_delay {
            return Err(ConfigError::InvalidRetry {
                field: "max_delay_secs",
                reason: "must not be smaller than initial_delay_secs".to_string(),
            });
        }
        if !config.backoff_multiplier.is_finite() || config.backoff_multiplier < 1.0 {
            return Err(ConfigError::InvalidRetry {
                field: "backoff_multiplier",
                reason: format!("must be at least 1.0, got {}", config.backoff_multiplier),
            });
        }

        Ok(RetryPolicy {
            max_attempts: config.max_attempts,
            initial_delay,
            max_delay,
            backoff_multiplier: config.backoff_multiplier,
            jitter: config.jitter,
        })
    }
}
