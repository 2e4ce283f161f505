//! error.rs
//! Error types for configuration, permit acquisition, runs and process-mode tasks.
//!
//! Only [`ConfigError`] and [`RunnerError`] stop a run. Failures of a single
//! item never surface here; they are recorded in that item's
//! [`TaskOutcome`](crate::TaskOutcome).

use std::time::Duration;
use thiserror::Error;

/// Invalid construction arguments or an unreadable configuration source.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// `max_requests` must allow at least one permit per window.
    #[error("max_requests must be at least 1, got {0}")]
    InvalidMaxRequests(u32),

    /// The window length must be a finite, positive number of seconds.
    #[error("per_seconds must be a finite number greater than 0, got {0}")]
    InvalidWindow(f64),

    /// A pool needs at least one worker.
    #[error("max_workers must be at least 1, got {0}")]
    InvalidMaxWorkers(usize),

    /// A run deadline must be a finite, non-negative number of seconds.
    #[error("deadline_secs must be a finite number of seconds, got {0}")]
    InvalidDeadline(f64),

    /// Retry settings out of range.
    #[error("invalid retry setting `{field}`: {reason}")]
    InvalidRetry {
        /// The offending setting.
        field: &'static str,
        /// Why it was rejected.
        reason: String,
    },

    /// The configuration text is not valid TOML for [`Config`](crate::Config).
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// The configuration file could not be read.
    #[error("failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors returned to a caller waiting on a [`RateLimiter`](crate::RateLimiter).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RateLimitError {
    /// No permit became available before the caller's timeout elapsed.
    #[error("no permit available within {waited:?}")]
    Timeout {
        /// How long the caller blocked before giving up.
        waited: Duration,
    },

    /// Every permit in the current window is taken (non-blocking path).
    #[error("rate limit exhausted, next permit in {retry_after:?}")]
    Exhausted {
        /// Time until the oldest grant leaves the window.
        retry_after: Duration,
    },
}

/// Errors that prevent a run from starting.
#[derive(Debug, Error)]
pub enum RunnerError {
    /// The runner was given invalid settings.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The worker pool could not be built.
    #[error("failed to construct worker pool: {0}")]
    PoolConstruction(#[from] rayon::ThreadPoolBuildError),
}

/// Per-item failure of a process-mode task.
#[cfg(feature = "process")]
#[derive(Debug, Error)]
pub enum ProcessTaskError {
    /// The item could not be serialised for the child.
    #[error("failed to encode item: {0}")]
    Encode(#[source] serde_json::Error),

    /// The child process could not be started.
    #[error("failed to spawn `{program}`: {source}")]
    Spawn {
        /// Program that was being started.
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// Writing the item or collecting the child's output failed.
    #[error("I/O error while talking to child: {0}")]
    Io(#[from] std::io::Error),

    /// The child exited unsuccessfully.
    #[error("child exited with {}: {stderr}", describe_exit(.code))]
    ExitStatus {
        /// Exit code, or `None` if the child was killed by a signal.
        code: Option<i32>,
        /// Captured standard error, lossily decoded and trimmed.
        stderr: String,
    },

    /// The child's stdout was not a valid JSON result.
    #[error("failed to decode child output: {0}")]
    Decode(#[source] serde_json::Error),
}

#[cfg(feature = "process")]
fn describe_exit(code: &Option<i32>) -> String {
    match code {
        Some(c) => format!("status {c}"),
        None => "a signal".to_string(),
    }
}

/// Umbrella error for callers that want a single error type.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    RateLimit(#[from] RateLimitError),

    #[error(transparent)]
    Runner(RunnerError),
}

impl From<RunnerError> for Error {
    fn from(err: RunnerError) -> Self {
        match err {
            RunnerError::Config(e) => Error::Config(e),
            other => Error::Runner(other),
        }
    }
}
