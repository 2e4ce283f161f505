//! A bounded-parallelism task runner with a sliding-window rate limiter.
//!
//! This library runs a function over a list of items on a fixed-size pool of
//! worker threads, keeps results in input order, tracks progress, and lets the
//! workers share a rate limiter that caps how often gated work may start.
//!
//! # Quick Start
//!
//! ```rust
//! use rate_guard_runner::{run_concurrently, ProgressTracker, RateLimiter};
//!
//! // At most 50 calls in any trailing second, shared by every worker
//! let limiter = RateLimiter::new(50, 1.0).unwrap();
//! let tracker = ProgressTracker::new(0);
//!
//! let outcomes = run_concurrently(
//!     vec!["a", "b", "c"],
//!     |name: &&str| {
//!         let _permit = limiter.acquire();
//!         Ok::<_, String>(name.to_uppercase())
//!     },
//!     4,
//!     Some(&tracker),
//! )
//! .unwrap();
//!
//! let values: Vec<_> = outcomes.into_iter().filter_map(|o| o.into_value()).collect();
//! assert_eq!(values, ["A", "B", "C"]);
//! assert_eq!(tracker.snapshot().completed, 3);
//! ```
//!
//! # Components
//!
//! ## [Rate Limiter](RateLimiter)
//! Sliding-window limiter; permits are RAII guards:
//! ```rust
//! # use rate_guard_runner::RateLimiter;
//! let limiter = RateLimiter::new(2, 1.0).unwrap(); // 2 permits per second
//! let answer = limiter.run(|| 42);                 // scoped form
//! # assert_eq!(answer, 42);
//! ```
//!
//! ## [Progress Tracker](ProgressTracker)
//! Consistent completed/failed/total counters shared by workers.
//!
//! ## [Task Runner](TaskRunner)
//! Thread mode runs a closure per item; process mode (feature `process`,
//! on by default) runs a [`ProcessWorker`] child per item.
//!
//! ## [Retry](retry)
//! Exponential backoff with jitter, used by the runner or on its own.
//!
//! # Error Handling
//!
//! - [`ConfigError`] - invalid settings, returned at construction
//! - [`RateLimitError`] - a timed or non-blocking acquire found no permit
//! - [`RunnerError`] - a run could not start (bad settings, pool failure)
//! - [`TaskFailure`] - one item failed; carried inside its [`TaskOutcome`]
//!
//! # Thread Safety
//!
//! The limiter ledger and the tracker counters are each guarded by their own
//! mutex. The two locks are never held at the same time.

pub mod cancel;
pub mod config;
pub mod error;
pub mod progress;
pub mod rate_limiter;
pub mod retry;
pub mod runner;
pub mod types;

pub use cancel::CancellationFlag;
pub use config::Config;
pub use error::{ConfigError, Error, RateLimitError, RunnerError};
pub use progress::{ProgressSnapshot, ProgressSummary, ProgressTracker};
pub use rate_limiter::{RateLimitPermit, RateLimiter, RateLimiterConfig};
pub use retry::{RetryConfig, RetryPolicy};
pub use runner::{default_max_workers, run_concurrently, RunnerConfig, TaskRunner};
pub use types::{ExecutionMode, FailureCause, RunReport, TaskFailure, TaskOutcome};

#[cfg(feature = "process")]
pub use error::ProcessTaskError;
#[cfg(feature = "process")]
pub use runner::ProcessWorker;

/// Result type for operations that fail with the crate-level [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
