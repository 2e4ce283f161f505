//! Bounded-parallelism execution of a worker over a list of items.
//!
//! The runner hands items to a fixed-size pool of worker threads, stores every
//! outcome at the item's input position and updates a
//! [`ProgressTracker`](crate::ProgressTracker) as items finish.
//!
//! # Execution modes
//!
//! - **Thread** ([`TaskRunner::run`], [`run_concurrently`]): the worker closure
//!   runs on the pool threads. It may borrow shared state such as a
//!   [`RateLimiter`](crate::RateLimiter).
//! - **Process** ([`TaskRunner::run_processes`]): each item runs in a child
//!   process started from a [`ProcessWorker`]. Items and results cross the
//!   process boundary as JSON, so nothing in memory is shared with the child.
//!   In particular a `RateLimiter` cannot gate work done inside children.
//!
//! # Failure Policy
//!
//! | Situation | Effect |
//! |-----------|--------|
//! | worker returns `Err` | item recorded as `Failed`, run continues |
//! | worker panics | item recorded as `Failed(Panic)`, run continues |
//! | cancellation / deadline | queued items returned as `NotAttempted` |
//! | `max_workers == 0` | run rejected with [`RunnerError::Config`](crate::RunnerError::Config) |
//! | pool cannot be built | run rejected with [`RunnerError::PoolConstruction`](crate::RunnerError::PoolConstruction) |

pub mod task_runner;
pub use task_runner::{default_max_workers, run_concurrently, RunnerConfig, TaskRunner};

#[cfg(feature = "process")]
pub mod process_worker;
#[cfg(feature = "process")]
pub use process_worker::ProcessWorker;
