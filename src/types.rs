//! Outcome types returned by the task runner.
//!
//! A run returns exactly one [`TaskOutcome`] per input item, at the item's
//! input position.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::progress::ProgressSnapshot;

/// How the work of a run was executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// The worker function ran on the pool threads.
    #[default]
    Thread,
    /// Each item ran in a child process supervised by a pool thread.
    Process,
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionMode::Thread => write!(f, "thread"),
            ExecutionMode::Process => write!(f, "process"),
        }
    }
}

/// Why a dispatched item failed.
#[derive(Debug)]
pub enum FailureCause<E> {
    /// The worker returned an error (after any retries).
    Error(E),
    /// The worker panicked; holds the panic message when it was a string.
    Panic(String),
}

impl<E: fmt::Display> fmt::Display for FailureCause<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureCause::Error(e) => write!(f, "{e}"),
            FailureCause::Panic(msg) => write!(f, "worker panicked: {msg}"),
        }
    }
}

/// A failed item together with the cause of its failure.
#[derive(Debug)]
pub struct TaskFailure<T, E> {
    /// Position of the item in the input.
    pub index: usize,
    /// The item the worker was invoked with.
    pub item: T,
    pub cause: FailureCause<E>,
    /// Number of times the worker was invoked for this item, retries included.
    pub attempts: u32,
}

impl<T, E: fmt::Display> fmt::Display for TaskFailure<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "task {} failed after {} attempt(s): {}",
            self.index, self.attempts, self.cause
        )
    }
}

/// Result of one input item.
#[derive(Debug)]
pub enum TaskOutcome<T, R, E> {
    /// The worker returned a value.
    Completed(R),
    /// The worker returned an error or panicked.
    Failed(TaskFailure<T, E>),
    /// The run was cancelled before this item was dispatched.
    NotAttempted(T),
}

impl<T, R, E> TaskOutcome<T, R, E> {
    pub fn is_completed(&self) -> bool {
        matches!(self, TaskOutcome::Completed(_))
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, TaskOutcome::Failed(_))
    }

    pub fn is_not_attempted(&self) -> bool {
        matches!(self, TaskOutcome::NotAttempted(_))
    }

    /// The success value, if any.
    pub fn value(&self) -> Option<&R> {
        match self {
            TaskOutcome::Completed(value) => Some(value),
            _ => None,
        }
    }

    /// Consumes the outcome, returning the success value, if any.
    pub fn into_value(self) -> Option<R> {
        match self {
            TaskOutcome::Completed(value) => Some(value),
            _ => None,
        }
    }

    /// The failure, if any.
    pub fn failure(&self) -> Option<&TaskFailure<T, E>> {
        match self {
            TaskOutcome::Failed(failure) => Some(failure),
            _ => None,
        }
    }

    /// Converts a dispatched outcome into a `Result`; `None` if not attempted.
    pub fn into_result(self) -> Option<Result<R, TaskFailure<T, E>>> {
        match self {
            TaskOutcome::Completed(value) => Some(Ok(value)),
            TaskOutcome::Failed(failure) => Some(Err(failure)),
            TaskOutcome::NotAttempted(_) => None,
        }
    }
}

/// Everything a [`TaskRunner`](crate::TaskRunner) run produced.
#[derive(Debug)]
pub struct RunReport<T, R, E> {
    /// One outcome per input item, in input order.
    pub outcomes: Vec<TaskOutcome<T, R, E>>,
    /// Tracker counters when the run finished.
    pub progress: ProgressSnapshot,
    /// True if cancellation or the deadline stopped dispatch early.
    pub cancelled: bool,
    pub mode: ExecutionMode,
}

impl<T, R, E> RunReport<T, R, E> {
    pub fn into_outcomes(self) -> Vec<TaskOutcome<T, R, E>> {
        self.outcomes
    }

    /// Number of items whose worker succeeded.
    pub fn completed_count(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_completed()).count()
    }

    /// Number of items whose worker failed.
    pub fn failed_count(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_failed()).count()
    }

    /// Input positions of items that were never dispatched.
    pub fn not_attempted_indices(&self) -> Vec<usize> {
        self.outcomes
            .iter()
            .enumerate()
            .filter(|(_, o)| o.is_not_attempted())
            .map(|(i, _)| i)
            .collect()
    }

    /// Input positions of items that failed.
    pub fn failed_indices(&self) -> Vec<usize> {
        self.outcomes
            .iter()
            .filter_map(|o| o.failure().map(|f| f.index))
            .collect()
    }
}
