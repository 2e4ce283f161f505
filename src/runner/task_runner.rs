use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::cancel::CancellationFlag;
use crate::error::{ConfigError, RunnerError};
use crate::progress::ProgressTracker;
use crate::retry::{self, RetryPolicy};
use crate::types::{ExecutionMode, FailureCause, RunReport, TaskFailure, TaskOutcome};

#[cfg(feature = "process")]
use super::process_worker::ProcessWorker;
#[cfg(feature = "process")]
use crate::error::ProcessTaskError;

/// Default pool size for I/O-bound work: the number of CPUs plus four,
/// capped at 32.
pub fn default_max_workers() -> usize {
    let cpus = thread::available_parallelism().map_or(1, usize::from);
    (cpus + 4).min(32)
}

/// Runs `worker_fn` over `items` on up to `max_workers` threads.
///
/// Returns one outcome per item, in input order. A worker error or panic is
/// recorded for that item only; the remaining items still run. If `tracker`
/// is given it is updated as items finish, and its total is raised if needed
/// to fit this run.
///
/// # Errors
///
/// * [`RunnerError::Config`] if `max_workers` is zero
/// * [`RunnerError::PoolConstruction`] if the worker threads cannot be started
///
/// # Example
///
/// ```rust
/// use rate_guard_runner::{run_concurrently, ProgressTracker, RateLimiter};
///
/// let limiter = RateLimiter::new(100, 1.0).unwrap();
/// let tracker = ProgressTracker::new(5);
///
/// let outcomes = run_concurrently(
///     vec![1, 2, 3, 4, 5],
///     |n: &i32| -> Result<i32, String> {
///         let _permit = limiter.acquire();
///         if *n == 3 { Err("three".to_string()) } else { Ok(n * 10) }
///     },
///     2,
///     Some(&tracker),
/// )
/// .unwrap();
///
/// assert_eq!(outcomes[0].value(), Some(&10));
/// assert!(outcomes[2].is_failed());
/// assert_eq!(tracker.snapshot().failed, 1);
/// ```
pub fn run_concurrently<T, R, E, F>(
    items: Vec<T>,
    worker_fn: F,
    max_workers: usize,
    tracker: Option<&ProgressTracker>,
) -> Result<Vec<TaskOutcome<T, R, E>>, RunnerError>
where
    T: Send,
    R: Send,
    E: Send + fmt::Display,
    F: Fn(&T) -> Result<R, E> + Sync,
{
    let runner = TaskRunner::new(max_workers)?;
    let report = runner.dispatch(
        items,
        ExecutionMode::Thread,
        tracker,
        worker_fn,
        retry_all::<E>,
    )?;
    Ok(report.outcomes)
}

/// Configurable runner; see the [module docs](super) for the execution model.
///
/// # Example
///
/// ```rust
/// use rate_guard_runner::{CancellationFlag, TaskRunner};
/// use std::time::Duration;
///
/// let cancel = CancellationFlag::new();
/// let runner = TaskRunner::new(4)
///     .unwrap()
///     .with_cancellation(cancel.clone())
///     .with_deadline(Duration::from_secs(30));
///
/// let report = runner
///     .run((0..10).collect(), |n: &u32| Ok::<_, String>(n * 2))
///     .unwrap();
///
/// assert_eq!(report.completed_count(), 10);
/// assert!(!report.cancelled);
/// ```
#[derive(Debug, Clone)]
pub struct TaskRunner {
    /// Upper bound on concurrently running items
    max_workers: usize,
    /// Shared tracker; a fresh one is created per run when absent
    tracker: Option<Arc<ProgressTracker>>,
    cancel: Option<CancellationFlag>,
    /// Wall-clock budget measured from the start of each run
    deadline: Option<Duration>,
    retry: Option<RetryPolicy>,
    show_progress: bool,
}

impl TaskRunner {
    /// Creates a runner with at most `max_workers` items in flight.
    ///
    /// # Errors
    ///
    /// [`ConfigError::InvalidMaxWorkers`] if `max_workers` is zero.
    pub fn new(max_workers: usize) -> Result<Self, ConfigError> {
        if max_workers == 0 {
            return Err(ConfigError::InvalidMaxWorkers(max_workers));
        }
        Ok(TaskRunner {
            max_workers,
            tracker: None,
            cancel: None,
            deadline: None,
            retry: None,
            show_progress: false,
        })
    }

    /// Builds a runner from its serializable configuration.
    pub fn from_config(config: &RunnerConfig) -> Result<Self, ConfigError> {
        let mut runner = TaskRunner::new(config.max_workers.unwrap_or_else(default_max_workers))?;
        runner.show_progress = config.show_progress;

        if let Some(secs) = config.deadline_secs {
            if !secs.is_finite() || secs < 0.0 {
                return Err(ConfigError::InvalidDeadline(secs));
            }
            let deadline =
                Duration::try_from_secs_f64(secs).map_err(|_| ConfigError::InvalidDeadline(secs))?;
            runner.deadline = Some(deadline);
        }
        Ok(runner)
    }

    /// Reports into `tracker` instead of a per-run tracker.
    pub fn with_tracker(mut self, tracker: Arc<ProgressTracker>) -> Self {
        self.tracker = Some(tracker);
        self
    }

    /// Stops dispatching new items once `cancel` is raised.
    pub fn with_cancellation(mut self, cancel: CancellationFlag) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Stops dispatching new items once `deadline` has passed since the run started.
    ///
    /// When the deadline fires, the flag given to
    /// [`with_cancellation`](Self::with_cancellation) is raised as well.
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Retries failing worker calls before recording them as failed.
    /// Panics are never retried. [`run`](Self::run) retries every error;
    /// [`run_retrying_if`](Self::run_retrying_if) retries only the errors a
    /// predicate accepts.
    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    /// Logs a progress event per finished item and a summary per run.
    ///
    /// Applies to the per-run tracker; a tracker passed with
    /// [`with_tracker`](Self::with_tracker) keeps its own setting.
    pub fn show_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// The shared tracker, if one was configured.
    pub fn tracker(&self) -> Option<&Arc<ProgressTracker>> {
        self.tracker.as_ref()
    }

    /// Runs `worker_fn` over `items` on the pool threads.
    ///
    /// # Errors
    ///
    /// [`RunnerError::PoolConstruction`] if the pool cannot be built. Per-item
    /// failures are reported in the returned [`RunReport`].
    pub fn run<T, R, E, F>(&self, items: Vec<T>, worker_fn: F) -> Result<RunReport<T, R, E>, RunnerError>
    where
        T: Send,
        R: Send,
        E: Send + fmt::Display,
        F: Fn(&T) -> Result<R, E> + Sync,
    {
        self.dispatch(
            items,
            ExecutionMode::Thread,
            self.tracker.as_deref(),
            worker_fn,
            retry_all::<E>,
        )
    }

    /// Like [`run`](Self::run), but only errors for which `should_retry`
    /// returns true are retried under the configured [`RetryPolicy`]. Other
    /// errors fail the item on their first occurrence.
    ///
    /// # Example
    ///
    /// ```rust
    /// use rate_guard_runner::{RetryPolicy, TaskRunner};
    /// use std::time::Duration;
    ///
    /// let runner = TaskRunner::new(2)
    ///     .unwrap()
    ///     .with_retry(RetryPolicy::new(3, Duration::from_millis(1)));
    ///
    /// // A 4xx-style error is permanent and fails without retrying
    /// let report = runner
    ///     .run_retrying_if(
    ///         vec![404u16],
    ///         |status: &u16| Err::<(), u16>(*status),
    ///         |status: &u16| *status >= 500,
    ///     )
    ///     .unwrap();
    ///
    /// assert_eq!(report.outcomes[0].failure().map(|f| f.attempts), Some(1));
    /// ```
    pub fn run_retrying_if<T, R, E, F, P>(
        &self,
        items: Vec<T>,
        worker_fn: F,
        should_retry: P,
    ) -> Result<RunReport<T, R, E>, RunnerError>
    where
        T: Send,
        R: Send,
        E: Send + fmt::Display,
        F: Fn(&T) -> Result<R, E> + Sync,
        P: Fn(&E) -> bool + Sync,
    {
        self.dispatch(
            items,
            ExecutionMode::Thread,
            self.tracker.as_deref(),
            worker_fn,
            should_retry,
        )
    }

    /// Runs every item in its own child process started from `worker`.
    ///
    /// At most `max_workers` children are alive at any time.
    #[cfg(feature = "process")]
    pub fn run_processes<T, R>(
        &self,
        items: Vec<T>,
        worker: &ProcessWorker<R>,
    ) -> Result<RunReport<T, R, ProcessTaskError>, RunnerError>
    where
        T: Serialize + Send,
        R: serde::de::DeserializeOwned + Send,
    {
        self.dispatch(
            items,
            ExecutionMode::Process,
            self.tracker.as_deref(),
            |item: &T| worker.run_item(item),
            retry_all::<ProcessTaskError>,
        )
    }

    fn dispatch<T, R, E, F, P>(
        &self,
        items: Vec<T>,
        mode: ExecutionMode,
        tracker: Option<&ProgressTracker>,
        worker_fn: F,
        should_retry: P,
    ) -> Result<RunReport<T, R, E>, RunnerError>
    where
        T: Send,
        R: Send,
        E: Send + fmt::Display,
        F: Fn(&T) -> Result<R, E> + Sync,
        P: Fn(&E) -> bool + Sync,
    {
        let total = items.len();

        let owned_tracker;
        let tracker = match tracker {
            Some(shared) => {
                shared.ensure_room_for(total as u64);
                shared
            }
            None => {
                owned_tracker = if self.show_progress {
                    ProgressTracker::reporting(total as u64)
                } else {
                    ProgressTracker::new(total as u64)
                };
                &owned_tracker
            }
        };

        if total == 0 {
            return Ok(RunReport {
                outcomes: Vec::new(),
                progress: tracker.snapshot(),
                cancelled: false,
                mode,
            });
        }

        let threads = self.max_workers.min(total);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("task-runner-{i}"))
            .build()?;

        tracing::debug!(%mode, items = total, workers = threads, "starting run");

        let deadline = self.deadline.and_then(|d| Instant::now().checked_add(d));
        let queue = Mutex::new(items.into_iter().enumerate());
        let slots: Mutex<Vec<Option<TaskOutcome<T, R, E>>>> =
            Mutex::new((0..total).map(|_| None).collect());

        let work = || loop {
            if self.should_stop(deadline) {
                break;
            }
            let next = lock(&queue).next();
            let Some((index, item)) = next else {
                break;
            };
            let outcome = self.execute(index, item, &worker_fn, &should_retry, tracker);
            lock(&slots)[index] = Some(outcome);
        };

        pool.scope(|scope| {
            for _ in 0..threads {
                scope.spawn(|_| work());
            }
        });

        let mut slots = slots.into_inner().unwrap_or_else(PoisonError::into_inner);
        let mut not_attempted = 0usize;
        for (index, item) in queue.into_inner().unwrap_or_else(PoisonError::into_inner) {
            slots[index] = Some(TaskOutcome::NotAttempted(item));
            not_attempted += 1;
        }

        let outcomes: Vec<_> = slots.into_iter().flatten().collect();
        debug_assert_eq!(outcomes.len(), total);

        let cancelled = not_attempted > 0;
        if cancelled {
            tracing::warn!(%mode, not_attempted, "run stopped before dispatching every item");
        }

        let summary = tracker.summary();
        let success_rate = summary.success_rate();
        let tasks_per_second = summary.tasks_per_second();
        if self.show_progress || tracker.is_reporting() {
            tracing::info!(%mode, %summary, success_rate, tasks_per_second, cancelled, "run finished");
        } else {
            tracing::debug!(%mode, %summary, success_rate, tasks_per_second, cancelled, "run finished");
        }

        Ok(RunReport {
            outcomes,
            progress: summary.snapshot,
            cancelled,
            mode,
        })
    }

    fn should_stop(&self, deadline: Option<Instant>) -> bool {
        if self.cancel.as_ref().map_or(false, CancellationFlag::is_cancelled) {
            return true;
        }
        if !deadline.map_or(false, |deadline| Instant::now() >= deadline) {
            return false;
        }
        if let Some(cancel) = &self.cancel {
            tracing::debug!("run deadline elapsed, raising cancellation flag");
            cancel.cancel();
        }
        true
    }

    /// Runs one item, catching errors and panics, and counts it in `tracker`.
    fn execute<T, R, E, F, P>(
        &self,
        index: usize,
        item: T,
        worker_fn: &F,
        should_retry: &P,
        tracker: &ProgressTracker,
    ) -> TaskOutcome<T, R, E>
    where
        E: fmt::Display,
        F: Fn(&T) -> Result<R, E>,
        P: Fn(&E) -> bool,
    {
        let mut attempts = 0u32;
        let mut call = || {
            attempts += 1;
            worker_fn(&item)
        };
        let attempt = panic::catch_unwind(AssertUnwindSafe(|| match &self.retry {
            Some(policy) => retry::retry_when(policy, &mut call, should_retry),
            None => call(),
        }));

        let cause = match attempt {
            Ok(Ok(value)) => {
                tracker.task_done(true);
                return TaskOutcome::Completed(value);
            }
            Ok(Err(e)) => FailureCause::Error(e),
            Err(payload) => FailureCause::Panic(panic_message(payload.as_ref())),
        };

        tracing::warn!(index, attempts, error = %cause, "task failed");
        tracker.task_done(false);
        TaskOutcome::Failed(TaskFailure {
            index,
            item,
            cause,
            attempts,
        })
    }
}

fn retry_all<E>(_: &E) -> bool {
    true
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Serializable form of the [`TaskRunner`] settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Pool size; [`default_max_workers`] when absent.
    pub max_workers: Option<usize>,
    pub show_progress: bool,
    /// Stop dispatching after this many seconds.
    pub deadline_secs: Option<f64>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        RunnerConfig {
            max_workers: None,
            show_progress: true,
            deadline_secs: None,
        }
    }
}
