//! Progress tracking for concurrent runs.
//!
//! A [`ProgressTracker`] is shared by every worker of a run. All three counters
//! live behind one mutex, so a [`ProgressSnapshot`] is never torn between
//! an update of `completed` and one of `failed`.

use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Thread-safe completed/failed/total counters for one or more runs.
///
/// # Example
///
/// ```rust
/// use rate_guard_runner::ProgressTracker;
///
/// let tracker = ProgressTracker::new(4);
/// tracker.increment_completed();
/// tracker.increment_failed();
///
/// let snapshot = tracker.snapshot();
/// assert_eq!((snapshot.completed, snapshot.failed, snapshot.total), (1, 1, 4));
/// assert_eq!(tracker.percent_complete(), 50.0);
/// ```
#[derive(Debug)]
pub struct ProgressTracker {
    counts: Mutex<Counts>,
    started_at: Instant,
    report: bool,
}

#[derive(Debug, Default, Clone, Copy)]
struct Counts {
    total: u64,
    completed: u64,
    failed: u64,
}

impl Counts {
    fn processed(&self) -> u64 {
        self.completed + self.failed
    }

    /// Grows `total` by one if the next increment would overtake it.
    fn make_room(&mut self) {
        if self.processed() >= self.total {
            tracing::debug!(total = self.total, "progress total grown to fit an extra task");
            self.total = self.processed() + 1;
        }
    }
}

/// Counter values read under a single lock acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProgressSnapshot {
    pub completed: u64,
    pub failed: u64,
    pub total: u64,
}

impl ProgressSnapshot {
    /// `completed + failed`.
    pub fn processed(&self) -> u64 {
        self.completed + self.failed
    }

    /// Fraction of `total` processed, in `0.0..=1.0`. Zero when `total` is zero.
    pub fn fraction_complete(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.processed() as f64 / self.total as f64
        }
    }

    /// True once every counted task has finished.
    pub fn is_finished(&self) -> bool {
        self.processed() == self.total
    }
}

impl From<Counts> for ProgressSnapshot {
    fn from(counts: Counts) -> Self {
        ProgressSnapshot {
            completed: counts.completed,
            failed: counts.failed,
            total: counts.total,
        }
    }
}

/// A snapshot together with the time elapsed since the tracker was created.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressSummary {
    pub snapshot: ProgressSnapshot,
    pub elapsed: Duration,
}

impl ProgressSummary {
    /// Successful tasks as a percentage of `total`, `0.0` when `total` is zero.
    pub fn success_rate(&self) -> f64 {
        if self.snapshot.total == 0 {
            0.0
        } else {
            self.snapshot.completed as f64 / self.snapshot.total as f64 * 100.0
        }
    }

    /// Successful tasks per second of elapsed time, `0.0` before any time has passed.
    pub fn tasks_per_second(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.snapshot.completed as f64 / secs
        } else {
            0.0
        }
    }

    /// Time left at the average pace so far, or `None` until a task has finished.
    pub fn estimated_remaining(&self) -> Option<Duration> {
        let processed = self.snapshot.processed();
        if processed == 0 {
            return None;
        }
        let remaining = self.snapshot.total.saturating_sub(processed);
        let per_task = self.elapsed.as_secs_f64() / processed as f64;
        Some(Duration::try_from_secs_f64(per_task * remaining as f64).unwrap_or(Duration::MAX))
    }
}

impl fmt::Display for ProgressSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Total: {}, Success: {}, Failed: {}, Duration: {:.2}s",
            self.snapshot.total,
            self.snapshot.completed,
            self.snapshot.failed,
            self.elapsed.as_secs_f64()
        )
    }
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new(0)
    }
}

impl ProgressTracker {
    /// Creates a silent tracker expecting `total` tasks.
    pub fn new(total: u64) -> Self {
        ProgressTracker {
            counts: Mutex::new(Counts {
                total,
                ..Counts::default()
            }),
            started_at: Instant::now(),
            report: false,
        }
    }

    /// Creates a tracker that emits an `info` event every time a task finishes.
    pub fn reporting(total: u64) -> Self {
        ProgressTracker {
            report: true,
            ..Self::new(total)
        }
    }

    /// Whether [`task_done`](Self::task_done) emits progress events.
    pub fn is_reporting(&self) -> bool {
        self.report
    }

    fn lock_counts(&self) -> MutexGuard<'_, Counts> {
        self.counts.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Counts one successful task.
    pub fn increment_completed(&self) {
        self.task_done(true);
    }

    /// Counts one failed task.
    pub fn increment_failed(&self) {
        self.task_done(false);
    }

    /// Counts one finished task and returns the counters after the update.
    ///
    /// If the tracker was built with [`reporting`](Self::reporting), a progress
    /// event is logged with the processed count, the percentage, the elapsed
    /// time and an estimate of the time remaining.
    pub fn task_done(&self, success: bool) -> ProgressSnapshot {
        let snapshot: ProgressSnapshot = {
            let mut counts = self.lock_counts();
            counts.make_room();
            if success {
                counts.completed += 1;
            } else {
                counts.failed += 1;
            }
            (*counts).into()
        };

        if self.report {
            let summary = ProgressSummary {
                snapshot,
                elapsed: self.elapsed(),
            };
            tracing::info!(
                processed = snapshot.processed(),
                total = snapshot.total,
                percent = snapshot.fraction_complete() * 100.0,
                success = snapshot.completed,
                failed = snapshot.failed,
                elapsed_secs = summary.elapsed.as_secs_f64(),
                eta_secs = summary.estimated_remaining().map_or(0.0, |eta| eta.as_secs_f64()),
                "progress"
            );
        }
        snapshot
    }

    /// Reads all counters atomically.
    pub fn snapshot(&self) -> ProgressSnapshot {
        (*self.lock_counts()).into()
    }

    /// Percentage of `total` processed, `0.0` when `total` is zero.
    pub fn percent_complete(&self) -> f64 {
        self.snapshot().fraction_complete() * 100.0
    }

    /// Raises `total` so that `additional` more tasks fit without growing it
    /// again. Never lowers `total`.
    pub fn ensure_room_for(&self, additional: u64) {
        let mut counts = self.lock_counts();
        let needed = counts.processed().saturating_add(additional);
        if counts.total < needed {
            counts.total = needed;
        }
    }

    /// Time since the tracker was created.
    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Current counters with the elapsed time.
    pub fn summary(&self) -> ProgressSummary {
        ProgressSummary {
            snapshot: self.snapshot(),
            elapsed: self.elapsed(),
        }
    }
}
